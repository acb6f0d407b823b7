//! # Load Balancer
//!
//! Least-loaded selection across a connector's READY connections. Ordering is
//! a 3-level tie-break, ascending = most available:
//!
//! 1. fewer active in-flight requests
//! 2. shorter outbound queue
//! 3. fewer total requests served historically
//!
//! `peek` is advisory: it never removes the selected member. Membership
//! changes happen on READY promotion, write-timeout disengagement,
//! backpressure pause/resume and teardown.

use parking_lot::Mutex;
use std::sync::Arc;

/// Load snapshot used for ordering. Smaller compares as more available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LoadKey {
    pub active_requests: usize,
    pub queued_messages: usize,
    pub total_requests: u64,
}

/// Anything the balancer can order. Implemented by
/// [`crate::connection::Connection`]; tests use stubs.
pub trait Balanced: Send + Sync {
    fn balance_id(&self) -> u64;
    fn load_key(&self) -> LoadKey;
    /// Node grouping used for targeted dispatch.
    fn balance_node(&self) -> Option<u16>;
}

/// Membership set with live least-loaded selection.
pub struct LoadBalancer<T: Balanced> {
    members: Mutex<Vec<Arc<T>>>,
}

impl<T: Balanced> Default for LoadBalancer<T> {
    fn default() -> Self {
        Self {
            members: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Balanced> LoadBalancer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member; idempotent on id.
    pub fn add(&self, member: Arc<T>) {
        let mut members = self.members.lock();
        if !members.iter().any(|m| m.balance_id() == member.balance_id()) {
            members.push(member);
        }
    }

    pub fn remove(&self, id: u64) {
        self.members.lock().retain(|m| m.balance_id() != id);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.members.lock().iter().any(|m| m.balance_id() == id)
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// Advisory minimum: the least-loaded member, left in place.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.peek_where(|_| true)
    }

    /// Least-loaded member for a specific remote node.
    pub fn peek_node(&self, node_id: u16) -> Option<Arc<T>> {
        self.peek_where(|m| m.balance_node() == Some(node_id))
    }

    /// Least-loaded member passing `pred`. Ties beyond the 3-level key fall
    /// back to the lowest id so selection stays deterministic.
    pub fn peek_where(&self, pred: impl Fn(&T) -> bool) -> Option<Arc<T>> {
        self.members
            .lock()
            .iter()
            .filter(|m| pred(m))
            .min_by_key(|m| (m.load_key(), m.balance_id()))
            .cloned()
    }

    /// Remove every member belonging to `node_id`, returning them so a
    /// resume can re-add the survivors.
    pub fn remove_node(&self, node_id: u16) -> Vec<Arc<T>> {
        let mut members = self.members.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = members
            .drain(..)
            .partition(|m| m.balance_node() == Some(node_id));
        *members = kept;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub {
        id: u64,
        node: Option<u16>,
        key: LoadKey,
    }

    impl Balanced for Stub {
        fn balance_id(&self) -> u64 {
            self.id
        }
        fn load_key(&self) -> LoadKey {
            self.key
        }
        fn balance_node(&self) -> Option<u16> {
            self.node
        }
    }

    fn stub(id: u64, active: usize, queued: usize, total: u64) -> Arc<Stub> {
        Arc::new(Stub {
            id,
            node: None,
            key: LoadKey {
                active_requests: active,
                queued_messages: queued,
                total_requests: total,
            },
        })
    }

    #[test]
    fn fewer_active_requests_wins() {
        let balancer = LoadBalancer::new();
        balancer.add(stub(1, 5, 0, 0));
        balancer.add(stub(2, 2, 100, 9999));
        assert_eq!(balancer.peek().unwrap().balance_id(), 2);
    }

    #[test]
    fn queue_depth_breaks_active_ties() {
        let balancer = LoadBalancer::new();
        balancer.add(stub(1, 3, 7, 0));
        balancer.add(stub(2, 3, 2, 9999));
        assert_eq!(balancer.peek().unwrap().balance_id(), 2);
    }

    #[test]
    fn lifetime_total_breaks_remaining_ties() {
        let balancer = LoadBalancer::new();
        balancer.add(stub(1, 3, 2, 500));
        balancer.add(stub(2, 3, 2, 100));
        assert_eq!(balancer.peek().unwrap().balance_id(), 2);
    }

    #[test]
    fn peek_does_not_remove() {
        let balancer = LoadBalancer::new();
        balancer.add(stub(1, 0, 0, 0));
        assert!(balancer.peek().is_some());
        assert_eq!(balancer.len(), 1);
    }

    #[test]
    fn add_is_idempotent_per_id() {
        let balancer = LoadBalancer::new();
        balancer.add(stub(1, 0, 0, 0));
        balancer.add(stub(1, 9, 9, 9));
        assert_eq!(balancer.len(), 1);
    }

    #[test]
    fn node_removal_and_targeted_peek() {
        let balancer = LoadBalancer::new();
        balancer.add(Arc::new(Stub {
            id: 1,
            node: Some(301),
            key: LoadKey {
                active_requests: 0,
                queued_messages: 0,
                total_requests: 0,
            },
        }));
        balancer.add(Arc::new(Stub {
            id: 2,
            node: Some(302),
            key: LoadKey {
                active_requests: 0,
                queued_messages: 0,
                total_requests: 0,
            },
        }));
        assert_eq!(balancer.peek_node(302).unwrap().balance_id(), 2);
        let removed = balancer.remove_node(301);
        assert_eq!(removed.len(), 1);
        assert_eq!(balancer.len(), 1);
        assert!(balancer.peek_node(301).is_none());
    }
}
