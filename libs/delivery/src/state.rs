//! # Delivery State Machines
//!
//! Monotonic state words shared by POA, POD and POR. A handler only ever
//! advances a record forward; applying an earlier-state update after a later
//! one is a no-op. This single rule makes every receptor and affector
//! idempotent under retransmission and under the race between a message's
//! receptor and its peer step's affector executing in either order.

use serde::{Deserialize, Serialize};

/// Handshake progress, strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum PoaState {
    Initial = 0,
    Startup = 100,
    Authenticate = 200,
    Credentials = 300,
    Ready = 400,
    AuthError = 450,
    ReadyConfirmed = 500,
}

/// Delivery progress for POD and POR. `Delivered` covers both the publish
/// leg ("delivered to relay") and the relay leg ("relayed to consumer");
/// `FullyRelayed` applies to relay-side PODs only, once every subscriber's
/// POR has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum DeliveryState {
    Initial = 100,
    Delivered = 200,
    Acknowledged = 300,
    AckReceived = 400,
    Finished = 500,
    FullyRelayed = 600,
}

/// Apply `target` to `current` only if it moves forward. Returns whether the
/// update was applied.
pub fn advance<S: Ord + Copy>(current: &mut S, target: S) -> bool {
    if target > *current {
        *current = target;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_states_are_strictly_ordered() {
        assert!(DeliveryState::Initial < DeliveryState::Delivered);
        assert!(DeliveryState::Delivered < DeliveryState::Acknowledged);
        assert!(DeliveryState::Acknowledged < DeliveryState::AckReceived);
        assert!(DeliveryState::AckReceived < DeliveryState::Finished);
        assert!(DeliveryState::Finished < DeliveryState::FullyRelayed);
    }

    #[test]
    fn advance_is_monotonic_and_idempotent() {
        let mut state = DeliveryState::Initial;
        assert!(advance(&mut state, DeliveryState::Acknowledged));
        // Replayed earlier step is a no-op.
        assert!(!advance(&mut state, DeliveryState::Delivered));
        assert_eq!(state, DeliveryState::Acknowledged);
        // Same state is a no-op too.
        assert!(!advance(&mut state, DeliveryState::Acknowledged));
    }

    #[test]
    fn poa_auth_error_sits_between_ready_and_confirmed() {
        assert!(PoaState::Ready < PoaState::AuthError);
        assert!(PoaState::AuthError < PoaState::ReadyConfirmed);
    }
}
