//! Proof of Authentication: per-handshake progress record.
//!
//! Created on STARTUP receipt at the cerebrum, deleted once the handshake
//! terminates (READY_CONFIRMED or AUTH_ERROR processed). Cache-only: the
//! record only protects the handshake window and is never archived.

use crate::state::{advance, PoaState};
use crate::timing::{ChangeLog, IoTiming};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofOfAuthentication {
    pub message_id: String,
    pub state: PoaState,
    /// Connecting node, known from the STARTUP body.
    pub node_id: u16,
    pub node_name: String,
    pub startup: IoTiming,
    pub authenticate: IoTiming,
    pub credentials: IoTiming,
    pub ready: IoTiming,
    pub ready_confirmed: IoTiming,
    pub created_on: DateTime<Utc>,
    #[serde(skip)]
    pub change_log: ChangeLog,
}

impl ProofOfAuthentication {
    pub fn new(message_id: String, node_id: u16, node_name: String) -> Self {
        Self {
            message_id,
            state: PoaState::Startup,
            node_id,
            node_name,
            startup: IoTiming::default(),
            authenticate: IoTiming::default(),
            credentials: IoTiming::default(),
            ready: IoTiming::default(),
            ready_confirmed: IoTiming::default(),
            created_on: Utc::now(),
            change_log: ChangeLog::default(),
        }
    }

    /// Forward-only state transition; replays are no-ops.
    pub fn advance_state(&mut self, target: PoaState) -> bool {
        let applied = advance(&mut self.state, target);
        if applied {
            self.change_log.mark("state");
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_states_only_move_forward() {
        let mut poa = ProofOfAuthentication::new("123-1".into(), 123, "synapse".into());
        assert!(poa.advance_state(PoaState::Credentials));
        assert!(!poa.advance_state(PoaState::Authenticate));
        assert_eq!(poa.state, PoaState::Credentials);
        assert!(poa.change_log.out_of_sync());
    }
}
