//! # Proof of Relay (POR)
//!
//! Per-subscriber delivery record for the relay↔consumer leg. The cerebrum
//! creates one per subscriber when fan-out begins; the consumer creates its
//! own on RELAY_EVENT receipt. Relay delivery culminates in invoking the
//! consumer's application receptor, so the consumer-side record additionally
//! captures that execution's outcome — a failed handler is retried on the
//! next 3-way-ack cycle before the record may be deleted.

use crate::state::{advance, DeliveryState};
use crate::timing::{AttemptCounter, ChangeLog, IoTiming};
use chrono::{DateTime, Utc};
use nceph_codec::EventData;
use serde::{Deserialize, Serialize};

/// Outcome of the application receptor invocation on the consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppReceptorRecord {
    pub name: Option<String>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub failed: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofOfRelay {
    pub message_id: String,
    /// Consumer identity; one POD fans out to many PORs, so records are
    /// keyed by message id plus consumer port.
    pub consumer_port: u16,
    pub consumer_node: u16,
    pub event: EventData,
    pub state: DeliveryState,

    pub relay_write: IoTiming,
    pub relay_read: IoTiming,
    pub ack_write: IoTiming,
    pub ack_read: IoTiming,
    pub threeway_write: IoTiming,
    pub threeway_read: IoTiming,

    pub relay_attempts: AttemptCounter,
    pub ack_attempts: AttemptCounter,
    pub threeway_attempts: AttemptCounter,

    pub app_receptor: AppReceptorRecord,

    pub archived: bool,
    pub created_on: DateTime<Utc>,
    #[serde(skip)]
    pub change_log: ChangeLog,
}

impl ProofOfRelay {
    pub fn new(message_id: String, consumer_port: u16, consumer_node: u16, event: EventData) -> Self {
        Self {
            message_id,
            consumer_port,
            consumer_node,
            event,
            state: DeliveryState::Initial,
            relay_write: IoTiming::default(),
            relay_read: IoTiming::default(),
            ack_write: IoTiming::default(),
            ack_read: IoTiming::default(),
            threeway_write: IoTiming::default(),
            threeway_read: IoTiming::default(),
            relay_attempts: AttemptCounter::default(),
            ack_attempts: AttemptCounter::default(),
            threeway_attempts: AttemptCounter::default(),
            app_receptor: AppReceptorRecord::default(),
            archived: false,
            created_on: Utc::now(),
            change_log: ChangeLog::default(),
        }
    }

    /// Working-cache key: message id + consumer port.
    pub fn cache_key(message_id: &str, consumer_port: u16) -> String {
        format!("{message_id}|{consumer_port}")
    }

    pub fn key(&self) -> String {
        Self::cache_key(&self.message_id, self.consumer_port)
    }

    /// Forward-only state transition; replays are no-ops.
    pub fn advance_state(&mut self, target: DeliveryState) -> bool {
        let applied = advance(&mut self.state, target);
        if applied {
            self.change_log.mark("state");
        }
        applied
    }

    pub fn record_app_outcome(
        &mut self,
        name: String,
        duration_ms: i64,
        error: Option<String>,
    ) {
        self.app_receptor.name = Some(name);
        self.app_receptor.duration_ms = Some(duration_ms);
        self.app_receptor.failed = error.is_some();
        self.app_receptor.error = error;
        self.app_receptor.attempts += 1;
        self.change_log.mark("app_receptor");
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_on
    }

    /// Archive partition/sort composite key for relayed records.
    pub fn archive_key(&self) -> (String, String) {
        (
            format!("R:{}", self.consumer_port),
            self.message_id.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn por() -> ProofOfRelay {
        ProofOfRelay::new(
            "123-7".into(),
            1301,
            301,
            EventData {
                event_type: 1001,
                producer_port: 1000,
                payload: json!({}),
                created_on: Utc::now(),
            },
        )
    }

    #[test]
    fn cache_key_pairs_id_with_consumer_port() {
        assert_eq!(por().key(), "123-7|1301");
    }

    #[test]
    fn app_failure_then_success_clears_failed_flag() {
        let mut record = por();
        record.record_app_outcome("pricing".into(), 12, Some("boom".into()));
        assert!(record.app_receptor.failed);
        assert_eq!(record.app_receptor.attempts, 1);

        record.record_app_outcome("pricing".into(), 3, None);
        assert!(!record.app_receptor.failed);
        assert!(record.app_receptor.error.is_none());
        assert_eq!(record.app_receptor.attempts, 2);
    }

    #[test]
    fn archive_key_uses_consumer_partition() {
        assert_eq!(por().archive_key(), ("R:1301".to_string(), "123-7".to_string()));
    }
}
