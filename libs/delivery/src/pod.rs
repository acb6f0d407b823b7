//! # Proof of Publish (POD)
//!
//! ## Purpose
//! Per-message delivery record for the producer↔relay leg. The producer
//! creates one when it first emits an event; the cerebrum creates its own on
//! first receipt. Each side's record tracks the three round-trip steps
//! (publish, ack, 3-way ack) with IO timings and retryable attempt counters,
//! and the cerebrum's additionally drives fan-out: one [`crate::por::
//! ProofOfRelay`] per subscriber, folded back into `FullyRelayed` once every
//! subscriber finishes.

use crate::state::{advance, DeliveryState};
use crate::timing::{AttemptCounter, ChangeLog, IoTiming};
use chrono::{DateTime, Utc};
use nceph_codec::EventData;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofOfPublish {
    pub message_id: String,
    pub event: EventData,
    pub state: DeliveryState,

    // IO timings per round-trip step.
    pub event_write: IoTiming,
    pub event_read: IoTiming,
    pub ack_write: IoTiming,
    pub ack_read: IoTiming,
    pub threeway_write: IoTiming,
    pub threeway_read: IoTiming,

    /// Producer-observed latency between event creation and its ack.
    pub network_latency_ms: Option<i64>,

    // Attempt counters per step, rolled back on failed re-sends.
    pub event_attempts: AttemptCounter,
    pub ack_attempts: AttemptCounter,
    pub threeway_attempts: AttemptCounter,

    // Relay-side fan-out bookkeeping.
    pub subscriber_count: u32,
    pub relay_count: u32,
    /// Cache keys of the per-subscriber POR records.
    pub por_keys: Vec<String>,

    pub archived: bool,
    pub created_on: DateTime<Utc>,
    #[serde(skip)]
    pub change_log: ChangeLog,
}

impl ProofOfPublish {
    pub fn new(message_id: String, event: EventData) -> Self {
        Self {
            message_id,
            event,
            state: DeliveryState::Initial,
            event_write: IoTiming::default(),
            event_read: IoTiming::default(),
            ack_write: IoTiming::default(),
            ack_read: IoTiming::default(),
            threeway_write: IoTiming::default(),
            threeway_read: IoTiming::default(),
            network_latency_ms: None,
            event_attempts: AttemptCounter::default(),
            ack_attempts: AttemptCounter::default(),
            threeway_attempts: AttemptCounter::default(),
            subscriber_count: 0,
            relay_count: 0,
            por_keys: Vec::new(),
            archived: false,
            created_on: Utc::now(),
            change_log: ChangeLog::default(),
        }
    }

    /// Forward-only state transition; replays are no-ops.
    pub fn advance_state(&mut self, target: DeliveryState) -> bool {
        let applied = advance(&mut self.state, target);
        if applied {
            self.change_log.mark("state");
        }
        applied
    }

    /// One subscriber's POR reached FINISHED.
    pub fn record_relayed(&mut self) {
        self.relay_count += 1;
        self.change_log.mark("relay_count");
    }

    /// Every subscriber's POR has finished (vacuously false before fan-out
    /// is set up).
    pub fn fully_relayed(&self) -> bool {
        self.subscriber_count > 0 && self.relay_count >= self.subscriber_count
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_on
    }

    /// Archive partition/sort composite key for published records.
    pub fn archive_key(&self) -> (String, String) {
        (
            format!("P:{}", self.event.producer_port),
            self.message_id.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> EventData {
        EventData {
            event_type: 1001,
            producer_port: 1000,
            payload: json!({"price": 42}),
            created_on: Utc::now(),
        }
    }

    #[test]
    fn state_is_monotonic_under_replay() {
        let mut pod = ProofOfPublish::new("123-7".into(), event());
        assert!(pod.advance_state(DeliveryState::AckReceived));
        assert!(!pod.advance_state(DeliveryState::Delivered));
        assert_eq!(pod.state, DeliveryState::AckReceived);
    }

    #[test]
    fn fully_relayed_requires_all_subscribers() {
        let mut pod = ProofOfPublish::new("123-7".into(), event());
        assert!(!pod.fully_relayed());
        pod.subscriber_count = 3;
        pod.record_relayed();
        pod.record_relayed();
        assert!(!pod.fully_relayed());
        pod.record_relayed();
        assert!(pod.fully_relayed());
    }

    #[test]
    fn archive_key_uses_producer_partition() {
        let pod = ProofOfPublish::new("123-7".into(), event());
        assert_eq!(pod.archive_key(), ("P:1000".to_string(), "123-7".to_string()));
    }

    #[test]
    fn archived_record_round_trips_as_json() {
        let pod = ProofOfPublish::new("123-7".into(), event());
        let doc = serde_json::to_value(&pod).unwrap();
        let back: ProofOfPublish = serde_json::from_value(doc).unwrap();
        assert_eq!(back.message_id, "123-7");
        assert_eq!(back.state, DeliveryState::Initial);
    }
}
