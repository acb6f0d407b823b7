//! IO timing records, attempt counters and the per-record change log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock start/end of one read or write step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IoTiming {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl IoTiming {
    pub fn record(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.start = Some(start);
        self.end = Some(end);
    }

    pub fn record_now(&mut self) {
        let now = Utc::now();
        self.start = Some(now);
        self.end = Some(now);
    }

    pub fn recorded(&self) -> bool {
        self.end.is_some()
    }
}

/// Per-step attempt counter. A failed message build decrements exactly the
/// count its attempt just incremented, so the next monitor pass retries
/// cleanly; it never goes negative under normal operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCounter(u32);

impl AttemptCounter {
    pub fn increment(&mut self) {
        self.0 += 1;
    }

    pub fn rollback(&mut self) {
        self.0 = self.0.saturating_sub(1);
    }

    pub fn count(&self) -> u32 {
        self.0
    }
}

/// Dirty-field tracking for audit logging. A record is "out of sync" from
/// the moment a field changes until the cache persists it.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    changed: Vec<&'static str>,
    out_of_sync: bool,
}

impl ChangeLog {
    pub fn mark(&mut self, field: &'static str) {
        if !self.changed.contains(&field) {
            self.changed.push(field);
        }
        self.out_of_sync = true;
    }

    pub fn out_of_sync(&self) -> bool {
        self.out_of_sync
    }

    pub fn changed_fields(&self) -> &[&'static str] {
        &self.changed
    }

    /// Called by the cache once the record has been persisted.
    pub fn synced(&mut self) {
        self.changed.clear();
        self.out_of_sync = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_undoes_exactly_one_increment() {
        let mut attempts = AttemptCounter::default();
        attempts.increment();
        attempts.increment();
        attempts.rollback();
        assert_eq!(attempts.count(), 1);
    }

    #[test]
    fn rollback_never_goes_negative() {
        let mut attempts = AttemptCounter::default();
        attempts.rollback();
        assert_eq!(attempts.count(), 0);
    }

    #[test]
    fn change_log_tracks_until_synced() {
        let mut log = ChangeLog::default();
        assert!(!log.out_of_sync());
        log.mark("state");
        log.mark("state");
        assert!(log.out_of_sync());
        assert_eq!(log.changed_fields(), &["state"]);
        log.synced();
        assert!(!log.out_of_sync());
    }
}
