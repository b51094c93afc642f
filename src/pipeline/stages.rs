//! # Stage Timing
//!
//! Records start/end timestamps and outcomes for named pipeline stages so
//! that per-session latency can be reported to clients as debug events.
//!
//! ## Design Notes:
//! - Records are keyed by stage name; re-entering a stage name overwrites the
//!   prior record. One record per stage per session, not an ordered history.
//! - Every operation is best-effort and infallible: `end()` without a prior
//!   `start()` produces a record with no duration rather than an error.
//! - Each session (and each stateless request) owns its own `StageTimer`, so
//!   concurrent sessions never interleave records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Outcome record for a single named pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    /// When the stage was started, if `start` was called
    pub start: Option<DateTime<Utc>>,

    /// When the stage ended, if `end` was called
    pub end: Option<DateTime<Utc>>,

    /// Elapsed milliseconds between start and end; `None` when either
    /// timestamp is missing
    pub duration_ms: Option<i64>,

    /// Whether the stage completed successfully; `None` while in flight
    pub success: Option<bool>,

    /// Free-form status message recorded at stage end
    pub message: Option<String>,
}

/// Wall-clock timer for the named stages of one pipeline run.
///
/// Owned by the session coordinator (one per connection) or constructed
/// per-request for the stateless endpoints.
#[derive(Debug, Default)]
pub struct StageTimer {
    records: HashMap<String, StageRecord>,
}

impl StageTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a stage and return the timestamp.
    ///
    /// Overwrites any prior record under the same name, finished or not.
    pub fn start(&mut self, stage: &str) -> DateTime<Utc> {
        let now = Utc::now();
        self.records.insert(
            stage.to_string(),
            StageRecord {
                start: Some(now),
                end: None,
                duration_ms: None,
                success: None,
                message: None,
            },
        );
        now
    }

    /// Mark the end of a stage, storing duration and outcome.
    ///
    /// Safe to call without a matching `start`: the record is created with
    /// no start timestamp and no duration.
    pub fn end(&mut self, stage: &str, success: bool, message: Option<&str>) -> DateTime<Utc> {
        let now = Utc::now();
        let start = self.records.get(stage).and_then(|r| r.start);
        let duration_ms = start.map(|s| (now - s).num_milliseconds());

        self.records.insert(
            stage.to_string(),
            StageRecord {
                start,
                end: Some(now),
                duration_ms,
                success: Some(success),
                message: message.map(str::to_string),
            },
        );
        now
    }

    /// Return an owned copy of all stage records, keyed by stage name.
    ///
    /// Used to build the diagnostic debug event sent to clients at the end
    /// of a session.
    pub fn snapshot(&self) -> HashMap<String, StageRecord> {
        self.records.clone()
    }

    /// Snapshot serialized for a debug event payload.
    pub fn report(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_then_end_records_duration() {
        let mut timer = StageTimer::new();
        timer.start("stt");
        timer.end("stt", true, Some("len=42"));

        let snapshot = timer.snapshot();
        let record = snapshot.get("stt").expect("record exists");
        assert!(record.start.is_some());
        assert!(record.end.is_some());
        assert!(record.duration_ms.is_some());
        assert!(record.duration_ms.unwrap() >= 0);
        assert_eq!(record.success, Some(true));
        assert_eq!(record.message.as_deref(), Some("len=42"));
    }

    #[test]
    fn test_end_without_start_yields_null_duration() {
        let mut timer = StageTimer::new();
        // Must not panic and must still record the outcome
        timer.end("tts", false, Some("backend unavailable"));

        let snapshot = timer.snapshot();
        let record = snapshot.get("tts").expect("record exists");
        assert!(record.start.is_none());
        assert!(record.duration_ms.is_none());
        assert_eq!(record.success, Some(false));
    }

    #[test]
    fn test_restart_overwrites_prior_record() {
        let mut timer = StageTimer::new();
        timer.start("reply");
        timer.end("reply", false, Some("first attempt"));
        timer.start("reply");
        timer.end("reply", true, Some("second attempt"));

        let snapshot = timer.snapshot();
        let record = snapshot.get("reply").expect("record exists");
        assert_eq!(record.success, Some(true));
        assert_eq!(record.message.as_deref(), Some("second attempt"));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut timer = StageTimer::new();
        timer.start("stt");
        let before = timer.snapshot();
        timer.end("stt", true, None);

        // The earlier snapshot must not observe the later mutation
        assert!(before.get("stt").unwrap().end.is_none());
        assert!(timer.snapshot().get("stt").unwrap().end.is_some());
    }

    #[test]
    fn test_report_serializes() {
        let mut timer = StageTimer::new();
        timer.start("stt");
        timer.end("stt", true, None);
        let report = timer.report();
        assert!(report.get("stt").is_some());
    }
}
