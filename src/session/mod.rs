//! # Voice Session Management
//!
//! One session per transport connection: the session owns the accumulated
//! transcripts, latency markers, and pipeline state for a single
//! conversational exchange. All mutation happens on the session coordinator;
//! nothing here is shared across connections.
//!
//! ## Session Lifecycle:
//! Accepted → Authenticating → Listening → Transcribing → Replying →
//! Synthesizing → Closing → Closed, with Errored reachable from any
//! non-terminal state.

pub mod audio;        // Inbound PCM intake and the ingested-duration clock
pub mod coordinator;  // The session state machine
pub mod events;       // Outbound/provider event types

use chrono::{DateTime, Utc};
use std::time::Instant;
use uuid::Uuid;

/// How a session receives audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Raw PCM chunks stream in; partial transcripts stream out
    Streaming,
    /// One complete audio blob (binary or base64 text) starts the pipeline
    Batch,
}

/// Pipeline state of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Authenticating,
    Listening,
    Transcribing,
    Replying,
    Synthesizing,
    Closing,
    Closed,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Accepted => "accepted",
            SessionState::Authenticating => "authenticating",
            SessionState::Listening => "listening",
            SessionState::Transcribing => "transcribing",
            SessionState::Replying => "replying",
            SessionState::Synthesizing => "synthesizing",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

/// Data accumulated over one conversational exchange.
///
/// ## Invariants:
/// - The final transcript, once set, is immutable for the session
/// - Reply generation runs at most once per final transcript
/// - Synthesis runs at most once per reply
pub struct Session {
    /// Unique identifier, one per connection
    pub id: String,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    /// Running provisional transcript (latest partial)
    pub partial_transcript: String,

    /// Finalized transcript; set-once
    final_transcript: Option<String>,

    /// Reply text recorded when the pipeline completes
    pub reply_text: Option<String>,

    /// Size of the synthesized audio frame sent, if any
    pub audio_bytes_out: Option<usize>,

    started: Instant,
    first_audio_ms: Option<u64>,
    first_partial_ms: Option<u64>,
    final_transcript_ms: Option<u64>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            partial_transcript: String::new(),
            final_transcript: None,
            reply_text: None,
            audio_bytes_out: None,
            started: Instant::now(),
            first_audio_ms: None,
            first_partial_ms: None,
            final_transcript_ms: None,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Record the first inbound audio byte (no-op after the first call).
    pub fn mark_first_audio(&mut self) {
        if self.first_audio_ms.is_none() {
            self.first_audio_ms = Some(self.elapsed_ms());
        }
    }

    /// Record the first partial transcript (no-op after the first call).
    pub fn mark_first_partial(&mut self) {
        if self.first_partial_ms.is_none() {
            self.first_partial_ms = Some(self.elapsed_ms());
        }
    }

    /// Set the final transcript. Returns false (and changes nothing) when a
    /// final transcript already exists.
    pub fn set_final_transcript(&mut self, text: String) -> bool {
        if self.final_transcript.is_some() {
            return false;
        }
        self.final_transcript_ms = Some(self.elapsed_ms());
        self.final_transcript = Some(text);
        true
    }

    pub fn final_transcript(&self) -> Option<&str> {
        self.final_transcript.as_deref()
    }

    /// Best transcript available right now: the final one, else the
    /// accumulated partial. Used when a disconnect forces early finalize.
    pub fn best_transcript(&self) -> String {
        self.final_transcript
            .clone()
            .unwrap_or_else(|| self.partial_transcript.clone())
    }

    /// Latency markers for the diagnostics event.
    pub fn latency_report(&self) -> serde_json::Value {
        serde_json::json!({
            "first_audio_ms": self.first_audio_ms,
            "first_partial_ms": self.first_partial_ms,
            "final_transcript_ms": self.final_transcript_ms,
        })
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_transcript_is_set_once() {
        let mut session = Session::new();
        assert!(session.set_final_transcript("first".to_string()));
        assert!(!session.set_final_transcript("second".to_string()));
        assert_eq!(session.final_transcript(), Some("first"));
    }

    #[test]
    fn test_best_transcript_prefers_final() {
        let mut session = Session::new();
        session.partial_transcript = "hello wor".to_string();
        assert_eq!(session.best_transcript(), "hello wor");

        session.set_final_transcript("hello world".to_string());
        assert_eq!(session.best_transcript(), "hello world");
    }

    #[test]
    fn test_latency_marks_are_first_wins() {
        let mut session = Session::new();
        session.mark_first_audio();
        session.mark_first_audio();
        session.mark_first_partial();

        let report = session.latency_report();
        assert!(report.get("first_audio_ms").unwrap().is_u64());
        assert!(report.get("first_partial_ms").unwrap().is_u64());
        assert!(report.get("final_transcript_ms").unwrap().is_null());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Listening.as_str(), "listening");
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Errored.is_terminal());
    }
}
