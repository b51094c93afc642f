//! # Session Event Types
//!
//! Typed messages flowing through a voice session: outbound JSON events sent
//! to the client over the WebSocket, and the provider-side transcription
//! events drained by the coordinator.
//!
//! ## Outbound Ordering Invariants:
//! - At most one `final` event per session
//! - `reply` never precedes `final` (or end-of-input on the batch path)
//! - The terminal binary audio frame, if any, always follows `reply`

use serde::{Deserialize, Serialize};

/// JSON event sent to the client as a WebSocket text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundEvent {
    /// Provisional transcript; may be revised by later partials
    Partial { text: String },

    /// Finalized transcript for the session; emitted at most once
    Final { text: String },

    /// Assistant reply text; emitted exactly once per session
    Reply { text: String },

    /// Diagnostic payload (stage timings, backend switches, normalization)
    Debug {
        stage: String,
        data: serde_json::Value,
    },

    /// Unrecoverable session error; the connection closes after this
    Error { message: String },
}

impl OutboundEvent {
    /// Serialize for the wire. Event payloads are plain data, so
    /// serialization cannot fail in practice; a malformed payload degrades
    /// to an error event rather than dropping the frame silently.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"event serialization failed: {e}"}}"#)
        })
    }
}

/// Inbound control frame recognized on the WebSocket text channel.
///
/// Anything that fails to parse into this shape is ignored, per the
/// malformed-frame policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Client finished speaking; finalize with what has been heard
    Stop,
    /// Synonym for stop used by older clients
    End,
}

/// Event emitted by a streaming speech-to-text source.
///
/// Produced on a provider-managed task and pushed onto a channel; the
/// coordinator drains the channel, never running session logic on the
/// provider task itself.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// Provisional transcript text (full running prefix, not a delta)
    Partial(String),

    /// Final transcript for the stream
    Final(String),

    /// The vendor degraded mid-stream (e.g. deprecated model); the session
    /// should fall back to the offline simulator and continue
    Degraded(String),

    /// The vendor connection failed before producing anything usable;
    /// unrecoverable for this session
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_event_wire_shapes() {
        let partial = OutboundEvent::Partial {
            text: "hello".to_string(),
        };
        let json = partial.to_json();
        assert!(json.contains(r#""type":"partial"#));
        assert!(json.contains(r#""text":"hello"#));

        let reply = OutboundEvent::Reply {
            text: "hi there".to_string(),
        };
        assert!(reply.to_json().contains(r#""type":"reply"#));

        let debug = OutboundEvent::Debug {
            stage: "stt".to_string(),
            data: serde_json::json!({"backend": "simulator"}),
        };
        let json = debug.to_json();
        assert!(json.contains(r#""type":"debug"#));
        assert!(json.contains("simulator"));
    }

    #[test]
    fn test_outbound_event_round_trip() {
        let event = OutboundEvent::Final {
            text: "done".to_string(),
        };
        let parsed: OutboundEvent = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_control_frame_parsing() {
        assert!(matches!(
            serde_json::from_str::<ControlFrame>(r#"{"type":"stop"}"#),
            Ok(ControlFrame::Stop)
        ));
        assert!(matches!(
            serde_json::from_str::<ControlFrame>(r#"{"type":"end"}"#),
            Ok(ControlFrame::End)
        ));
        // Unknown shapes are errors, which callers treat as "no control frame"
        assert!(serde_json::from_str::<ControlFrame>(r#"{"type":"pause"}"#).is_err());
        assert!(serde_json::from_str::<ControlFrame>("not json").is_err());
    }
}
