//! IPC envelope protocol (child → parent).
//!
//! The child writes JSON messages with the shape
//! `{"kind": "<kind>", "payload": {...}}`, one per stdout line. This module
//! deserializes them into a strongly-typed [`IpcEnvelope`].
//!
//! The protocol is strict: an unknown `kind`, a wrong-typed payload, or
//! malformed JSON rejects the message — and the runner fails the job rather
//! than silently ignoring it. The one forgiving rule is finite out-of-range
//! progress, which is normalized into `[0, 1]` instead of dropped.

use serde::{Deserialize, Serialize};

/// All messages a job child process may post to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum IpcEnvelope {
    /// Progress update in `[0, 1]` (finite out-of-range values are clamped
    /// by the parent).
    Progress {
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// One log line.
    Log { line: String },

    /// Terminal: the job succeeded with an opaque result payload. The
    /// parent reports success only when it has seen this envelope —
    /// a clean process exit alone proves nothing.
    Result {
        #[serde(default)]
        value: serde_json::Value,
    },

    /// Terminal: the job failed with a human-readable message.
    Error { message: String },
}

/// Parse one stdout line into a typed envelope.
///
/// Returns `Err` for malformed JSON, unknown kinds, and wrong-typed
/// payloads. Callers treat that as a protocol violation, not noise.
pub fn parse_envelope(text: &str) -> Result<IpcEnvelope, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_progress_envelope() {
        let json = r#"{"kind":"progress","payload":{"value":0.4,"message":"epoch 4"}}"#;
        let envelope = parse_envelope(json).unwrap();
        match envelope {
            IpcEnvelope::Progress { value, message } => {
                assert_eq!(value, 0.4);
                assert_eq!(message.as_deref(), Some("epoch 4"));
            }
            other => panic!("Expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn parse_progress_without_message() {
        let json = r#"{"kind":"progress","payload":{"value":1.0}}"#;
        let envelope = parse_envelope(json).unwrap();
        assert_eq!(
            envelope,
            IpcEnvelope::Progress {
                value: 1.0,
                message: None
            }
        );
    }

    #[test]
    fn parse_log_envelope() {
        let json = r#"{"kind":"log","payload":{"line":"loading weights"}}"#;
        let envelope = parse_envelope(json).unwrap();
        assert_eq!(
            envelope,
            IpcEnvelope::Log {
                line: "loading weights".into()
            }
        );
    }

    #[test]
    fn parse_result_envelope() {
        let json = r#"{"kind":"result","payload":{"value":{"map50":0.91}}}"#;
        let envelope = parse_envelope(json).unwrap();
        match envelope {
            IpcEnvelope::Result { value } => assert_eq!(value["map50"], 0.91),
            other => panic!("Expected Result, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_envelope() {
        let json = r#"{"kind":"error","payload":{"message":"CUDA out of memory"}}"#;
        let envelope = parse_envelope(json).unwrap();
        assert_eq!(
            envelope,
            IpcEnvelope::Error {
                message: "CUDA out of memory".into()
            }
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(parse_envelope(r#"{"kind":"bogus","payload":{}}"#).is_err());
    }

    #[test]
    fn wrong_typed_progress_is_rejected() {
        assert!(parse_envelope(r#"{"kind":"progress","payload":{"value":"high"}}"#).is_err());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(parse_envelope("definitely not json").is_err());
    }

    #[test]
    fn round_trips_through_serialization() {
        let envelopes = vec![
            IpcEnvelope::Progress {
                value: 0.25,
                message: Some("warming up".into()),
            },
            IpcEnvelope::Log {
                line: "checkpoint saved".into(),
            },
            IpcEnvelope::Result {
                value: serde_json::json!({"out": "runs/exp1"}),
            },
            IpcEnvelope::Error {
                message: "bad dataset".into(),
            },
        ];
        for envelope in envelopes {
            let line = serde_json::to_string(&envelope).unwrap();
            assert_eq!(parse_envelope(&line).unwrap(), envelope);
        }
    }
}
