//! JSON codec for protocol envelopes.
//!
//! Every frame on the connection is a UTF-8 JSON object
//! `{"command": <string>, "value": <payload>}` where `value` is omitted when
//! the command carries no payload. This module is the single place that turns
//! envelopes into frames and back, so that malformed input is classified the
//! same way everywhere.
//!
//! # Examples
//!
//! ```
//! use duelsim::protocol::codec::{decode, encode};
//! use duelsim::protocol::messages::{Command, Envelope};
//! use serde_json::json;
//!
//! let envelope = Envelope::new(Command::Queue, Some(json!(100)));
//! let frame = encode(&envelope).expect("encoding should succeed");
//! assert_eq!(frame, r#"{"command":"queue","value":100}"#);
//!
//! let decoded = decode(frame.as_bytes()).expect("decoding should succeed");
//! assert_eq!(decoded, envelope);
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::protocol::messages::{Command, Envelope};

/// What the codec was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding an outbound envelope.
    EncodeEnvelope,
    /// Decoding an inbound frame into an envelope.
    DecodeEnvelope,
    /// Decoding the typed payload of a known command.
    DecodePayload(Command),
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeEnvelope => write!(f, "encoding envelope"),
            Self::DecodeEnvelope => write!(f, "decoding envelope"),
            Self::DecodePayload(command) => write!(f, "decoding {} payload", command),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Messages are kept as strings because `serde_json` only exposes its failure
/// reasons through `Display`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying serializer message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying parser message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }

    /// The operation that failed.
    #[must_use]
    pub const fn operation(&self) -> CodecOperation {
        match self {
            Self::EncodeError { operation, .. } | Self::DecodeError { operation, .. } => *operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes an envelope into a text frame.
///
/// Serializing an [`Envelope`] cannot fail in practice (all keys are strings),
/// the `Result` only guards against serializer bugs.
pub fn encode(envelope: &Envelope) -> CodecResult<String> {
    serde_json::to_string(envelope)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeEnvelope))
}

/// Decodes a frame into an envelope.
///
/// Fails when the bytes are not a JSON object or when `command` is missing or
/// not a string. Unknown command names decode fine; see [`Envelope::kind`].
pub fn decode(bytes: &[u8]) -> CodecResult<Envelope> {
    let document: Value = serde_json::from_slice(bytes)
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodeEnvelope))?;
    let Value::Object(mut fields) = document else {
        return Err(CodecError::decode(
            "frame is not a JSON object",
            CodecOperation::DecodeEnvelope,
        ));
    };
    let command = match fields.remove("command") {
        Some(Value::String(command)) => command,
        Some(_) => {
            return Err(CodecError::decode(
                "command is not a string",
                CodecOperation::DecodeEnvelope,
            ))
        },
        None => {
            return Err(CodecError::decode(
                "missing command field",
                CodecOperation::DecodeEnvelope,
            ))
        },
    };
    let value = fields.remove("value").filter(|v| !v.is_null());
    Ok(Envelope { command, value })
}

/// Decodes the typed payload of an envelope whose command is `command`.
///
/// An absent value is decoded as JSON `null`, which lets payload types with
/// all-default fields accept it.
pub fn decode_payload<T: DeserializeOwned>(
    command: Command,
    value: Option<&Value>,
) -> CodecResult<T> {
    let value = value.cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodePayload(command)))
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ConnectedPayload, GameStartPayload};
    use serde_json::json;

    #[test]
    fn encode_omits_absent_value() {
        let frame = encode(&Envelope::new(Command::LeaveQueue, None)).unwrap();
        assert_eq!(frame, r#"{"command":"leave_queue"}"#);
    }

    #[test]
    fn decode_connected_frame() {
        let envelope = decode(br#"{"command":"connected","value":{"player_id":"P1"}}"#).unwrap();
        assert_eq!(envelope.kind(), Some(Command::Connected));
        let payload: ConnectedPayload =
            decode_payload(Command::Connected, envelope.value.as_ref()).unwrap();
        assert_eq!(payload.player_id.as_deref(), Some("P1"));
    }

    #[test]
    fn decode_keeps_unknown_commands() {
        let envelope = decode(br#"{"command":"teleport","value":1}"#).unwrap();
        assert_eq!(envelope.kind(), None);
        assert_eq!(envelope.command, "teleport");
    }

    #[test]
    fn decode_rejects_non_json() {
        let err = decode(b"not json").unwrap_err();
        assert_eq!(err.operation(), CodecOperation::DecodeEnvelope);
    }

    #[test]
    fn decode_rejects_missing_or_non_string_command() {
        assert!(decode(br#"{"value":true}"#).is_err());
        assert!(decode(br#"{"command":5}"#).is_err());
        assert!(decode(br#"["queue", 100]"#).is_err());
    }

    #[test]
    fn decode_treats_null_value_as_absent() {
        let envelope = decode(br#"{"command":"pong","value":null}"#).unwrap();
        assert_eq!(envelope.value, None);
    }

    #[test]
    fn payload_errors_name_the_command() {
        let err = decode_payload::<GameStartPayload>(Command::GameStart, Some(&json!(42)))
            .unwrap_err();
        assert_eq!(err.operation(), CodecOperation::DecodePayload(Command::GameStart));
        assert!(err.to_string().contains("game_start"));
    }

    #[test]
    fn round_trip_preserves_command_and_value() {
        let original = Envelope::new(
            Command::OpponentReady,
            Some(json!({"is_ready": true, "extra": [1, 2]})),
        );
        let decoded = decode(encode(&original).unwrap().as_bytes()).unwrap();
        assert_eq!(decoded, original);
    }
}
