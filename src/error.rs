use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::protocol::codec::CodecError;

/// Convenience alias for results returned throughout this crate.
pub type SimResult<T> = Result<T, SimError>;

/// This enum contains all errors the simulation engine can return.
///
/// Errors are always local to one virtual user: nothing in here is ever
/// propagated across sessions. See [`crate::orchestrator`] for how the run
/// keeps going when sessions fail.
#[derive(Debug, Clone, PartialEq)]
pub enum SimError {
    /// A configuration value was missing, malformed or out of range.
    InvalidConfig(InvalidConfigKind),
    /// The session bootstrap call failed. Fatal for that virtual user's iteration.
    Bootstrap(BootstrapFailure),
    /// Inbound bytes could not be decoded into a protocol envelope.
    MalformedEnvelope(CodecError),
    /// A turn script index was past the end of the script.
    TurnOutOfRange {
        /// The index that was requested.
        index: usize,
        /// The length of the script.
        len: usize,
    },
    /// The persistent connection failed.
    Transport {
        /// A description of the transport error.
        context: String,
    },
    /// An internal error occurred that should not happen under normal operation.
    Internal {
        /// A description of the internal error.
        context: String,
    },
}

impl Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(kind) => write!(f, "Invalid configuration: {}", kind),
            Self::Bootstrap(failure) => write!(f, "Session bootstrap failed: {}", failure),
            Self::MalformedEnvelope(err) => write!(f, "Malformed envelope: {}", err),
            Self::TurnOutOfRange { index, len } => {
                write!(
                    f,
                    "Turn index {} is out of range for a script of {} moves",
                    index, len
                )
            },
            Self::Transport { context } => write!(f, "Transport error: {}", context),
            Self::Internal { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            },
        }
    }
}

impl Error for SimError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MalformedEnvelope(err) => Some(err),
            _ => None,
        }
    }
}

impl From<InvalidConfigKind> for SimError {
    fn from(kind: InvalidConfigKind) -> Self {
        Self::InvalidConfig(kind)
    }
}

impl From<BootstrapFailure> for SimError {
    fn from(failure: BootstrapFailure) -> Self {
        Self::Bootstrap(failure)
    }
}

impl From<CodecError> for SimError {
    fn from(err: CodecError) -> Self {
        Self::MalformedEnvelope(err)
    }
}

/// Structured reasons a run configuration was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidConfigKind {
    /// A duration knob was outside its accepted range.
    DurationOutOfRange {
        /// The configuration field.
        field: &'static str,
        /// Smallest accepted value in milliseconds.
        min_ms: u64,
        /// Largest accepted value in milliseconds.
        max_ms: u64,
        /// The value that was supplied.
        actual_ms: u64,
    },
    /// An integer knob was outside its accepted range.
    ValueOutOfRange {
        /// The configuration field.
        field: &'static str,
        /// Smallest accepted value.
        min: u64,
        /// Largest accepted value.
        max: u64,
        /// The value that was supplied.
        actual: u64,
    },
    /// Two knobs contradict each other.
    Inconsistent {
        /// What is wrong with the combination.
        reason: String,
    },
    /// A required value was empty.
    Empty {
        /// The configuration field.
        field: &'static str,
    },
    /// The configuration document could not be read or parsed.
    Parse {
        /// Parser or I/O message.
        context: String,
    },
}

impl Display for InvalidConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DurationOutOfRange {
                field,
                min_ms,
                max_ms,
                actual_ms,
            } => write!(
                f,
                "{} must be between {}ms and {}ms, got {}ms",
                field, min_ms, max_ms, actual_ms
            ),
            Self::ValueOutOfRange {
                field,
                min,
                max,
                actual,
            } => write!(
                f,
                "{} must be between {} and {}, got {}",
                field, min, max, actual
            ),
            Self::Inconsistent { reason } => f.write_str(reason),
            Self::Empty { field } => write!(f, "{} must not be empty", field),
            Self::Parse { context } => write!(f, "could not parse configuration: {}", context),
        }
    }
}

/// Why the session bootstrap (game launch) call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BootstrapFailure {
    /// The launch endpoint answered with a status other than 200.
    Status {
        /// The HTTP status code received.
        code: u16,
    },
    /// The request never produced a response.
    Transport {
        /// A description of the failure.
        context: String,
    },
    /// The response body was not the expected JSON document.
    UnparseableBody {
        /// Parser message.
        context: String,
    },
    /// The response parsed but carried no `url`.
    MissingUrl,
    /// The `url` could not be turned into a connection endpoint.
    InvalidUrl {
        /// What was wrong with it.
        context: String,
    },
}

impl Display for BootstrapFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { code } => write!(f, "launch returned status {}", code),
            Self::Transport { context } => write!(f, "launch request failed: {}", context),
            Self::UnparseableBody { context } => {
                write!(f, "launch response is not valid JSON: {}", context)
            },
            Self::MissingUrl => write!(f, "launch response has no url"),
            Self::InvalidUrl { context } => write!(f, "launch url is unusable: {}", context),
        }
    }
}

impl Error for BootstrapFailure {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::codec::CodecOperation;

    #[test]
    fn invalid_config_display_mentions_field_and_range() {
        let err: SimError = InvalidConfigKind::DurationOutOfRange {
            field: "connect_timeout",
            min_ms: 1,
            max_ms: 60_000,
            actual_ms: 0,
        }
        .into();
        let text = err.to_string();
        assert!(text.contains("connect_timeout"));
        assert!(text.contains("60000ms"));
    }

    #[test]
    fn bootstrap_status_display() {
        let err = SimError::from(BootstrapFailure::Status { code: 503 });
        assert_eq!(err.to_string(), "Session bootstrap failed: launch returned status 503");
    }

    #[test]
    fn malformed_envelope_exposes_codec_source() {
        let err = SimError::from(CodecError::decode("eof", CodecOperation::DecodeEnvelope));
        assert!(err.source().is_some());
        assert!(SimError::TurnOutOfRange { index: 4, len: 4 }.source().is_none());
    }
}
