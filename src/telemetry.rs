//! Structured reporting of protocol violations.
//!
//! Sessions tolerate a lot of misbehavior from the server (garbage frames,
//! payloads of the wrong shape, missing ids). Instead of only logging these with
//! `tracing::warn!`, each one becomes a [`ProtocolViolation`] handed to a
//! [`ViolationObserver`], so that tests can assert on them and embedders can
//! route them elsewhere.
//!
//! # Example
//!
//! ```
//! use duelsim::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! // ... hand `observer` to a session and drive it ...
//! assert!(!observer.has_violation(ViolationKind::Codec));
//! ```

use parking_lot::Mutex;

/// Severity of a protocol violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ViolationSeverity {
    /// The offending input was dropped and the session carried on.
    Warning,
    /// The session could not do what it was asked and may end up failing checks.
    Error,
    /// An internal invariant of the simulator broke.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categories of violations.
///
/// Marked `#[non_exhaustive]`: include a wildcard arm when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum ViolationKind {
    /// An inbound frame or payload could not be decoded.
    Codec,
    /// The server sent something that breaks the protocol contract, such as a
    /// `connected` event without a player id.
    Protocol,
    /// The connection misbehaved.
    Transport,
    /// Internal simulator bug.
    Internal,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Codec => "codec",
            Self::Protocol => "protocol",
            Self::Transport => "transport",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded violation with enough context to diagnose it.
///
/// ```
/// use duelsim::telemetry::{ProtocolViolation, ViolationKind, ViolationSeverity};
///
/// let violation = ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::Codec,
///     "dropping malformed frame",
///     "machine.rs:42",
/// )
/// .with_vu(7);
///
/// assert_eq!(
///     violation.to_string(),
///     "[warning/codec] dropping malformed frame (at machine.rs:42, vu=7)"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    pub severity: ViolationSeverity,
    pub kind: ViolationKind,
    pub message: String,
    /// Source location that raised the violation (`file:line`).
    pub location: &'static str,
    /// The virtual user whose session raised it, when known.
    pub vu: Option<u64>,
}

impl ProtocolViolation {
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            vu: None,
        }
    }

    /// Sets the virtual user the violation belongs to.
    #[must_use]
    pub fn with_vu(mut self, vu: u64) -> Self {
        self.vu = Some(vu);
        self
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(vu) = self.vu {
            write!(f, ", vu={vu}")?;
        }
        write!(f, ")")
    }
}

/// Receives violations raised by sessions.
///
/// Observers are shared across every virtual user of a run, so they must be
/// `Send + Sync` and should return quickly.
pub trait ViolationObserver: Send + Sync {
    /// Called when a violation is detected.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Default observer: logs every violation through `tracing` with structured
/// `severity`, `kind`, `location` and `vu` fields.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let vu = violation.vu;

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(severity, kind, location, ?vu, "{}", violation.message);
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(severity, kind, location, ?vu, "{}", violation.message);
            },
        }
    }
}

/// Observer that stores violations for later inspection. Meant for tests.
///
/// ```
/// use duelsim::telemetry::{
///     CollectingObserver, ProtocolViolation, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
///
/// let observer = CollectingObserver::new();
/// observer.on_violation(&ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::Protocol,
///     "connected without player_id",
///     "test.rs:1",
/// ));
/// assert_eq!(observer.len(), 1);
/// assert!(observer.has_violation(ViolationKind::Protocol));
/// ```
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ProtocolViolation>>,
}

impl CollectingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<ProtocolViolation> {
        self.violations.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Checks if any violation of the specified kind has been collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Reports a violation through `observer`, tagging it with `vu`.
///
/// Usually invoked through [`report_violation!`](crate::report_violation).
pub fn report_to_observer(
    observer: &dyn ViolationObserver,
    vu: Option<u64>,
    violation: ProtocolViolation,
) {
    let violation = match vu {
        Some(vu) => violation.with_vu(vu),
        None => violation,
    };
    observer.on_violation(&violation);
}

/// Reports a violation with the current source location.
///
/// ```text
/// report_violation!(observer, vu, severity, kind, "message");
/// report_violation!(observer, vu, severity, kind, "message with {}", args);
/// ```
///
/// `observer` is anything that derefs to `dyn ViolationObserver`; `vu` is an
/// `Option<u64>`.
///
/// ```
/// use duelsim::report_violation;
/// use duelsim::telemetry::{CollectingObserver, ViolationKind, ViolationSeverity};
///
/// let observer = CollectingObserver::new();
/// report_violation!(&observer, Some(3), ViolationSeverity::Warning, ViolationKind::Codec,
///     "dropping frame of {} bytes", 12);
/// assert_eq!(observer.violations()[0].vu, Some(3));
/// ```
#[macro_export]
macro_rules! report_violation {
    ($observer:expr, $vu:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer(&*$observer, $vu, violation);
    }};

    ($observer:expr, $vu:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer(&*$observer, $vu, violation);
    }};
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

    fn sample(kind: ViolationKind) -> ProtocolViolation {
        ProtocolViolation::new(ViolationSeverity::Warning, kind, "sample", "test.rs:1")
    }

    #[test]
    fn severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn display_includes_vu() {
        let text = sample(ViolationKind::Protocol).with_vu(9).to_string();
        assert!(text.starts_with("[warning/protocol] sample"));
        assert!(text.ends_with("vu=9)"));
        assert!(!sample(ViolationKind::Codec).to_string().contains("vu="));
    }

    #[test]
    fn collecting_observer_matches_by_kind() {
        let observer = CollectingObserver::new();
        observer.on_violation(&sample(ViolationKind::Codec));
        observer.on_violation(&sample(ViolationKind::Protocol));
        assert_eq!(observer.len(), 2);
        assert!(observer.has_violation(ViolationKind::Codec));
        assert!(!observer.has_violation(ViolationKind::Transport));
    }

    #[test]
    fn macro_records_location_and_vu() {
        let observer: std::sync::Arc<dyn ViolationObserver> =
            std::sync::Arc::new(CollectingObserver::new());
        let collecting = CollectingObserver::new();
        report_violation!(
            &collecting,
            Some(4),
            ViolationSeverity::Error,
            ViolationKind::Internal,
            "broken {}",
            "invariant"
        );
        report_violation!(
            observer,
            None,
            ViolationSeverity::Warning,
            ViolationKind::Codec,
            "plain"
        );
        let recorded = collecting.violations();
        assert_eq!(recorded[0].message, "broken invariant");
        assert_eq!(recorded[0].vu, Some(4));
        assert!(recorded[0].location.contains("telemetry.rs"));
        assert!(collecting.has_violation(ViolationKind::Internal));
    }

    #[test]
    fn tracing_observer_does_not_panic() {
        TracingObserver::new().on_violation(&sample(ViolationKind::Codec).with_vu(1));
    }
}
