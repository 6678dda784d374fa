//! Violation reporting and runtime invariant checks.
//!
//! Problems the engine recovers from on its own, such as a dropped packet, a truncated
//! nickname or a failing spectator link, never surface as errors. They are reported as
//! [`ProtocolViolation`] values to a [`ViolationObserver`]. Without an observer they go to
//! `tracing` through [`TracingObserver`].
//!
//! ```
//! use deltaplay::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! // hand `observer.clone()` to SessionBuilder::with_violation_observer, run, then:
//! assert!(!observer.has_violation(ViolationKind::RingBuffer));
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::Frame;

/// How bad a violation is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Absorbed: the offending data was dropped or clamped and the session carried on.
    Warning,
    /// A link failed. For a spectator that ends the spectator, for the primary link the
    /// session.
    Error,
    /// Internal state is inconsistent and the peers may desynchronize.
    Critical,
}

impl ViolationSeverity {
    /// Lowercase name, as used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// The subsystem that reported a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Out-of-window frame access or an attempted overrun of the delta frame ring.
    RingBuffer,
    /// Remote input out of order, duplicated, or beyond the backlog.
    InputSync,
    /// Identity truncated or handshake messages out of place.
    Handshake,
    /// Undecodable or unexpected messages.
    NetworkProtocol,
    /// A spectator link misbehaved or failed.
    Spectator,
    /// An [`InvariantChecker`] failed.
    Invariant,
}

impl ViolationKind {
    /// Lowercase name, as used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RingBuffer => "ring_buffer",
            Self::InputSync => "input_sync",
            Self::Handshake => "handshake",
            Self::NetworkProtocol => "network_protocol",
            Self::Spectator => "spectator",
            Self::Invariant => "invariant",
        }
    }
}

impl fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra key/value pairs attached to a violation. Rarely more than two.
pub type ViolationContext = SmallVec<[(&'static str, String); 2]>;

/// One reported anomaly.
///
/// With the `json` feature, [`to_json`](Self::to_json) renders it for log shipping.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProtocolViolation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Which subsystem reported it.
    pub kind: ViolationKind,
    /// What happened.
    pub message: String,
    /// `file:line` of the report.
    pub location: &'static str,
    /// The frame involved, when there is one.
    pub frame: Option<Frame>,
    /// Extra fields.
    pub context: ViolationContext,
}

impl ProtocolViolation {
    /// A violation without frame or context.
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
            frame: None,
            context: ViolationContext::new(),
        }
    }

    /// Attaches the frame involved.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Attaches one context field. A repeated key replaces the earlier value.
    #[must_use]
    pub fn with_context(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        let value = value.to_string();
        match self.context.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.context.push((key, value)),
        }
        self
    }

    /// JSON rendering, `None` if serialization fails.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    fn context_string(&self) -> String {
        let mut out = String::new();
        for (i, (key, value)) in self.context.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.kind, self.message)?;
        if let Some(frame) = self.frame {
            write!(f, " at frame {}", frame)?;
        }
        if !self.context.is_empty() {
            write!(f, " [{}]", self.context_string())?;
        }
        write!(f, " ({})", self.location)
    }
}

/// Receives violations. Called synchronously from inside the per-frame poll, so keep it quick.
///
/// ```
/// use deltaplay::telemetry::{ProtocolViolation, ViolationObserver, ViolationSeverity};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct CriticalCounter(AtomicUsize);
///
/// impl ViolationObserver for CriticalCounter {
///     fn on_violation(&self, violation: &ProtocolViolation) {
///         if violation.severity == ViolationSeverity::Critical {
///             self.0.fetch_add(1, Ordering::Relaxed);
///         }
///     }
/// }
/// ```
pub trait ViolationObserver: Send + Sync {
    /// Handles one violation.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Logs warnings with `tracing::warn!`, everything worse with `tracing::error!`.
///
/// Severity, kind, location, frame and context are emitted as structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        let frame = violation.frame.map(Frame::as_u32);
        let context = violation.context_string();
        if violation.severity == ViolationSeverity::Warning {
            tracing::warn!(
                severity = violation.severity.as_str(),
                kind = violation.kind.as_str(),
                location = violation.location,
                frame,
                context = %context,
                "{}",
                violation.message
            );
        } else {
            tracing::error!(
                severity = violation.severity.as_str(),
                kind = violation.kind.as_str(),
                location = violation.location,
                frame,
                context = %context,
                "{}",
                violation.message
            );
        }
    }
}

/// Keeps every violation in memory. Meant for tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    seen: Mutex<Vec<ProtocolViolation>>,
}

impl CollectingObserver {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<ProtocolViolation> {
        self.seen.lock().clone()
    }

    /// The collected violations of one kind.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<ProtocolViolation> {
        self.seen
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Whether anything of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.seen.lock().iter().any(|v| v.kind == kind)
    }

    /// Whether anything at `severity` or worse was collected.
    #[must_use]
    pub fn has_severity_at_least(&self, severity: ViolationSeverity) -> bool {
        self.seen.lock().iter().any(|v| v.severity >= severity)
    }

    /// Number of violations collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Whether nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Forgets everything collected.
    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        self.seen.lock().push(violation.clone());
    }
}

/// Hands `violation` to `observer`, or to [`TracingObserver`] when there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &ProtocolViolation,
) {
    match observer {
        Some(observer) => observer.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation stamped with the caller's `file:line` to [`TracingObserver`].
///
/// ```
/// use deltaplay::report_violation;
/// use deltaplay::telemetry::{ViolationKind, ViolationSeverity};
///
/// let (expected, actual) = (10, 15);
/// report_violation!(
///     ViolationSeverity::Warning,
///     ViolationKind::InputSync,
///     "remote input for frame {} while expecting {}",
///     actual,
///     expected
/// );
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $($msg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        $crate::telemetry::TracingObserver.on_violation(
            &$crate::telemetry::ProtocolViolation::new(
                $severity,
                $kind,
                format!($($msg)+),
                concat!(file!(), ":", line!()),
            ),
        );
    }};
}

/// Like [`report_violation!`], but sent to an `Option<Arc<dyn ViolationObserver>>`.
///
/// ```
/// use deltaplay::report_violation_to;
/// use deltaplay::telemetry::{CollectingObserver, ViolationKind, ViolationObserver, ViolationSeverity};
/// use std::sync::Arc;
///
/// let collector = Arc::new(CollectingObserver::new());
/// let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
/// report_violation_to!(&observer, ViolationSeverity::Warning, ViolationKind::Handshake,
///     "nickname truncated from {} to {} bytes", 40, 31);
/// assert_eq!(collector.len(), 1);
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $($msg:tt)+) => {{
        $crate::telemetry::report_to_observer(
            $observer.as_ref(),
            &$crate::telemetry::ProtocolViolation::new(
                $severity,
                $kind,
                format!($($msg)+),
                concat!(file!(), ":", line!()),
            ),
        );
    }};
}

// ==========================================
// Runtime Invariant Checking
// ==========================================

/// A broken invariant, as returned by [`InvariantChecker::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InvariantViolation {
    /// The type that failed its check.
    pub type_name: &'static str,
    /// Which invariant broke.
    pub invariant: String,
    /// Values that show how it broke.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// A violation of `invariant` in `type_name`, without details.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Attaches the values that show how the invariant broke.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}: {} ({})", self.type_name, self.invariant, details),
            None => write!(f, "{}: {}", self.type_name, self.invariant),
        }
    }
}

/// Types that can verify their own internal consistency.
///
/// Checked automatically after mutations in debug builds and with the `paranoid` feature;
/// tests may call it directly.
pub trait InvariantChecker {
    /// The first broken invariant, if any.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Runs [`InvariantChecker::check_invariants`] and reports a failure as a critical
/// violation. Compiles to nothing in release builds without the `paranoid` feature.
#[macro_export]
macro_rules! debug_check_invariants {
    ($expr:expr) => {
        $crate::debug_check_invariants!($expr, "update")
    };
    ($expr:expr, $context:expr) => {{
        if cfg!(any(debug_assertions, feature = "paranoid")) {
            use $crate::telemetry::InvariantChecker as _;
            if let Err(violation) = $expr.check_invariants() {
                $crate::report_violation!(
                    $crate::telemetry::ViolationSeverity::Critical,
                    $crate::telemetry::ViolationKind::Invariant,
                    "{} after {}",
                    violation,
                    $context
                );
            }
        }
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

    fn warning(kind: ViolationKind, message: &str) -> ProtocolViolation {
        ProtocolViolation::new(ViolationSeverity::Warning, kind, message, "test.rs:1")
    }

    #[test]
    fn severities_are_ordered() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn display_includes_frame_and_context() {
        let violation = ProtocolViolation::new(
            ViolationSeverity::Error,
            ViolationKind::Spectator,
            "write failed",
            "spectator.rs:10",
        )
        .with_frame(Frame::new(50))
        .with_context("spectator", 3)
        .with_context("spectator", 4);

        assert_eq!(violation.context.len(), 1);
        assert_eq!(
            violation.to_string(),
            "error spectator: write failed at frame 50 [spectator=4] (spectator.rs:10)"
        );
    }

    #[test]
    fn collector_filters() {
        let observer = CollectingObserver::new();
        observer.on_violation(&warning(ViolationKind::Handshake, "first"));
        observer.on_violation(&warning(ViolationKind::InputSync, "second"));

        assert_eq!(observer.len(), 2);
        assert_eq!(observer.violations_of_kind(ViolationKind::Handshake).len(), 1);
        assert!(!observer.has_violation(ViolationKind::RingBuffer));
        assert!(!observer.has_severity_at_least(ViolationSeverity::Error));
        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn report_to_uses_given_observer() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(
            &observer,
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "dropped {} bytes",
            12
        );
        report_violation_to!(
            &observer,
            ViolationSeverity::Critical,
            ViolationKind::Invariant,
            "plain"
        );

        let violations = collector.violations();
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].message, "dropped 12 bytes");
        assert!(violations[0].location.starts_with("src/telemetry.rs:"));
        assert!(collector.has_severity_at_least(ViolationSeverity::Critical));
    }

    #[test]
    fn report_to_none_falls_back_to_tracing() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            &observer,
            ViolationSeverity::Warning,
            ViolationKind::Handshake,
            "no observer"
        );
    }

    #[test]
    fn invariant_violation_display() {
        let violation = InvariantViolation::new("DeltaFrameStore", "read before other");
        assert_eq!(violation.to_string(), "DeltaFrameStore: read before other");
        assert_eq!(
            violation.with_details("read=1").to_string(),
            "DeltaFrameStore: read before other (read=1)"
        );
    }

    #[cfg(feature = "json")]
    #[test]
    fn violation_serializes_to_json() {
        let json = warning(ViolationKind::RingBuffer, "overrun")
            .with_frame(Frame::new(42))
            .with_context("slot", 3)
            .to_json()
            .unwrap();
        assert!(json.contains(r#""kind":"ring_buffer""#));
        assert!(json.contains(r#""frame":42"#));
        assert!(json.contains(r#"["slot","3"]"#));
    }
}
