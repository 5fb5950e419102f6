//! Structured fault telemetry.
//!
//! Network code degrades silently by design: malformed datagrams are dropped,
//! oversized packets are sent anyway, duplicate messages are suppressed. This
//! module makes those silent paths observable. A fault is structured data
//! that is logged through `tracing` and forwarded to any registered
//! observers, so tests can assert on exactly which degradations occurred.
//!
//! # Example
//!
//! ```
//! use framelock::telemetry::{self, CollectingObserver, FaultKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! telemetry::register_observer(observer.clone());
//!
//! // ... run some session code ...
//!
//! let malformed = observer.count_of(FaultKind::MalformedMessage);
//! assert_eq!(malformed, 0);
//! ```

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Severity of a recorded fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultSeverity {
    /// Unexpected but handled; the operation continued.
    Warning,
    /// Serious issue; behavior may be degraded.
    Error,
}

impl FaultSeverity {
    /// String form suitable for log and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for FaultSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categories of faults, one per subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FaultKind {
    /// A datagram failed to decode and was dropped.
    MalformedMessage,
    /// A peer violated the lobby or reliability protocol.
    Protocol,
    /// A frame queue precondition was violated (conflicting write, stale
    /// duplicate past the dedup window).
    FrameQueue,
    /// A socket-level send or receive problem.
    Transport,
    /// An internal inconsistency that should never happen.
    InternalError,
}

impl FaultKind {
    /// String form suitable for log and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedMessage => "malformed_message",
            Self::Protocol => "protocol",
            Self::FrameQueue => "frame_queue",
            Self::Transport => "transport",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded fault with its context.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Fault {
    /// Severity of the fault.
    pub severity: FaultSeverity,
    /// Subsystem category.
    pub kind: FaultKind,
    /// Human-readable description.
    pub message: String,
    /// Source location (`file:line`) where the fault was reported.
    pub location: &'static str,
}

/// Receives faults as they are reported.
///
/// Observers are invoked synchronously from whichever thread reported the
/// fault; implementations must not block.
pub trait FaultObserver: Send + Sync {
    /// Called once per reported fault.
    fn on_fault(&self, fault: &Fault);
}

/// A [`FaultObserver`] that collects faults for later inspection. Intended
/// for tests.
#[derive(Default)]
pub struct CollectingObserver {
    faults: Mutex<Vec<Fault>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all collected faults.
    #[must_use]
    pub fn faults(&self) -> Vec<Fault> {
        self.faults.lock().clone()
    }

    /// Returns how many faults of `kind` have been collected.
    #[must_use]
    pub fn count_of(&self, kind: FaultKind) -> usize {
        self.faults.lock().iter().filter(|f| f.kind == kind).count()
    }

    /// Discards all collected faults.
    pub fn clear(&self) {
        self.faults.lock().clear();
    }
}

impl FaultObserver for CollectingObserver {
    fn on_fault(&self, fault: &Fault) {
        self.faults.lock().push(fault.clone());
    }
}

struct Registry {
    observers: Vec<Arc<dyn FaultObserver>>,
    counts: BTreeMap<FaultKind, u64>,
}

static REGISTRY: Mutex<Option<Registry>> = Mutex::new(None);

fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
    let mut guard = REGISTRY.lock();
    let registry = guard.get_or_insert_with(|| Registry {
        observers: Vec::new(),
        counts: BTreeMap::new(),
    });
    f(registry)
}

/// Registers an observer that will receive every subsequently reported fault.
pub fn register_observer(observer: Arc<dyn FaultObserver>) {
    with_registry(|r| r.observers.push(observer));
}

/// Removes all registered observers (the running counters are kept).
pub fn clear_observers() {
    with_registry(|r| r.observers.clear());
}

/// Returns the process-wide count of faults of `kind` since startup.
#[must_use]
pub fn fault_count(kind: FaultKind) -> u64 {
    with_registry(|r| r.counts.get(&kind).copied().unwrap_or(0))
}

/// Records a fault: bumps the counter, logs via `tracing`, and notifies
/// observers. Prefer the [`report_fault!`](crate::report_fault) macro, which
/// captures the source location.
pub fn report(fault: Fault) {
    let observers = with_registry(|r| {
        *r.counts.entry(fault.kind).or_insert(0) += 1;
        r.observers.clone()
    });
    match fault.severity {
        FaultSeverity::Warning => tracing::warn!(
            kind = fault.kind.as_str(),
            location = fault.location,
            "{}",
            fault.message
        ),
        FaultSeverity::Error => tracing::error!(
            kind = fault.kind.as_str(),
            location = fault.location,
            "{}",
            fault.message
        ),
    }
    for observer in observers {
        observer.on_fault(&fault);
    }
}

/// Reports a fault with the caller's source location.
///
/// ```
/// use framelock::report_fault;
/// use framelock::telemetry::{FaultKind, FaultSeverity};
///
/// report_fault!(
///     FaultSeverity::Warning,
///     FaultKind::MalformedMessage,
///     "dropping {} bytes from unknown peer",
///     12
/// );
/// ```
#[macro_export]
macro_rules! report_fault {
    ($severity:expr, $kind:expr, $($arg:tt)*) => {
        $crate::telemetry::report($crate::telemetry::Fault {
            severity: $severity,
            kind: $kind,
            message: format!($($arg)*),
            location: concat!(file!(), ":", line!()),
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_observer_receives_faults() {
        let observer = Arc::new(CollectingObserver::new());
        register_observer(observer.clone());

        report_fault!(
            FaultSeverity::Warning,
            FaultKind::MalformedMessage,
            "bad datagram of {} bytes",
            3
        );

        // Other tests may report faults concurrently; look for ours.
        let faults = observer.faults();
        let fault = faults
            .iter()
            .find(|f| f.kind == FaultKind::MalformedMessage && f.message.contains("3 bytes"))
            .expect("reported fault not collected");
        assert!(fault.location.contains("telemetry.rs"));

        clear_observers();
    }

    #[test]
    fn counters_accumulate() {
        let before = fault_count(FaultKind::Transport);
        report_fault!(FaultSeverity::Error, FaultKind::Transport, "send failed");
        assert_eq!(fault_count(FaultKind::Transport), before + 1);
    }

    #[test]
    fn fault_serializes_to_json() {
        let fault = Fault {
            severity: FaultSeverity::Warning,
            kind: FaultKind::Protocol,
            message: "dup seq".into(),
            location: "peer.rs:1",
        };
        let json = serde_json::to_string(&fault).unwrap();
        assert!(json.contains(r#""severity":"warning""#));
        assert!(json.contains(r#""kind":"protocol""#));
    }
}
