//! Error types and error handling strategy for the bug-finding runtime.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - User-code failures become reported bugs; they never unwind past the
//!   scheduler, which always regains control to record the step and flush
//!   traces
//! - Fatal runtime invariants (a strategy returning a disabled operation,
//!   corrupted internal state) abort the run as internal errors

use core::fmt;
use std::sync::Arc;

use crate::types::{MachineId, StateName};

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Bugs found in the program under test ===
    /// A user `assert` or a runtime-checked safety invariant failed.
    AssertionFailure,
    /// A dequeued event has no handler in the current state.
    UnhandledEvent,
    /// A handler raised a second event within the same execution.
    DoubleRaise,
    /// A liveness monitor was left in a hot state at the end of a run.
    LivenessViolation,
    /// User handler code panicked.
    UnhandledPanic,
    /// No machine can make progress while events or receives are pending.
    Deadlock,
    /// An event with `must_handle` was dropped on a halted machine.
    DroppedMustHandleEvent,
    /// A send exceeded its `assert_at_most_n` in-flight bound.
    EventOverflow,
    /// A synchronous-execution request formed a cycle.
    AwaitCycle,

    // === Test setup and replay ===
    /// Invalid machine-type declaration, rejected at registration.
    Configuration,
    /// Execution diverged from the schedule being replayed.
    ReplayDivergence,
    /// The schedule being replayed ended before the program did.
    ScheduleExhausted,

    // === Storage (reliable overlay) ===
    /// Transient storage failure; retried internally.
    TransientStorage,
    /// The retry budget for transient storage failures was exhausted.
    StorageRetriesExhausted,

    // === Runtime internals ===
    /// Internal runtime error (a bug in the runtime itself).
    Internal,
}

impl ErrorKind {
    /// Returns true if this kind represents a bug in the program under test,
    /// as opposed to a configuration or internal failure.
    #[must_use]
    pub const fn is_bug(self) -> bool {
        matches!(
            self,
            Self::AssertionFailure
                | Self::UnhandledEvent
                | Self::DoubleRaise
                | Self::LivenessViolation
                | Self::UnhandledPanic
                | Self::Deadlock
                | Self::DroppedMustHandleEvent
                | Self::EventOverflow
                | Self::AwaitCycle
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AssertionFailure => "assertion failure",
            Self::UnhandledEvent => "unhandled event",
            Self::DoubleRaise => "double raise",
            Self::LivenessViolation => "liveness violation",
            Self::UnhandledPanic => "unhandled panic",
            Self::Deadlock => "deadlock",
            Self::DroppedMustHandleEvent => "dropped must-handle event",
            Self::EventOverflow => "event overflow",
            Self::AwaitCycle => "await cycle",
            Self::Configuration => "configuration error",
            Self::ReplayDivergence => "replay divergence",
            Self::ScheduleExhausted => "schedule exhausted",
            Self::TransientStorage => "transient storage failure",
            Self::StorageRetriesExhausted => "storage retries exhausted",
            Self::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// The main error type for runtime operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents a bug in the program under test.
    #[must_use]
    pub const fn is_bug(&self) -> bool {
        self.kind.is_bug()
    }

    /// Returns the context text, if any.
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Creates an assertion-failure error with the given message.
    #[must_use]
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AssertionFailure).with_context(message)
    }

    /// Creates a configuration error with the given message.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration).with_context(message)
    }

    /// Creates an internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_context(message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "{}: {ctx}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Result alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Bug
// ============================================================================

/// A defect found in the program under test.
///
/// Produced by the scheduler when a run ends with a violation; carries the
/// origin machine and state when they are known.
#[derive(Debug, Clone)]
pub struct Bug {
    /// The underlying error.
    pub error: Error,
    /// Machine whose step surfaced the bug, if attributable.
    pub machine: Option<MachineId>,
    /// State the machine was in, if attributable.
    pub state: Option<StateName>,
}

impl Bug {
    /// Creates a bug with no machine attribution.
    #[must_use]
    pub const fn global(error: Error) -> Self {
        Self {
            error,
            machine: None,
            state: None,
        }
    }

    /// Creates a bug attributed to a machine step.
    #[must_use]
    pub fn in_machine(error: Error, machine: MachineId, state: Option<StateName>) -> Self {
        Self {
            error,
            machine: Some(machine),
            state,
        }
    }
}

impl fmt::Display for Bug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.machine, &self.state) {
            (Some(m), Some(s)) => write!(f, "{} in {m} state {s}", self.error),
            (Some(m), None) => write!(f, "{} in {m}", self.error),
            _ => write!(f, "{}", self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bug_kinds_are_bugs() {
        assert!(ErrorKind::AssertionFailure.is_bug());
        assert!(ErrorKind::Deadlock.is_bug());
        assert!(!ErrorKind::Configuration.is_bug());
        assert!(!ErrorKind::Internal.is_bug());
        assert!(!ErrorKind::TransientStorage.is_bug());
    }

    #[test]
    fn context_is_displayed() {
        let err = Error::assertion("count must stay below 3");
        assert_eq!(
            err.to_string(),
            "assertion failure: count must stay below 3"
        );
    }

    #[test]
    fn bug_display_includes_origin() {
        let bug = Bug::in_machine(
            Error::new(ErrorKind::UnhandledEvent).with_context("Ping"),
            MachineId::new_for_test(2, "Server"),
            Some(StateName::new("Init")),
        );
        let text = bug.to_string();
        assert!(text.contains("Server(2)"));
        assert!(text.contains("Init"));
    }
}
