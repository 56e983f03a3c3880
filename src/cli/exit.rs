//! Semantic exit codes for the test harness.

use crate::error::ErrorKind;

/// Exit codes reported by the `test` command.
pub struct ExitCode;

impl ExitCode {
    /// All iterations completed without finding a bug.
    pub const SUCCESS: i32 = 0;

    /// A bug was found; traces were emitted.
    pub const BUG_FOUND: i32 = 1;

    /// Invalid configuration: bad arguments, invalid state graph, missing
    /// schedule file.
    pub const CONFIG_ERROR: i32 = 2;

    /// The harness itself failed.
    pub const INTERNAL_FAILURE: i32 = 3;

    /// Human-readable description of an exit code.
    #[must_use]
    pub const fn description(code: i32) -> &'static str {
        match code {
            0 => "success",
            1 => "bug found",
            2 => "configuration error",
            3 => "internal failure",
            _ => "unknown",
        }
    }

    /// Maps an error kind to the exit code it should produce.
    #[must_use]
    pub const fn for_error(kind: ErrorKind) -> i32 {
        if kind.is_bug() {
            Self::BUG_FOUND
        } else {
            match kind {
                ErrorKind::Configuration => Self::CONFIG_ERROR,
                _ => Self::INTERNAL_FAILURE,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bug_kinds_exit_one() {
        assert_eq!(ExitCode::for_error(ErrorKind::AssertionFailure), 1);
        assert_eq!(ExitCode::for_error(ErrorKind::Deadlock), 1);
        assert_eq!(ExitCode::for_error(ErrorKind::LivenessViolation), 1);
    }

    #[test]
    fn configuration_exits_two() {
        assert_eq!(ExitCode::for_error(ErrorKind::Configuration), 2);
    }

    #[test]
    fn internal_kinds_exit_three() {
        assert_eq!(ExitCode::for_error(ErrorKind::Internal), 3);
        assert_eq!(ExitCode::for_error(ErrorKind::StorageRetriesExhausted), 3);
    }

    #[test]
    fn descriptions_cover_the_range() {
        assert_eq!(ExitCode::description(0), "success");
        assert_eq!(ExitCode::description(1), "bug found");
        assert_eq!(ExitCode::description(2), "configuration error");
        assert_eq!(ExitCode::description(3), "internal failure");
        assert_eq!(ExitCode::description(42), "unknown");
    }
}
