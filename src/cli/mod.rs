//! Command-line surface for the test harness.
//!
//! ```text
//! test [--strategy random|dfs|pct|replay] [--seed <u64>] [--iterations <n>]
//!      [--max-steps <n>] [--timeout <sec>] [--replay <schedule-file>]
//!      [--verbose <0..3>] <test-name>
//! ```
//!
//! Exit codes: 0 success, 1 bug found, 2 configuration error, 3 internal
//! failure.

pub mod args;
pub mod exit;

pub use args::{CliError, TestOptions};
pub use exit::ExitCode;
