//! Shared helpers for the integration test suite.
#![allow(dead_code)]

use statelab::{BugStep, BugTrace};

pub fn init_test_logging() {
    // Initialize tracing for tests if not already done
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// Asserts that `checks` match steps of the trace in order (a subsequence:
/// other steps may appear in between).
pub fn assert_in_order(trace: &BugTrace, checks: Vec<(&str, Box<dyn Fn(&BugStep) -> bool>)>) {
    let steps = trace.steps();
    let mut from = 0;
    for (label, check) in checks {
        match steps[from..].iter().position(|step| check(step)) {
            Some(offset) => from += offset + 1,
            None => panic!(
                "bug trace has no step matching `{label}` after index {from}; trace: {:#?}",
                steps
            ),
        }
    }
}
