//! The nondeterminism oracle.
//!
//! Every `random_bool` / `random_int` call flows through here. The oracle
//! asks the strategy for the value, and keeps two small queues that make
//! steps repeatable:
//!
//! - `recorded`: the choices drawn by the step currently executing
//! - `replaying`: choices a retried step must observe again
//!
//! When the reliable overlay rolls back a step after a transient storage
//! failure, the recorded choices are staged for replay so the re-run takes
//! exactly the same path; the strategy is not consulted again for them.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::strategy::Strategy;

/// A drawn choice value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StagedChoice {
    Bool(bool),
    Int(u32),
}

/// Routes nondeterministic choices through the strategy, staging them for
/// deterministic step retry.
#[derive(Debug, Default)]
pub(crate) struct ChoiceOracle {
    recorded: Vec<StagedChoice>,
    replaying: VecDeque<StagedChoice>,
}

impl ChoiceOracle {
    /// Forgets the previous step's recording. Called at each step boundary.
    pub(crate) fn begin_step(&mut self) {
        self.recorded.clear();
    }

    /// Stages the current recording for replay by a retried step.
    pub(crate) fn stage_retry(&mut self) {
        self.replaying = self.recorded.drain(..).collect();
    }

    /// Draws a boolean, either from the retry stage or the strategy.
    pub(crate) fn next_bool(&mut self, strategy: &mut dyn Strategy, max: u32) -> Result<bool> {
        let value = match self.replaying.pop_front() {
            Some(StagedChoice::Bool(value)) => value,
            Some(StagedChoice::Int(_)) => {
                return Err(Error::internal(
                    "retried step requested a boolean where an integer was recorded",
                ));
            }
            None => strategy.next_bool(max)?,
        };
        self.recorded.push(StagedChoice::Bool(value));
        Ok(value)
    }

    /// Draws an integer, either from the retry stage or the strategy.
    pub(crate) fn next_int(&mut self, strategy: &mut dyn Strategy, max: u32) -> Result<u32> {
        let value = match self.replaying.pop_front() {
            Some(StagedChoice::Int(value)) => value,
            Some(StagedChoice::Bool(_)) => {
                return Err(Error::internal(
                    "retried step requested an integer where a boolean was recorded",
                ));
            }
            None => strategy.next_int(max)?,
        };
        self.recorded.push(StagedChoice::Int(value));
        Ok(value)
    }
}
