//! Depth-first enumeration of schedules.
//!
//! The strategy keeps one stack of choice levels across iterations. Each
//! level records the options that were available at that decision point and
//! which one is currently selected. Within an iteration, decisions below the
//! stack frontier replay the recorded selection; at the frontier a new level
//! is pushed with its first option selected.
//!
//! `prepare_next_iteration` backtracks: it advances the deepest level with an
//! untried option and discards everything below it. When no level has an
//! untried option the search space (up to the step bound) is exhausted and it
//! returns false. For a deterministic program and a fixed bound this visits
//! every schedule exactly once.

use crate::error::{Error, Result};
use crate::strategy::{ScheduleContext, Strategy};

#[derive(Debug, Clone)]
enum LevelKind {
    /// Scheduling decision: the enabled machine ids at this point.
    Sched(Vec<u64>),
    /// Boolean choice (two options).
    Bool,
    /// Integer choice in `[0, max)`.
    Int(u32),
}

#[derive(Debug, Clone)]
struct Level {
    kind: LevelKind,
    selected: usize,
    total: usize,
}

/// Exhaustive depth-first exploration up to the runtime's step bound.
#[derive(Debug, Default)]
pub struct DfsStrategy {
    stack: Vec<Level>,
    /// Position within the stack for the current iteration.
    depth: usize,
}

impl DfsStrategy {
    /// Creates a DFS strategy.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stack: Vec::new(),
            depth: 0,
        }
    }

    fn take_level(&mut self, kind: LevelKind, total: usize) -> Result<&Level> {
        if self.depth == self.stack.len() {
            self.stack.push(Level {
                kind,
                selected: 0,
                total,
            });
        } else {
            // Replaying the prefix: the program must request the same kind of
            // choice it did last time, or it is not deterministic.
            let level = &self.stack[self.depth];
            let matches = match (&level.kind, &kind) {
                (LevelKind::Sched(recorded), LevelKind::Sched(current)) => recorded == current,
                (LevelKind::Bool, LevelKind::Bool) => true,
                (LevelKind::Int(a), LevelKind::Int(b)) => a == b,
                _ => false,
            };
            if !matches {
                return Err(Error::internal(format!(
                    "program under test is nondeterministic: choice point {} changed between iterations",
                    self.depth
                )));
            }
        }
        let level = &self.stack[self.depth];
        self.depth += 1;
        Ok(level)
    }
}

impl Strategy for DfsStrategy {
    fn name(&self) -> &'static str {
        "dfs"
    }

    fn seed(&self) -> u64 {
        0
    }

    fn next_operation(&mut self, enabled: &[u64], _ctx: &ScheduleContext) -> Result<u64> {
        let level = self.take_level(LevelKind::Sched(enabled.to_vec()), enabled.len())?;
        let LevelKind::Sched(options) = &level.kind else {
            return Err(Error::internal("scheduling level holds non-sched options"));
        };
        Ok(options[level.selected])
    }

    fn next_bool(&mut self, _max: u32) -> Result<bool> {
        let level = self.take_level(LevelKind::Bool, 2)?;
        Ok(level.selected == 1)
    }

    fn next_int(&mut self, max: u32) -> Result<u32> {
        let max = max.max(1);
        let level = self.take_level(LevelKind::Int(max), max as usize)?;
        Ok(level.selected as u32)
    }

    fn prepare_next_iteration(&mut self) -> bool {
        while let Some(last) = self.stack.last_mut() {
            if last.selected + 1 < last.total {
                last.selected += 1;
                self.depth = 0;
                return true;
            }
            self.stack.pop();
        }
        false
    }
}
