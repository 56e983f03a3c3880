//! Configuration for a bug-finding test run.

use std::path::PathBuf;
use std::time::Duration;

/// Which exploration strategy drives the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    /// Uniform random exploration.
    #[default]
    Random,
    /// Exhaustive depth-first enumeration.
    Dfs,
    /// Priority-based exploration with random change points.
    Pct,
    /// Replay of a recorded schedule.
    Replay,
}

impl StrategyKind {
    /// Parses a strategy name as accepted on the command line.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "random" => Some(Self::Random),
            "dfs" => Some(Self::Dfs),
            "pct" => Some(Self::Pct),
            "replay" => Some(Self::Replay),
            _ => None,
        }
    }
}

/// Configuration for the testing engine and runtime.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Seed for seeded strategies.
    pub seed: u64,
    /// Exploration strategy.
    pub strategy: StrategyKind,
    /// Number of schedules to explore.
    pub iterations: u64,
    /// Maximum steps per iteration before forced termination.
    pub max_steps: u64,
    /// Priority change points for the PCT strategy.
    pub pct_depth: u32,
    /// Wall-clock budget for the whole run; checked between iterations.
    pub timeout: Option<Duration>,
    /// Schedule file to replay (replay strategy).
    pub replay_source: Option<PathBuf>,
    /// Where to write the schedule trace when a bug is found.
    pub schedule_output: Option<PathBuf>,
    /// CLI verbosity (0..=3); controls the runtime log level.
    pub verbosity: u8,
    /// Retries allowed per step under the reliable overlay.
    pub storage_retry_budget: u32,
}

impl TestConfig {
    /// Creates a configuration with the given seed and defaults otherwise.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            seed,
            strategy: StrategyKind::Random,
            iterations: 1,
            max_steps: 10_000,
            pct_depth: 3,
            timeout: None,
            replay_source: None,
            schedule_output: None,
            verbosity: 1,
            storage_retry_budget: 3,
        }
    }

    /// Sets the exploration strategy.
    #[must_use]
    pub const fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the number of iterations.
    #[must_use]
    pub const fn iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    /// Sets the per-iteration step bound.
    #[must_use]
    pub const fn max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Sets the PCT change-point depth.
    #[must_use]
    pub const fn pct_depth(mut self, depth: u32) -> Self {
        self.pct_depth = depth;
        self
    }

    /// Sets the wall-clock budget.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the schedule file to replay.
    #[must_use]
    pub fn replay_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.replay_source = Some(path.into());
        self.strategy = StrategyKind::Replay;
        self
    }

    /// Sets where to write the schedule trace on a found bug.
    #[must_use]
    pub fn schedule_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.schedule_output = Some(path.into());
        self
    }

    /// Sets the verbosity level.
    #[must_use]
    pub const fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Sets the reliable-overlay retry budget.
    #[must_use]
    pub const fn storage_retry_budget(mut self, budget: u32) -> Self {
        self.storage_retry_budget = budget;
        self
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new(42)
    }
}
