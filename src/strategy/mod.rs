//! Exploration strategies.
//!
//! A strategy owns every decision the scheduler delegates: which enabled
//! machine advances next, and the value of each nondeterministic choice. The
//! runtime records what the strategy decided; replaying those records through
//! [`replay::ReplayStrategy`] reproduces the run exactly.
//!
//! - [`random::RandomStrategy`]: uniform choice from a seeded stream
//! - [`dfs::DfsStrategy`]: exhaustive enumeration up to a step bound
//! - [`pct::PctStrategy`]: machine priorities with random change points; the
//!   strategy class that finds ordering bugs efficiently
//! - [`replay::ReplayStrategy`]: re-issues a recorded schedule, failing fast
//!   on divergence

pub mod dfs;
pub mod pct;
pub mod random;
pub mod replay;

use crate::error::Result;

pub use dfs::DfsStrategy;
pub use pct::PctStrategy;
pub use random::RandomStrategy;
pub use replay::ReplayStrategy;

/// Read-only scheduling state passed to the strategy at each decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleContext {
    /// Steps executed so far in this iteration.
    pub steps: u64,
    /// Zero-based iteration index within the test run.
    pub iteration: u64,
}

/// A pluggable exploration strategy.
///
/// All methods take `&mut self`: strategies are stateful, and their state is
/// part of what makes a run reproducible.
pub trait Strategy {
    /// Short name for trace headers and reports.
    fn name(&self) -> &'static str;

    /// The seed this strategy was constructed with.
    fn seed(&self) -> u64;

    /// Picks the next machine to advance from the enabled set.
    ///
    /// `enabled` is non-empty and sorted by machine id. The returned id must
    /// be a member of `enabled`; the scheduler treats anything else as an
    /// internal error.
    ///
    /// # Errors
    ///
    /// Replay divergence or schedule exhaustion (replay strategy only).
    fn next_operation(&mut self, enabled: &[u64], ctx: &ScheduleContext) -> Result<u64>;

    /// Produces a nondeterministic boolean; under random exploration, true
    /// with probability `1/max`.
    ///
    /// # Errors
    ///
    /// Replay divergence or schedule exhaustion (replay strategy only).
    fn next_bool(&mut self, max: u32) -> Result<bool>;

    /// Produces a nondeterministic integer in `[0, max)`.
    ///
    /// # Errors
    ///
    /// Replay divergence or schedule exhaustion (replay strategy only).
    fn next_int(&mut self, max: u32) -> Result<u32>;

    /// Advances to the next schedule. Returns false when the strategy has no
    /// more schedules to offer (the engine then stops iterating).
    fn prepare_next_iteration(&mut self) -> bool;
}
