//! Priority-based exploration with random change points.
//!
//! Each machine gets a random integer priority the first time it becomes
//! schedulable. At every decision the highest-priority enabled machine runs,
//! with ties broken by the random stream. A small number of *priority change
//! points* are sampled over the step bound; when a decision lands on one, the
//! currently dominant machine is demoted to the lowest priority, forcing a
//! different machine ahead of it.
//!
//! Keeping a few machines dominant for long stretches, with rare demotions,
//! is what makes this strategy effective at exposing ordering bugs that
//! uniform random scheduling almost never hits.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::strategy::{ScheduleContext, Strategy};
use crate::util::DetRng;

/// Priorities are drawn from `[1, PRIORITY_RANGE]`; demotion assigns 0.
const PRIORITY_RANGE: u32 = 15;

/// Priority-based strategy with random priority change points.
#[derive(Debug)]
pub struct PctStrategy {
    seed: u64,
    rng: DetRng,
    /// Number of priority change points per iteration.
    depth: u32,
    /// Step horizon used to place change points.
    max_steps: u64,
    priorities: BTreeMap<u64, u32>,
    change_points: BTreeSet<u64>,
    steps_taken: u64,
}

impl PctStrategy {
    /// Creates a PCT-style strategy.
    ///
    /// `depth` is the number of priority change points; `max_steps` the step
    /// horizon over which they are placed.
    #[must_use]
    pub fn new(seed: u64, depth: u32, max_steps: u64) -> Self {
        let mut strategy = Self {
            seed,
            rng: DetRng::new(seed),
            depth,
            max_steps: max_steps.max(1),
            priorities: BTreeMap::new(),
            change_points: BTreeSet::new(),
            steps_taken: 0,
        };
        strategy.draw_change_points();
        strategy
    }

    fn draw_change_points(&mut self) {
        self.change_points.clear();
        for _ in 0..self.depth {
            let point = self.rng.next_u64() % self.max_steps;
            self.change_points.insert(point);
        }
    }

    /// The enabled machine that currently holds the highest priority, ties
    /// broken by the random stream.
    fn dominant(&mut self, enabled: &[u64]) -> u64 {
        let best = enabled
            .iter()
            .map(|id| self.priorities.get(id).copied().unwrap_or(0))
            .max()
            .unwrap_or(0);
        let tied: Vec<u64> = enabled
            .iter()
            .copied()
            .filter(|id| self.priorities.get(id).copied().unwrap_or(0) == best)
            .collect();
        if tied.len() == 1 {
            tied[0]
        } else {
            tied[self.rng.next_usize(tied.len())]
        }
    }
}

impl Strategy for PctStrategy {
    fn name(&self) -> &'static str {
        "pct"
    }

    fn seed(&self) -> u64 {
        self.seed
    }

    fn next_operation(&mut self, enabled: &[u64], _ctx: &ScheduleContext) -> Result<u64> {
        let mut unseen: Vec<u64> = enabled
            .iter()
            .copied()
            .filter(|id| !self.priorities.contains_key(id))
            .collect();
        if !unseen.is_empty() {
            // Priority assignment order comes from the random stream, not
            // from the enabled set's id ordering.
            self.rng.shuffle(&mut unseen);
            for id in unseen {
                let priority = self.rng.next_u32(PRIORITY_RANGE) + 1;
                self.priorities.insert(id, priority);
            }
        }
        if self.change_points.contains(&self.steps_taken) {
            let victim = self.dominant(enabled);
            self.priorities.insert(victim, 0);
        }
        self.steps_taken += 1;
        Ok(self.dominant(enabled))
    }

    fn next_bool(&mut self, max: u32) -> Result<bool> {
        Ok(self.rng.next_u32(max.max(1)) == 0)
    }

    fn next_int(&mut self, max: u32) -> Result<u32> {
        Ok(self.rng.next_u32(max.max(1)))
    }

    fn prepare_next_iteration(&mut self) -> bool {
        self.priorities.clear();
        self.steps_taken = 0;
        self.draw_change_points();
        true
    }
}
