//! Uniform random exploration.

use crate::error::Result;
use crate::strategy::{ScheduleContext, Strategy};
use crate::util::DetRng;

/// Picks uniformly among enabled machines and choice values, driven by a
/// seeded deterministic stream. The stream runs on across iterations, so each
/// iteration explores a fresh schedule while the whole run stays a function
/// of the seed.
#[derive(Debug)]
pub struct RandomStrategy {
    seed: u64,
    rng: DetRng,
}

impl RandomStrategy {
    /// Creates a random strategy from a seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: DetRng::new(seed),
        }
    }
}

impl Strategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn seed(&self) -> u64 {
        self.seed
    }

    fn next_operation(&mut self, enabled: &[u64], _ctx: &ScheduleContext) -> Result<u64> {
        Ok(enabled[self.rng.next_usize(enabled.len())])
    }

    fn next_bool(&mut self, max: u32) -> Result<bool> {
        Ok(self.rng.next_u32(max.max(1)) == 0)
    }

    fn next_int(&mut self, max: u32) -> Result<u32> {
        Ok(self.rng.next_u32(max.max(1)))
    }

    fn prepare_next_iteration(&mut self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_decisions() {
        let ctx = ScheduleContext::default();
        let enabled = [1, 2, 3, 4];
        let mut a = RandomStrategy::new(99);
        let mut b = RandomStrategy::new(99);
        for _ in 0..50 {
            assert_eq!(
                a.next_operation(&enabled, &ctx).unwrap(),
                b.next_operation(&enabled, &ctx).unwrap()
            );
            assert_eq!(a.next_int(10).unwrap(), b.next_int(10).unwrap());
            assert_eq!(a.next_bool(2).unwrap(), b.next_bool(2).unwrap());
        }
    }

    #[test]
    fn picks_stay_in_enabled_set() {
        let ctx = ScheduleContext::default();
        let enabled = [7, 11];
        let mut strategy = RandomStrategy::new(3);
        for _ in 0..100 {
            let pick = strategy.next_operation(&enabled, &ctx).unwrap();
            assert!(enabled.contains(&pick));
        }
    }
}
