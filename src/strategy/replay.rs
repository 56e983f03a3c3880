//! Replay of a recorded schedule.
//!
//! The replay strategy re-issues, in order, the operation ids and choice
//! values from a serialized [`ScheduleTrace`]. It fails fast when the program
//! under test diverges: the expected machine is not enabled, the program asks
//! for a different kind of choice than was recorded, or the trace runs out
//! before the program does.

use crate::error::{Error, ErrorKind, Result};
use crate::strategy::{ScheduleContext, Strategy};
use crate::trace::{ChoicePoint, ScheduleTrace};

/// Replays a previously recorded schedule trace.
#[derive(Debug)]
pub struct ReplayStrategy {
    trace: ScheduleTrace,
    cursor: usize,
}

impl ReplayStrategy {
    /// Creates a replay strategy over a recorded trace.
    #[must_use]
    pub const fn new(trace: ScheduleTrace) -> Self {
        Self { trace, cursor: 0 }
    }

    /// Returns how many choice points have been consumed.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.cursor
    }

    fn next_point(&mut self) -> Result<ChoicePoint> {
        let point = self.trace.points().get(self.cursor).copied();
        point.ok_or_else(|| {
            Error::new(ErrorKind::ScheduleExhausted).with_context(format!(
                "schedule ended at choice point {} but the program kept running",
                self.cursor
            ))
        })
    }

    fn divergence(&self, expected: &str, actual: &str) -> Error {
        Error::new(ErrorKind::ReplayDivergence).with_context(format!(
            "choice point {}: schedule recorded {expected}, program requested {actual}",
            self.cursor
        ))
    }
}

impl Strategy for ReplayStrategy {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn seed(&self) -> u64 {
        self.trace.seed()
    }

    fn next_operation(&mut self, enabled: &[u64], _ctx: &ScheduleContext) -> Result<u64> {
        let point = self.next_point()?;
        let ChoicePoint::SchedulingStep(id) = point else {
            return Err(self.divergence(&format!("{point:?}"), "a scheduling step"));
        };
        if !enabled.contains(&id) {
            return Err(Error::new(ErrorKind::ReplayDivergence).with_context(format!(
                "choice point {}: machine {id} from the schedule is not enabled (enabled: {enabled:?})",
                self.cursor
            )));
        }
        self.cursor += 1;
        Ok(id)
    }

    fn next_bool(&mut self, _max: u32) -> Result<bool> {
        let point = self.next_point()?;
        let ChoicePoint::BoolChoice(value) = point else {
            return Err(self.divergence(&format!("{point:?}"), "a boolean choice"));
        };
        self.cursor += 1;
        Ok(value)
    }

    fn next_int(&mut self, _max: u32) -> Result<u32> {
        let point = self.next_point()?;
        let ChoicePoint::IntChoice(value) = point else {
            return Err(self.divergence(&format!("{point:?}"), "an integer choice"));
        };
        self.cursor += 1;
        Ok(value)
    }

    fn prepare_next_iteration(&mut self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> ScheduleTrace {
        let mut t = ScheduleTrace::new("random", 42, 1);
        t.push(ChoicePoint::SchedulingStep(1));
        t.push(ChoicePoint::BoolChoice(true));
        t.push(ChoicePoint::IntChoice(3));
        t
    }

    #[test]
    fn replays_in_order() {
        let ctx = ScheduleContext::default();
        let mut replay = ReplayStrategy::new(trace());
        assert_eq!(replay.next_operation(&[1, 2], &ctx).unwrap(), 1);
        assert!(replay.next_bool(2).unwrap());
        assert_eq!(replay.next_int(4).unwrap(), 3);
        assert_eq!(replay.position(), 3);
    }

    #[test]
    fn diverges_when_machine_not_enabled() {
        let ctx = ScheduleContext::default();
        let mut replay = ReplayStrategy::new(trace());
        let err = replay.next_operation(&[2, 3], &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReplayDivergence);
    }

    #[test]
    fn diverges_on_choice_kind_mismatch() {
        let mut replay = ReplayStrategy::new(trace());
        let err = replay.next_bool(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReplayDivergence);
    }

    #[test]
    fn reports_exhaustion() {
        let ctx = ScheduleContext::default();
        let mut replay = ReplayStrategy::new(ScheduleTrace::new("random", 1, 1));
        let err = replay.next_operation(&[1], &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScheduleExhausted);
    }

    #[test]
    fn single_pass_only() {
        let mut replay = ReplayStrategy::new(trace());
        assert!(!replay.prepare_next_iteration());
    }
}
