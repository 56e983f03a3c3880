//! Trace infrastructure for replay and diagnosis.
//!
//! Two complementary records are produced by every run:
//!
//! - [`schedule::ScheduleTrace`]: the compact decision log (which machine ran,
//!   which random values were drawn), sufficient to replay a run exactly
//! - [`bug::BugTrace`]: the semantic log used by humans and tools to
//!   understand what happened

pub mod bug;
pub mod schedule;

pub use bug::{BugStep, BugStepKind, BugTrace};
pub use schedule::{ChoicePoint, ScheduleParseError, ScheduleTrace, SCHEDULE_FORMAT_HEADER};
