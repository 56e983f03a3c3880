//! Schedule traces: the replayable record of a run.
//!
//! A schedule trace is the ordered list of every decision the runtime made on
//! behalf of the program: which machine ran each step, and the value of every
//! nondeterministic choice. It is sufficient input to reproduce the run
//! exactly, and is the sole input to the replay strategy.
//!
//! # File format
//!
//! UTF-8 text, one entry per line, with a header line:
//!
//! ```text
//! # psharp-schedule v1 strategy=random seed=42 iterations=3
//! S 1
//! B 0
//! I 3
//! S 2
//! ```
//!
//! `S <u64>` is a scheduling step (the chosen machine id), `B 0`/`B 1` a
//! boolean choice, `I <u32>` an integer choice.

use std::fmt::Write as _;
use std::path::Path;

/// Format tag in the header line. Version bumps go here.
pub const SCHEDULE_FORMAT_HEADER: &str = "# psharp-schedule v1";

/// One recorded decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoicePoint {
    /// The machine granted this step, by id value.
    SchedulingStep(u64),
    /// A nondeterministic boolean choice.
    BoolChoice(bool),
    /// A nondeterministic integer choice.
    IntChoice(u32),
}

/// Errors raised while parsing a schedule trace.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleParseError {
    /// The header line is missing or malformed.
    #[error("missing or malformed header, expected `{SCHEDULE_FORMAT_HEADER} ...`")]
    BadHeader,

    /// A line does not match any entry form.
    #[error("line {line}: unrecognized entry `{content}`")]
    BadEntry {
        /// 1-based line number.
        line: usize,
        /// The offending line content.
        content: String,
    },

    /// The file could not be read.
    #[error("cannot read schedule file: {0}")]
    Io(#[from] std::io::Error),
}

/// An append-only schedule trace with its provenance header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleTrace {
    strategy: String,
    seed: u64,
    iterations: u64,
    points: Vec<ChoicePoint>,
}

impl ScheduleTrace {
    /// Creates an empty trace for the given strategy provenance.
    #[must_use]
    pub fn new(strategy: &str, seed: u64, iterations: u64) -> Self {
        Self {
            strategy: strategy.to_string(),
            seed,
            iterations,
            points: Vec::new(),
        }
    }

    /// The strategy name recorded in the header.
    #[must_use]
    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    /// The seed recorded in the header.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// The iteration count recorded in the header.
    #[must_use]
    pub const fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Appends a choice point.
    pub fn push(&mut self, point: ChoicePoint) {
        self.points.push(point);
    }

    /// Returns the recorded choice points in order.
    #[must_use]
    pub fn points(&self) -> &[ChoicePoint] {
        &self.points
    }

    /// Returns the number of recorded choice points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Discards all recorded points, keeping the provenance header.
    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Serializes the trace to its text format.
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{SCHEDULE_FORMAT_HEADER} strategy={} seed={} iterations={}",
            self.strategy, self.seed, self.iterations
        );
        for point in &self.points {
            match point {
                ChoicePoint::SchedulingStep(id) => {
                    let _ = writeln!(out, "S {id}");
                }
                ChoicePoint::BoolChoice(value) => {
                    let _ = writeln!(out, "B {}", u8::from(*value));
                }
                ChoicePoint::IntChoice(value) => {
                    let _ = writeln!(out, "I {value}");
                }
            }
        }
        out
    }

    /// Parses a trace from its text format.
    ///
    /// # Errors
    ///
    /// Returns a parse error on a malformed header or entry line.
    pub fn parse(text: &str) -> Result<Self, ScheduleParseError> {
        let mut lines = text.lines().enumerate();
        let (_, header) = lines.next().ok_or(ScheduleParseError::BadHeader)?;
        let rest = header
            .strip_prefix(SCHEDULE_FORMAT_HEADER)
            .ok_or(ScheduleParseError::BadHeader)?;

        let mut strategy = None;
        let mut seed = None;
        let mut iterations = None;
        for field in rest.split_whitespace() {
            match field.split_once('=') {
                Some(("strategy", value)) => strategy = Some(value.to_string()),
                Some(("seed", value)) => seed = value.parse::<u64>().ok(),
                Some(("iterations", value)) => iterations = value.parse::<u64>().ok(),
                _ => return Err(ScheduleParseError::BadHeader),
            }
        }
        let (Some(strategy), Some(seed), Some(iterations)) = (strategy, seed, iterations) else {
            return Err(ScheduleParseError::BadHeader);
        };

        let mut trace = Self::new(&strategy, seed, iterations);
        for (index, line) in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let bad = || ScheduleParseError::BadEntry {
                line: index + 1,
                content: line.to_string(),
            };
            let point = match line.split_once(' ') {
                Some(("S", id)) => ChoicePoint::SchedulingStep(id.parse().map_err(|_| bad())?),
                Some(("B", "0")) => ChoicePoint::BoolChoice(false),
                Some(("B", "1")) => ChoicePoint::BoolChoice(true),
                Some(("I", value)) => ChoicePoint::IntChoice(value.parse().map_err(|_| bad())?),
                _ => return Err(bad()),
            };
            trace.push(point);
        }
        Ok(trace)
    }

    /// Writes the trace to a file.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ScheduleParseError> {
        std::fs::write(path, self.serialize())?;
        Ok(())
    }

    /// Reads a trace from a file.
    ///
    /// # Errors
    ///
    /// Returns an IO error or a parse error.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, ScheduleParseError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ScheduleTrace {
        let mut trace = ScheduleTrace::new("random", 42, 3);
        trace.push(ChoicePoint::SchedulingStep(1));
        trace.push(ChoicePoint::BoolChoice(true));
        trace.push(ChoicePoint::IntChoice(7));
        trace.push(ChoicePoint::SchedulingStep(2));
        trace
    }

    #[test]
    fn serialize_parse_roundtrip() {
        let trace = sample();
        let text = trace.serialize();
        assert!(text.starts_with("# psharp-schedule v1 strategy=random seed=42 iterations=3"));
        let parsed = ScheduleTrace::parse(&text).unwrap();
        assert_eq!(parsed, trace);
    }

    #[test]
    fn bool_choices_use_zero_one() {
        let mut trace = ScheduleTrace::new("dfs", 0, 1);
        trace.push(ChoicePoint::BoolChoice(false));
        trace.push(ChoicePoint::BoolChoice(true));
        let text = trace.serialize();
        assert!(text.contains("B 0\nB 1\n"));
    }

    #[test]
    fn missing_header_is_rejected() {
        let err = ScheduleTrace::parse("S 1\n").unwrap_err();
        assert!(matches!(err, ScheduleParseError::BadHeader));
    }

    #[test]
    fn malformed_entry_reports_line() {
        let text = "# psharp-schedule v1 strategy=random seed=1 iterations=1\nS 1\nX 9\n";
        let err = ScheduleTrace::parse(text).unwrap_err();
        match err {
            ScheduleParseError::BadEntry { line, content } => {
                assert_eq!(line, 3);
                assert_eq!(content, "X 9");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn blank_lines_are_tolerated() {
        let text = "# psharp-schedule v1 strategy=pct seed=9 iterations=2\n\nS 4\n\n";
        let parsed = ScheduleTrace::parse(text).unwrap();
        assert_eq!(parsed.points(), &[ChoicePoint::SchedulingStep(4)]);
        assert_eq!(parsed.strategy(), "pct");
    }
}
