//! The testing engine.
//!
//! Drives the iteration loop around the runtime: build the strategy from the
//! configuration, run the test entry point under a fresh runtime per
//! iteration, and stop at the first bug, when the strategy has no more
//! schedules, when the iteration budget is spent, or when the wall-clock
//! budget runs out. On a bug, the schedule trace is written out so the run
//! can be replayed.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::{StrategyKind, TestConfig};
use crate::error::{Bug, Error, Result};
use crate::observability::LogEntry;
use crate::runtime::{RunStatus, Runtime, SharedStrategy};
use crate::strategy::{DfsStrategy, PctStrategy, RandomStrategy, ReplayStrategy, Strategy};
use crate::trace::ScheduleTrace;

/// A reported bug, flattened for serialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BugReport {
    /// Error kind, as display text.
    pub kind: String,
    /// Full bug message.
    pub message: String,
    /// Machine the bug is attributed to, if any.
    pub machine: Option<String>,
    /// State the machine was in, if known.
    pub state: Option<String>,
}

impl BugReport {
    fn from_bug(bug: &Bug) -> Self {
        Self {
            kind: bug.error.kind().to_string(),
            message: bug.to_string(),
            machine: bug.machine.as_ref().map(ToString::to_string),
            state: bug.state.as_ref().map(ToString::to_string),
        }
    }
}

/// Summary of a test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    /// Strategy that drove the run.
    pub strategy: String,
    /// Seed the strategy ran under.
    pub seed: u64,
    /// Iterations actually executed.
    pub iterations_run: u64,
    /// Steps executed across all iterations.
    pub total_steps: u64,
    /// The first bug found, if any.
    pub bug: Option<BugReport>,
    /// Serialized schedule trace of the buggy iteration.
    pub schedule_trace: Option<String>,
    /// Serialized bug trace (JSON) of the buggy iteration.
    pub bug_trace: Option<String>,
    /// Wall-clock duration of the run in milliseconds.
    pub elapsed_ms: u128,
}

impl TestReport {
    /// Returns true if the run found a bug.
    #[must_use]
    pub const fn found_bug(&self) -> bool {
        self.bug.is_some()
    }
}

/// Runs a test entry point under controlled schedules.
pub struct TestingEngine {
    config: TestConfig,
    entry: Box<dyn Fn(&Runtime) -> Result<()>>,
}

impl TestingEngine {
    /// Creates an engine for a test entry point.
    ///
    /// The entry point is invoked once per iteration against a fresh
    /// runtime; it registers machine types and monitors and creates the
    /// initial machines.
    pub fn new(config: TestConfig, entry: impl Fn(&Runtime) -> Result<()> + 'static) -> Self {
        Self {
            config,
            entry: Box::new(entry),
        }
    }

    fn build_strategy(&self) -> Result<Box<dyn Strategy>> {
        Ok(match self.config.strategy {
            StrategyKind::Random => Box::new(RandomStrategy::new(self.config.seed)),
            StrategyKind::Dfs => Box::new(DfsStrategy::new()),
            StrategyKind::Pct => Box::new(PctStrategy::new(
                self.config.seed,
                self.config.pct_depth,
                self.config.max_steps,
            )),
            StrategyKind::Replay => {
                let path = self.config.replay_source.as_ref().ok_or_else(|| {
                    Error::configuration("replay strategy requires a schedule file")
                })?;
                let trace = ScheduleTrace::read_from(path).map_err(|e| {
                    Error::configuration(format!("cannot load schedule: {e}"))
                })?;
                Box::new(ReplayStrategy::new(trace))
            }
        })
    }

    /// Runs the configured number of iterations, stopping at the first bug.
    ///
    /// # Errors
    ///
    /// Configuration errors from strategy construction or the test entry
    /// point; internal runtime failures are reported in the `bug` field
    /// instead.
    pub fn run(&self) -> Result<TestReport> {
        let started = Instant::now();
        let strategy: SharedStrategy = Rc::new(RefCell::new(self.build_strategy()?));
        let (name, seed) = {
            let s = strategy.borrow();
            (s.name().to_string(), s.seed())
        };

        let mut report = TestReport {
            strategy: name,
            seed,
            iterations_run: 0,
            total_steps: 0,
            bug: None,
            schedule_trace: None,
            bug_trace: None,
            elapsed_ms: 0,
        };

        for iteration in 0..self.config.iterations.max(1) {
            if let Some(budget) = self.config.timeout {
                if started.elapsed() >= budget {
                    break;
                }
            }

            let runtime = Runtime::new(&self.config, Rc::clone(&strategy));
            runtime.inner.iteration.set(iteration);
            match (self.entry)(&runtime) {
                Ok(()) => {}
                Err(error) if error.is_bug() => {
                    runtime.inner.record_bug(Bug::global(error));
                }
                Err(error) => return Err(error),
            }

            let status = if runtime.bug().is_some() {
                RunStatus::BugFound
            } else {
                runtime.run()
            };
            report.iterations_run += 1;
            report.total_steps += runtime.steps();

            if let Some(bug) = runtime.bug() {
                let schedule = runtime.schedule_trace();
                if let Some(path) = &self.config.schedule_output {
                    if let Err(error) = schedule.write_to(path) {
                        runtime.inner.log(
                            LogEntry::warn("cannot write schedule trace")
                                .with_field("error", error),
                        );
                    }
                }
                report.bug = Some(BugReport::from_bug(&bug));
                report.schedule_trace = Some(schedule.serialize());
                report.bug_trace = runtime.bug_trace().to_json().ok();
                break;
            }

            if status == RunStatus::Stopped {
                break;
            }
            if !strategy.borrow_mut().prepare_next_iteration() {
                break;
            }
        }

        report.elapsed_ms = started.elapsed().as_millis();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineTypeBuilder;

    #[derive(Default)]
    struct Counter {
        count: u32,
    }

    fn faulty_machine() -> crate::machine::MachineType {
        MachineTypeBuilder::<Counter>::new("Faulty")
            .state("Init", |s| {
                s.start().on_entry(|m: &mut Counter, cx| {
                    m.count += 1;
                    cx.assert_that(m.count == 0, "count must stay zero")
                })
            })
            .build()
            .unwrap()
    }

    #[test]
    fn engine_reports_the_first_bug() {
        let config = TestConfig::new(7).iterations(5);
        let engine = TestingEngine::new(config, |runtime| {
            runtime.register(faulty_machine())?;
            runtime.create_machine("Faulty", None)?;
            Ok(())
        });
        let report = engine.run().unwrap();
        assert!(report.found_bug());
        assert_eq!(report.iterations_run, 1);
        let bug = report.bug.unwrap();
        assert_eq!(bug.kind, "assertion failure");
        assert!(report.schedule_trace.is_some());
        assert!(report.bug_trace.is_some());
    }

    #[test]
    fn replay_without_source_is_a_configuration_error() {
        let mut config = TestConfig::new(7);
        config.strategy = StrategyKind::Replay;
        let engine = TestingEngine::new(config, |_runtime| Ok(()));
        let err = engine.run().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn clean_program_runs_all_iterations() {
        #[derive(Default)]
        struct Quiet;
        let config = TestConfig::new(7).iterations(3);
        let engine = TestingEngine::new(config, |runtime| {
            runtime.register(
                MachineTypeBuilder::<Quiet>::new("Quiet")
                    .state("Init", |s| s.start())
                    .build()
                    .unwrap(),
            )?;
            runtime.create_machine("Quiet", None)?;
            Ok(())
        });
        let report = engine.run().unwrap();
        assert!(!report.found_bug());
        assert_eq!(report.iterations_run, 3);
    }
}
