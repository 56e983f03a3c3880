//! Command-line argument handling for the test harness.
//!
//! Parsing is deliberately plain: a small flag set, explicit errors, no
//! dependency on an argument-parsing framework.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{StrategyKind, TestConfig};

/// Errors produced while parsing command-line arguments.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CliError {
    /// A flag that is not part of the surface.
    #[error("unknown flag `{0}`")]
    UnknownFlag(String),

    /// A flag that requires a value was given none.
    #[error("flag `{0}` requires a value")]
    MissingValue(String),

    /// A value that does not parse for its flag.
    #[error("invalid value `{value}` for flag `{flag}`")]
    BadValue {
        /// The flag name.
        flag: String,
        /// The offending value.
        value: String,
    },

    /// More than one positional test name.
    #[error("unexpected positional argument `{0}`")]
    UnexpectedPositional(String),
}

/// Parsed options for the `test` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOptions {
    /// Name of the registered test to run.
    pub test_name: Option<String>,
    /// Exploration strategy.
    pub strategy: StrategyKind,
    /// Strategy seed.
    pub seed: u64,
    /// Number of schedules to explore.
    pub iterations: u64,
    /// Per-iteration step bound.
    pub max_steps: u64,
    /// Wall-clock budget in seconds.
    pub timeout_secs: Option<u64>,
    /// Schedule file to replay.
    pub replay: Option<PathBuf>,
    /// Verbosity level (0..=3).
    pub verbosity: u8,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            test_name: None,
            strategy: StrategyKind::Random,
            seed: 0,
            iterations: 1,
            max_steps: 10_000,
            timeout_secs: None,
            replay: None,
            verbosity: 1,
        }
    }
}

impl TestOptions {
    /// Parses options from an argument list (without the program name).
    ///
    /// # Errors
    ///
    /// A [`CliError`] describing the first offending argument.
    pub fn parse<I>(args: I) -> Result<Self, CliError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--strategy" => {
                    let value = take_value(&mut args, &arg)?;
                    options.strategy = StrategyKind::from_name(&value)
                        .ok_or(CliError::BadValue { flag: arg, value })?;
                }
                "--seed" => options.seed = parse_number(&mut args, &arg)?,
                "--iterations" => options.iterations = parse_number(&mut args, &arg)?,
                "--max-steps" => options.max_steps = parse_number(&mut args, &arg)?,
                "--timeout" => options.timeout_secs = Some(parse_number(&mut args, &arg)?),
                "--replay" => {
                    let value = take_value(&mut args, &arg)?;
                    options.replay = Some(PathBuf::from(value));
                    options.strategy = StrategyKind::Replay;
                }
                "--verbose" => {
                    let value: u64 = parse_number(&mut args, &arg)?;
                    if value > 3 {
                        return Err(CliError::BadValue {
                            flag: arg,
                            value: value.to_string(),
                        });
                    }
                    options.verbosity = value as u8;
                }
                flag if flag.starts_with("--") => {
                    return Err(CliError::UnknownFlag(flag.to_string()));
                }
                positional => {
                    if options.test_name.is_some() {
                        return Err(CliError::UnexpectedPositional(positional.to_string()));
                    }
                    options.test_name = Some(positional.to_string());
                }
            }
        }
        Ok(options)
    }

    /// Converts the options into an engine configuration.
    #[must_use]
    pub fn into_config(self) -> TestConfig {
        let mut config = TestConfig::new(self.seed)
            .strategy(self.strategy)
            .iterations(self.iterations)
            .max_steps(self.max_steps)
            .verbosity(self.verbosity);
        if let Some(secs) = self.timeout_secs {
            config = config.timeout(Duration::from_secs(secs));
        }
        if let Some(path) = self.replay {
            config = config.replay_source(path);
        }
        config
    }
}

fn take_value<I>(args: &mut I, flag: &str) -> Result<String, CliError>
where
    I: Iterator<Item = String>,
{
    args.next().ok_or_else(|| CliError::MissingValue(flag.to_string()))
}

fn parse_number<I, N>(args: &mut I, flag: &str) -> Result<N, CliError>
where
    I: Iterator<Item = String>,
    N: std::str::FromStr,
{
    let value = take_value(args, flag)?;
    value.parse().map_err(|_| CliError::BadValue {
        flag: flag.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<TestOptions, CliError> {
        TestOptions::parse(args.iter().map(ToString::to_string))
    }

    #[test]
    fn full_flag_set() {
        let options = parse(&[
            "--strategy",
            "pct",
            "--seed",
            "42",
            "--iterations",
            "100",
            "--max-steps",
            "5000",
            "--timeout",
            "60",
            "--verbose",
            "2",
            "ping_pong",
        ])
        .unwrap();
        assert_eq!(options.strategy, StrategyKind::Pct);
        assert_eq!(options.seed, 42);
        assert_eq!(options.iterations, 100);
        assert_eq!(options.max_steps, 5000);
        assert_eq!(options.timeout_secs, Some(60));
        assert_eq!(options.verbosity, 2);
        assert_eq!(options.test_name.as_deref(), Some("ping_pong"));
    }

    #[test]
    fn replay_flag_selects_replay_strategy() {
        let options = parse(&["--replay", "bug.sched"]).unwrap();
        assert_eq!(options.strategy, StrategyKind::Replay);
        assert_eq!(options.replay, Some(PathBuf::from("bug.sched")));
    }

    #[test]
    fn unknown_flag_is_rejected() {
        assert_eq!(
            parse(&["--frobnicate"]),
            Err(CliError::UnknownFlag("--frobnicate".to_string()))
        );
    }

    #[test]
    fn missing_value_is_rejected() {
        assert_eq!(
            parse(&["--seed"]),
            Err(CliError::MissingValue("--seed".to_string()))
        );
    }

    #[test]
    fn bad_strategy_is_rejected() {
        assert_eq!(
            parse(&["--strategy", "bfs"]),
            Err(CliError::BadValue {
                flag: "--strategy".to_string(),
                value: "bfs".to_string(),
            })
        );
    }

    #[test]
    fn second_positional_is_rejected() {
        assert_eq!(
            parse(&["a", "b"]),
            Err(CliError::UnexpectedPositional("b".to_string()))
        );
    }

    #[test]
    fn into_config_carries_everything() {
        let options = parse(&["--seed", "9", "--timeout", "5", "--iterations", "7"]).unwrap();
        let config = options.into_config();
        assert_eq!(config.seed, 9);
        assert_eq!(config.iterations, 7);
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));
    }
}
