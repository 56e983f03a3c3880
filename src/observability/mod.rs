//! Structured logging for the bug-finding runtime.
//!
//! The runtime never writes to stdout/stderr; everything observable goes
//! through structured entries collected here and drained by whoever is
//! driving the run (the testing engine, or a test). Entry content is
//! deterministic: no wall-clock timestamps, no addresses.

use core::fmt;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// A defect or fatal condition.
    Error,
    /// Something unexpected that the run survived (e.g. a dropped event).
    Warn,
    /// High-level progress: machine creation, iteration boundaries.
    Info,
    /// Per-step scheduling decisions.
    Debug,
}

impl LogLevel {
    /// Maps a CLI verbosity level (0..=3) to the maximum level recorded.
    #[must_use]
    pub const fn from_verbosity(verbosity: u8) -> Self {
        match verbosity {
            0 => Self::Error,
            1 => Self::Warn,
            2 => Self::Info,
            _ => Self::Debug,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        };
        f.write_str(name)
    }
}

/// A single structured log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Structured key/value context.
    pub fields: Vec<(String, String)>,
}

impl LogEntry {
    /// Creates an entry at the given level.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Creates an info-level entry.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    /// Creates a warn-level entry.
    #[must_use]
    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    /// Creates a debug-level entry.
    #[must_use]
    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, message)
    }

    /// Creates an error-level entry.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    /// Attaches a key/value field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((key.into(), value.to_string()));
        self
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level, self.message)?;
        for (key, value) in &self.fields {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}

/// Collects log entries up to a maximum level.
#[derive(Debug)]
pub struct LogCollector {
    max_level: LogLevel,
    entries: Vec<LogEntry>,
}

impl LogCollector {
    /// Creates a collector recording entries at or above `max_level` severity
    /// (i.e. entries whose level is `<= max_level` in the ordering).
    #[must_use]
    pub const fn new(max_level: LogLevel) -> Self {
        Self {
            max_level,
            entries: Vec::new(),
        }
    }

    /// Records an entry if it passes the level filter.
    pub fn log(&mut self, entry: LogEntry) {
        if entry.level <= self.max_level {
            self.entries.push(entry);
        }
    }

    /// Returns the number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the recorded entries.
    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Removes and returns all recorded entries.
    pub fn drain(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.entries)
    }
}

impl Default for LogCollector {
    fn default() -> Self {
        Self::new(LogLevel::Warn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filter_applies() {
        let mut collector = LogCollector::new(LogLevel::Warn);
        collector.log(LogEntry::error("boom"));
        collector.log(LogEntry::warn("odd"));
        collector.log(LogEntry::info("fyi"));
        collector.log(LogEntry::debug("chatty"));
        assert_eq!(collector.len(), 2);
    }

    #[test]
    fn verbosity_mapping() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Error);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(3), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(200), LogLevel::Debug);
    }

    #[test]
    fn entry_display_includes_fields() {
        let entry = LogEntry::info("step").with_field("machine", "Client(1)");
        assert_eq!(entry.to_string(), "[INFO] step machine=Client(1)");
    }
}
