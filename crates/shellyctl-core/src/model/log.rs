use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shellyctl_api::{LogLine, PRINT_LEVEL};

/// One buffered line of device debug output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Seconds, as reported by the device.
    pub timestamp: f64,
    /// `-1` for `print()` output, otherwise a log level.
    pub level: i64,
    pub message: String,
}

impl LogEntry {
    pub fn is_print(&self) -> bool {
        self.level == PRINT_LEVEL
    }

    /// The device timestamp as a UTC instant, if it is a valid one.
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        if !self.timestamp.is_finite() {
            return None;
        }
        let millis = (self.timestamp * 1000.0).round() as i64;
        DateTime::from_timestamp_millis(millis)
    }
}

impl From<LogLine> for LogEntry {
    fn from(line: LogLine) -> Self {
        Self {
            timestamp: line.ts,
            level: line.level,
            message: line.data,
        }
    }
}

/// Which debug output reaches the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleFormat {
    /// `print()` output (level -1).
    pub show_print: bool,
    /// Every other level.
    pub show_log: bool,
}

impl Default for ConsoleFormat {
    fn default() -> Self {
        Self {
            show_print: true,
            show_log: false,
        }
    }
}

impl ConsoleFormat {
    pub fn admits(&self, entry: &LogEntry) -> bool {
        if entry.is_print() {
            self.show_print
        } else {
            self.show_log
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(level: i64) -> LogEntry {
        LogEntry {
            timestamp: 1_700_000_000.5,
            level,
            message: "x".into(),
        }
    }

    #[test]
    fn default_format_shows_only_print_output() {
        let format = ConsoleFormat::default();
        assert!(format.admits(&entry(-1)));
        assert!(!format.admits(&entry(2)));
    }

    #[test]
    fn log_flag_governs_every_other_level() {
        let format = ConsoleFormat {
            show_print: false,
            show_log: true,
        };
        assert!(!format.admits(&entry(-1)));
        assert!(format.admits(&entry(0)));
        assert!(format.admits(&entry(3)));
    }

    #[test]
    fn timestamp_converts_to_utc() {
        let ts = entry(0).timestamp_utc().unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 500);
    }
}
