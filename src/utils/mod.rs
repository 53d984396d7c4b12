//! Common utilities and helpers

pub mod logging;

use std::time::Duration;

pub use logging::{init_logging, LogFormat, LogLevel, LoggingConfig, LoggingSystem};

const MIB: f64 = 1024.0 * 1024.0;

/// Size in mebibytes with two decimals, e.g. `12.34 MB`
pub fn format_size(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / MIB)
}

/// Format duration for display as `MM:SS.mmm`, or `HH:MM:SS.mmm` past an hour
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let milliseconds = duration.subsec_millis();

    if hours > 0 {
        format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, milliseconds)
    } else {
        format!("{:02}:{:02}.{:03}", minutes, seconds, milliseconds)
    }
}

/// Seconds as a display duration; negative or non-finite input shows as zero
pub fn format_seconds(seconds: f64) -> String {
    let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
    format_duration(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0.00 MB");
        assert_eq!(format_size(1024 * 1024), "1.00 MB");
        assert_eq!(format_size(12_939_428), "12.34 MB");
        assert_eq!(format_size(512 * 1024), "0.50 MB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(65_250)), "01:05.250");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05.000");
        assert_eq!(format_duration(Duration::ZERO), "00:00.000");
    }

    #[test]
    fn test_format_seconds_guards_bad_input() {
        assert_eq!(format_seconds(-3.0), "00:00.000");
        assert_eq!(format_seconds(f64::NAN), "00:00.000");
        assert_eq!(format_seconds(7.5), "00:07.500");
    }
}
