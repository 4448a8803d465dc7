//! Time parsing, formatting and timescale conversion utilities

use crate::error::{TrimError, TrimResult};

/// Microseconds per second
pub const MICROS_PER_SEC: i64 = 1_000_000;

/// Convert media ticks to microseconds, rounding to nearest
pub fn ticks_to_us(ticks: i64, timescale: u32) -> i64 {
    rescale_round(ticks, MICROS_PER_SEC, timescale as i64)
}

/// Convert microseconds to media ticks, rounding to nearest
pub fn us_to_ticks(us: i64, timescale: u32) -> i64 {
    rescale_round(us, timescale as i64, MICROS_PER_SEC)
}

/// Convert between two timescales, rounding to nearest
pub fn rescale(value: u64, from: u32, to: u32) -> u64 {
    if from == to || from == 0 {
        return value;
    }
    ((value as u128 * to as u128 + from as u128 / 2) / from as u128) as u64
}

/// `value * num / den`, rounded half away from zero
fn rescale_round(value: i64, num: i64, den: i64) -> i64 {
    if den == 0 {
        return 0;
    }
    let product = value as i128 * num as i128;
    let den = den as i128;
    let half = den / 2;
    let rounded = if product >= 0 {
        (product + half) / den
    } else {
        (product - half) / den
    };
    rounded as i64
}

/// Time parser for the formats accepted on the command line
pub struct TimeParser;

impl TimeParser {
    /// Create a new time parser
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self
    }
}

impl Default for TimeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeParser {
    /// Parse a time string to milliseconds
    ///
    /// Accepts `1500ms`, plain seconds (`1.5`), `MM:SS(.ms)` and `HH:MM:SS(.ms)`.
    pub fn parse_ms(&self, time_str: &str) -> TrimResult<u64> {
        let time_str = time_str.trim();
        let invalid = || TrimError::InvalidTime {
            time: time_str.to_string(),
        };

        if let Some(ms) = time_str.strip_suffix("ms") {
            return ms.trim().parse::<u64>().map_err(|_| invalid());
        }

        let parts: Vec<&str> = time_str.split(':').collect();
        let seconds = match parts.as_slice() {
            [secs] => self.parse_component(secs).ok_or_else(invalid)?,
            [mm, ss] => {
                let minutes = self.parse_whole(mm).ok_or_else(invalid)?;
                let secs = self.parse_component(ss).ok_or_else(invalid)?;
                if secs >= 60.0 {
                    return Err(invalid());
                }
                minutes * 60.0 + secs
            }
            [hh, mm, ss] => {
                let hours = self.parse_whole(hh).ok_or_else(invalid)?;
                let minutes = self.parse_whole(mm).ok_or_else(invalid)?;
                let secs = self.parse_component(ss).ok_or_else(invalid)?;
                if minutes >= 60.0 || secs >= 60.0 {
                    return Err(invalid());
                }
                hours * 3600.0 + minutes * 60.0 + secs
            }
            _ => return Err(invalid()),
        };

        Ok((seconds * 1000.0).round() as u64)
    }

    fn parse_whole(&self, part: &str) -> Option<f64> {
        part.parse::<u32>().ok().map(|v| v as f64)
    }

    fn parse_component(&self, part: &str) -> Option<f64> {
        let value = part.parse::<f64>().ok()?;
        if value.is_finite() && value >= 0.0 {
            Some(value)
        } else {
            None
        }
    }

    /// Format milliseconds as HH:MM:SS.mmm (hours omitted when zero)
    pub fn format_ms(&self, ms: u64) -> String {
        let hours = ms / 3_600_000;
        let minutes = (ms % 3_600_000) / 60_000;
        let secs = (ms % 60_000) / 1000;
        let millis = ms % 1000;

        if hours > 0 {
            format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
        } else {
            format!("{:02}:{:02}.{:03}", minutes, secs, millis)
        }
    }
}
