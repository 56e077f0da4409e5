use crate::{Result, WhisperError};

/// A `(precision, history)` pair: samples every `seconds_per_point`
/// seconds, `points` slots deep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub seconds_per_point: u32,
    pub points: u32,
}

impl Retention {
    pub fn new(seconds_per_point: u32, points: u32) -> Self {
        Self {
            seconds_per_point,
            points,
        }
    }

    /// Covered history in seconds.
    pub fn retention(&self) -> u32 {
        self.seconds_per_point * self.points
    }

    /// Parse one `precision:history` definition. Both Graphite forms are
    /// accepted: bare numbers (`"60:1440"` = 60s per point, 1440 points)
    /// and unit suffixes (`"1m:30d"`).
    pub fn parse(def: &str) -> Result<Self> {
        let bad = || WhisperError::InvalidRetention(def.to_string());

        let (precision, history) = def.trim().split_once(':').ok_or_else(bad)?;

        let seconds_per_point = parse_unit_value(precision).ok_or_else(bad)?;
        if seconds_per_point == 0 {
            return Err(bad());
        }

        let history = history.trim();
        let points = if history.chars().all(|c| c.is_ascii_digit()) {
            // Bare number on the right-hand side is a point count.
            history.parse::<u64>().map_err(|_| bad())?
        } else {
            let span = parse_unit_value(history).ok_or_else(bad)?;
            span / seconds_per_point
        };

        if points == 0 || points > u32::MAX as u64 || seconds_per_point > u32::MAX as u64 {
            return Err(bad());
        }

        Ok(Self::new(seconds_per_point as u32, points as u32))
    }
}

impl std::fmt::Display for Retention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.seconds_per_point, self.points)
    }
}

/// Parse a comma-separated retention list, e.g. `"10s:6h,1m:30d,1h:5y"`.
pub fn parse_retention_defs(defs: &str) -> Result<Vec<Retention>> {
    let retentions = defs
        .split(',')
        .map(Retention::parse)
        .collect::<Result<Vec<_>>>()?;
    validate_retentions(&retentions)?;
    Ok(retentions)
}

/// `"90"` -> 90, `"6h"` -> 21600. Case-insensitive units s/m/h/d/w/y.
fn parse_unit_value(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let n: u64 = digits.parse().ok()?;

    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 86400 * 7,
        "y" => 86400 * 365,
        _ => return None,
    };
    n.checked_mul(multiplier)
}

/// The constraints every whisper archive chain must satisfy.
pub(crate) fn validate_retentions(retentions: &[Retention]) -> Result<()> {
    let invalid = |reason: String| WhisperError::InvalidRetentions(reason);

    if retentions.is_empty() {
        return Err(invalid("no archives defined".into()));
    }

    for pair in retentions.windows(2) {
        let (higher, lower) = (pair[0], pair[1]);

        if higher.seconds_per_point >= lower.seconds_per_point {
            return Err(invalid(format!(
                "archive precisions must strictly decrease ({} then {})",
                higher, lower
            )));
        }
        if lower.seconds_per_point % higher.seconds_per_point != 0 {
            return Err(invalid(format!(
                "lower precision {} must be divisible by higher precision {}",
                lower.seconds_per_point, higher.seconds_per_point
            )));
        }
        if higher.retention() >= lower.retention() {
            return Err(invalid(format!(
                "archive {} must cover more time than {}",
                lower, higher
            )));
        }
        let per_lower_point = lower.seconds_per_point / higher.seconds_per_point;
        if higher.points < per_lower_point {
            return Err(invalid(format!(
                "archive {} has too few points to consolidate one point of {}",
                higher, lower
            )));
        }
    }

    Ok(())
}
