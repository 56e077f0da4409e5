// carbond-whisper - Whisper round-robin archive files
//
// The fixed-layout on-disk time series format of the Graphite ecosystem.
// Pure blocking file I/O, no async, no runtime dependencies; callers that
// cannot afford to block run it on a blocking pool.
//
// Layout, all big-endian:
//   metadata:      aggregation u32 | max retention u32 | xFilesFactor f32 | archive count u32
//   archive info:  offset u32 | seconds per point u32 | points u32   (per archive)
//   archive data:  (interval u32 | value f64) slots, round-robin per archive

use std::io;
use std::path::PathBuf;

use thiserror::Error;

mod file;
mod retention;

pub use file::{TimeSeries, Whisper};
pub use retention::{parse_retention_defs, Retention};

/// Errors raised by archive file operations.
#[derive(Debug, Error)]
pub enum WhisperError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("invalid retention definition {0:?}")]
    InvalidRetention(String),

    #[error("invalid retentions: {0}")]
    InvalidRetentions(String),

    #[error("unknown aggregation method {0:?}")]
    UnknownAggregation(String),

    #[error("xFilesFactor must be within [0,1], got {0}")]
    InvalidXFilesFactor(f32),

    #[error("corrupt whisper file {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("invalid fetch range {from}..{until}")]
    InvalidTimeRange { from: i64, until: i64 },
}

pub type Result<T> = std::result::Result<T, WhisperError>;

/// Roll-up function applied when a higher-precision archive cascades into a
/// lower-precision one. Codes match the on-disk values used across the
/// whisper ecosystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMethod {
    Average,
    Sum,
    Last,
    Max,
    Min,
}

impl AggregationMethod {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "average" | "avg" => Some(Self::Average),
            "sum" => Some(Self::Sum),
            "last" => Some(Self::Last),
            "max" => Some(Self::Max),
            "min" => Some(Self::Min),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Sum => "sum",
            Self::Last => "last",
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    pub(crate) fn code(&self) -> u32 {
        match self {
            Self::Average => 1,
            Self::Sum => 2,
            Self::Last => 3,
            Self::Max => 4,
            Self::Min => 5,
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Average),
            2 => Some(Self::Sum),
            3 => Some(Self::Last),
            4 => Some(Self::Max),
            5 => Some(Self::Min),
            _ => None,
        }
    }

    pub(crate) fn apply(&self, values: &[f64]) -> f64 {
        match self {
            Self::Average => values.iter().sum::<f64>() / values.len() as f64,
            Self::Sum => values.iter().sum(),
            Self::Last => values[values.len() - 1],
            Self::Max => values.iter().cloned().fold(f64::MIN, f64::max),
            Self::Min => values.iter().cloned().fold(f64::MAX, f64::min),
        }
    }
}

impl std::fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One sample handed to [`Whisper::update_many`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSeriesPoint {
    pub time: i64,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregation_names_round_trip() {
        for name in ["average", "sum", "last", "max", "min"] {
            let m = AggregationMethod::from_name(name).unwrap();
            assert_eq!(m.name(), name);
            assert_eq!(AggregationMethod::from_code(m.code()), Some(m));
        }
        assert_eq!(AggregationMethod::from_name("avg"), Some(AggregationMethod::Average));
        assert_eq!(AggregationMethod::from_name("median"), None);
    }

    #[test]
    fn aggregation_applies() {
        let vals = [1.0, 2.0, 4.0];
        assert_eq!(AggregationMethod::Average.apply(&vals), 7.0 / 3.0);
        assert_eq!(AggregationMethod::Sum.apply(&vals), 7.0);
        assert_eq!(AggregationMethod::Last.apply(&vals), 4.0);
        assert_eq!(AggregationMethod::Max.apply(&vals), 4.0);
        assert_eq!(AggregationMethod::Min.apply(&vals), 1.0);
    }
}
