use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock as whole seconds since the unix epoch.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A single metric sample: a unix timestamp in seconds and a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp: i64,
    pub value: f64,
}

/// An accumulation of samples for one metric, pending persistence.
///
/// The metric name never changes after construction and `data` keeps its
/// insertion order; per-metric persistence order relies on both.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricBatch {
    pub metric: String,
    pub data: Vec<Point>,
}

impl MetricBatch {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            data: Vec::new(),
        }
    }

    /// Batch with a single sample.
    pub fn one_point(metric: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            metric: metric.into(),
            data: vec![Point { timestamp, value }],
        }
    }

    /// Batch with a single sample stamped with the current time. Used for
    /// the synthetic checkpoint metrics every component emits.
    pub fn now_point(metric: impl Into<String>, value: f64) -> Self {
        Self::one_point(metric, value, now_unix())
    }

    pub fn append(&mut self, point: Point) {
        self.data.push(point);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
