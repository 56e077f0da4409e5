use carbond_points::MetricBatch;
use tokio::sync::oneshot;

/// A point-in-time read of one metric's cached samples.
#[derive(Debug)]
pub struct Query {
    pub metric: String,
    pub reply: oneshot::Sender<Reply>,
}

/// Snapshot answer; `points` is a deep copy the caller owns outright.
#[derive(Debug, Default)]
pub struct Reply {
    pub points: Option<MetricBatch>,
}
