// carbond-points - Metric samples, batches and the channel plumbing
//
// This crate contains the types that flow through the whole daemon: a
// `Point` sample, the per-metric `MetricBatch`, the plaintext line codec
// and the resizable, optionally throttled `Channel` that connects the
// receivers, the cache and the persister.

mod batch;
mod channel;
mod parse;

pub use batch::{now_unix, MetricBatch, Point};
pub use channel::{Channel, SendSlot, Sender};
pub use parse::{parse_line, ParseError};
