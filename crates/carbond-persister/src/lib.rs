// carbond-persister - The cache-to-whisper persistence pipeline
//
// Drains the cache's egress channel and commits each batch to its archive
// file. One worker consumes directly; with more, a shuffler fans batches
// out by crc32(metric) so all updates for a metric stay on one lane and no
// two workers ever race on the same file.

mod aggregation;
mod persister;
mod schemas;

pub use aggregation::{AggregationError, AggregationPolicy, WhisperAggregation};
pub use persister::{respawn, shard, Persister, PersisterError, PersisterSettings};
pub use schemas::{Schema, SchemaError, WhisperSchemas};
