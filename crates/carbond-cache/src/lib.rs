// carbond-cache - The in-memory aggregation cache and its query paths
//
// One worker task owns all mutable cache state and multiplexes ingress,
// egress readiness, queries, settings changes and the periodic checkpoint.
// The carbonlink listener translates graphite-web's framed pickle queries
// into the worker's query channel.

mod cache;
mod carbonlink;
mod query;
mod settings;
mod storage;

pub use cache::Cache;
pub use carbonlink::{CarbonlinkListener, CarbonlinkSettings};
pub use query::{Query, Reply};
pub use settings::CacheSettings;
