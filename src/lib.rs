// carbond - Graphite-compatible metrics cache and whisper persistence daemon
//
// The binary wires the crates together: receivers feed the cache ingress,
// the persister drains the cache egress into whisper files, carbonlink
// serves reads, and the app layer applies configuration live.

pub mod app;

pub use app::App;
