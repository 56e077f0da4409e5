use tokio::sync::oneshot;

/// Runtime-changeable cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Hard capacity in buffered points; 0 disables the clamp.
    pub max_size: usize,
    /// Prefix for the synthetic checkpoint metrics.
    pub graph_prefix: String,
    pub input_capacity: usize,
    pub output_capacity: usize,
    /// Capacity of the query channel; applied when the worker starts.
    pub query_capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: 1_000_000,
            graph_prefix: "carbon.".to_string(),
            input_capacity: 51200,
            output_capacity: 1024,
            query_capacity: 16,
        }
    }
}

/// Get (new = None) or change (new = Some) settings through the worker.
pub(crate) struct SettingsRequest {
    pub new: Option<CacheSettings>,
    pub reply: oneshot::Sender<CacheSettings>,
}
