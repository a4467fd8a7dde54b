/// Server-level configuration for the procedure pipeline.
///
/// Controls call timeouts, concurrency limits, and batch limits.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name reported in logs and the health endpoint.
    pub name: String,
    /// Deadline for a query or mutation, and for a subscription to produce its stream.
    pub default_operation_timeout_ms: u64,
    /// Maximum number of concurrent calls before load shedding.
    pub max_concurrent_operations: u32,
    /// Maximum number of members in one HTTP batch.
    pub max_batch_items: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "skein".to_string(),
            default_operation_timeout_ms: 30_000,
            max_concurrent_operations: 1000,
            max_batch_items: 100,
        }
    }
}
