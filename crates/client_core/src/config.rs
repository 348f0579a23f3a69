use std::time::Duration;

/// Timeout and bounded-retry budget for history-page fetches.
///
/// A hung history request would otherwise pin the loading indicator forever,
/// so every fetch runs under a timeout and a small retry budget. Sends and
/// reactions stay single-shot: their failures surface to the caller.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 2,
            retry_delay: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST API, e.g. `http://host:port`. The socket URL is
    /// derived from it by scheme substitution.
    pub server_url: String,
    pub fetch_policy: FetchPolicy,
    /// Capacity of the per-subscription inbound frame channel.
    pub socket_buffer: usize,
    /// Capacity of the client event broadcast channel.
    pub event_buffer: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            fetch_policy: FetchPolicy::default(),
            socket_buffer: 256,
            event_buffer: 1024,
        }
    }
}
