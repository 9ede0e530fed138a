use std::time::Duration;

use crate::config::Config;

/// The `User-Agent` sent with every origin request.
pub const USER_AGENT: &str = concat!("lazymirror/", env!("CARGO_PKG_VERSION"));

/// Timeouts for requests to the origin.
#[derive(Copy, Clone, Debug)]
pub struct OriginTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the response head, and each chunk of the body.
    pub read: Duration,
}

impl OriginTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            read: config.read_timeout,
        }
    }
}

impl Default for OriginTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(10),
        }
    }
}

/// Creates a [`reqwest::Client`] for talking to the origin.
///
/// * Redirects are followed with the default policy, the mirror needs to see where a directory
///   URL without trailing slash ends up.
/// * No transparent decompression is configured, bodies are relayed and stored byte for byte.
/// * Only the connect timeout is applied here. The read timeout is applied per operation by the
///   origin fetcher, since a total request timeout would cut off large downloads.
pub fn create_client(timeouts: &OriginTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .connect_timeout(timeouts.connect)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent(USER_AGENT)
        .build()
}
