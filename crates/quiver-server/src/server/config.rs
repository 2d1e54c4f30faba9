//! Server configuration: listen address, credentials and connection tuning.
//!
//! All values are resolved by the embedding application and passed in as a
//! plain value at construction; the engine never consults process-wide
//! state. Credential material arrives pre-loaded as PEM blobs, so reading
//! certificate files from disk stays an external concern.

use quiver_core::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Where the server listens.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    /// Bind the loopback interface only instead of all interfaces.
    pub localhost_only: bool,
    /// Requested port. `0` asks the OS for an ephemeral port, which is
    /// reported back through [`Server::local_addr`].
    ///
    /// [`Server::local_addr`]: crate::Server::local_addr
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            localhost_only: true,
            port: 0,
        }
    }
}

impl ListenConfig {
    pub(crate) fn socket_addr(&self) -> SocketAddr {
        let ip = if self.localhost_only {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        SocketAddr::new(ip, self.port)
    }
}

/// Transport credential material, supplied pre-loaded by an external loader.
#[derive(Clone, Default)]
pub enum CredentialConfig {
    /// Plaintext transport.
    #[default]
    Insecure,
    /// Mutual TLS: client certificates are required and verified against the
    /// root CA. Unusable material fails startup before any socket is bound.
    Tls {
        root_ca_pem: Vec<u8>,
        server_cert_pem: Vec<u8>,
        server_key_pem: Vec<u8>,
    },
}

impl core::fmt::Debug for CredentialConfig {
    // Key material stays out of debug output.
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Insecure => write!(f, "Insecure"),
            Self::Tls { .. } => write!(f, "Tls {{ .. }}"),
        }
    }
}

/// Connection-level tuning, externally resolved.
///
/// The engine carries these values and logs them as the applied connection
/// settings; it does not compute them.
#[derive(Debug, Clone)]
pub struct TuningConfig {
    /// Maximum message size in bytes (send and receive).
    pub max_message_bytes: usize,
    /// Keepalive probe interval, in milliseconds.
    pub keepalive_time_ms: u64,
    /// How long to wait for a keepalive ack before closing, in milliseconds.
    pub keepalive_timeout_ms: u64,
    /// Minimum interval between client pings when no data is flowing, in
    /// milliseconds. The effective value is clamped against
    /// `client_keepalive_time_ms`; see
    /// [`clamped_min_ping_interval_ms`](Self::clamped_min_ping_interval_ms).
    pub min_ping_interval_without_data_ms: u64,
    /// The keepalive interval known clients ping at. Demanding a longer
    /// interval than this would get well-behaved clients disconnected for
    /// excessive pinging.
    pub client_keepalive_time_ms: u64,
    /// Per-stream write buffer size in bytes.
    pub write_buffer_bytes: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 512 * 1024 * 1024,
            keepalive_time_ms: 60_000,
            keepalive_timeout_ms: 20_000,
            min_ping_interval_without_data_ms: 60_000,
            client_keepalive_time_ms: 60_000,
            write_buffer_bytes: 1024 * 1024,
        }
    }
}

impl TuningConfig {
    /// The effective minimum ping interval: never larger than the interval
    /// clients are known to ping at.
    pub fn clamped_min_ping_interval_ms(&self) -> u64 {
        self.min_ping_interval_without_data_ms
            .min(self.client_keepalive_time_ms)
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Human-readable server name, used in logs.
    pub name: String,
    pub listen: ListenConfig,
    /// Number of completion queues, each drained by its own poll task.
    /// Defaults to the number of CPUs.
    pub num_queues: usize,
    pub credentials: CredentialConfig,
    pub tuning: TuningConfig,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listen: ListenConfig::default(),
            num_queues: num_cpus::get(),
            credentials: CredentialConfig::default(),
            tuning: TuningConfig::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.num_queues == 0 {
            return Err(Error::InvalidConfig {
                reason: "num_queues must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}
