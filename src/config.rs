//! Configuration for AtlasDir
//!
//! Centralized client and server configuration with sensible defaults.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AtlasError, Result};

/// Where a peer lives: a TCP address or a local socket path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `host:port`
    Tcp(String),

    /// Unix domain socket path
    Unix(PathBuf),
}

impl Address {
    /// Parse `ldap://host:port`, `host:port` or an absolute socket path
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AtlasError::Config("empty address".to_string()));
        }
        if input.starts_with('/') {
            return Ok(Address::Unix(PathBuf::from(input)));
        }

        let host_port = input.strip_prefix("ldap://").unwrap_or(input);
        let host_port = host_port.trim_end_matches('/');
        match host_port.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Address::Tcp(host_port.to_string()))
            }
            _ => Err(AtlasError::Config(format!(
                "address '{}' is neither host:port nor a socket path",
                input
            ))),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) => write!(f, "{}", addr),
            Address::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

// =============================================================================
// Reconnect Policy
// =============================================================================

/// Whether, and how fast, a lost connection is re-established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// A failed or lost connection is final
    #[default]
    Disabled,

    /// Capped exponential backoff: `delay(n) = min(initial_delay * 2^n, max_delay)`
    Backoff {
        initial_delay: Duration,
        max_delay: Duration,
        /// Total connect attempts before giving up; `None` retries forever
        fail_after: Option<u32>,
    },
}

impl ReconnectPolicy {
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

    /// Unbounded retries with default delays
    pub fn enabled() -> Self {
        ReconnectPolicy::Backoff {
            initial_delay: Self::DEFAULT_INITIAL_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
            fail_after: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, ReconnectPolicy::Backoff { .. })
    }

    /// Delay before retry number `n` (zero-based)
    pub fn delay(&self, n: u32) -> Duration {
        match *self {
            ReconnectPolicy::Disabled => Duration::ZERO,
            ReconnectPolicy::Backoff {
                initial_delay,
                max_delay,
                ..
            } => {
                let factor = 2u32.checked_pow(n).unwrap_or(u32::MAX);
                initial_delay
                    .checked_mul(factor)
                    .unwrap_or(max_delay)
                    .min(max_delay)
            }
        }
    }

    /// Whether another attempt may follow `attempts` failed ones
    pub fn allows_retry(&self, attempts: u32) -> bool {
        match *self {
            ReconnectPolicy::Disabled => false,
            ReconnectPolicy::Backoff { fail_after, .. } => {
                fail_after.map_or(true, |limit| attempts < limit)
            }
        }
    }
}

impl From<bool> for ReconnectPolicy {
    fn from(enabled: bool) -> Self {
        if enabled {
            ReconnectPolicy::enabled()
        } else {
            ReconnectPolicy::Disabled
        }
    }
}

/// What a rejected setup handshake does to the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetupFailurePolicy {
    /// The client closes for good and surfaces a fatal error
    #[default]
    Fatal,

    /// The attempt is dropped and the reconnect policy decides what follows
    Retry {
        /// Whether the failure consumes one attempt of `fail_after`
        counts_toward_budget: bool,
    },
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for a [`Client`](crate::client::Client)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address
    pub address: Address,

    /// Transport connect timeout (`None` waits for the OS)
    pub connect_timeout: Option<Duration>,

    /// Per-request deadline (`None` waits forever)
    pub timeout: Option<Duration>,

    /// Quiet period after which an `Idle` notification fires
    pub idle_timeout: Option<Duration>,

    /// Reconnect behavior
    pub reconnect: ReconnectPolicy,

    /// Effect of a failed setup handshake
    pub setup_failure: SetupFailurePolicy,

    /// Auto-bind DN (installs a bind setup hook)
    pub bind_dn: Option<String>,

    /// Auto-bind password
    pub bind_credentials: Option<Vec<u8>>,

    /// How often deadlines and idleness are checked
    pub sweep_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: Address::Tcp("127.0.0.1:1389".to_string()),
            connect_timeout: Some(Duration::from_secs(10)),
            timeout: None,
            idle_timeout: None,
            reconnect: ReconnectPolicy::Disabled,
            setup_failure: SetupFailurePolicy::Fatal,
            bind_dn: None,
            bind_credentials: None,
            sweep_interval: Duration::from_millis(25),
        }
    }
}

impl ClientConfig {
    /// Create a new config builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn address(mut self, address: Address) -> Self {
        self.config.address = address;
        self
    }

    /// Connect over TCP to `host:port`
    pub fn tcp(mut self, addr: impl Into<String>) -> Self {
        self.config.address = Address::Tcp(addr.into());
        self
    }

    /// Connect over a Unix domain socket
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.address = Address::Unix(path.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn reconnect(mut self, policy: impl Into<ReconnectPolicy>) -> Self {
        self.config.reconnect = policy.into();
        self
    }

    pub fn setup_failure(mut self, policy: SetupFailurePolicy) -> Self {
        self.config.setup_failure = policy;
        self
    }

    /// Bind with these credentials after every connect
    pub fn bind_credentials(mut self, dn: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        self.config.bind_dn = Some(dn.into());
        self.config.bind_credentials = Some(password.into());
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for a [`Server`](crate::server::Server)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub listen: Address,

    /// Max concurrent client connections
    pub max_connections: usize,

    /// Connection read timeout (`None` lets idle clients stay)
    pub read_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Address::Tcp("127.0.0.1:1389".to_string()),
            max_connections: 1024,
            read_timeout: None,
        }
    }
}

impl ServerConfig {
    /// Create a new config builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for ServerConfig
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn listen(mut self, address: Address) -> Self {
        self.config.listen = address;
        self
    }

    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
