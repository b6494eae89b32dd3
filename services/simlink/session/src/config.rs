//! Resolved endpoint configuration consumed by the session core.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default TCP port for both roles
pub const DEFAULT_TCP_PORT: u16 = 8080;

/// Default throughput report interval
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Default upper bound on the client's accumulated connect retry wait
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Fixed wait between client connect attempts
pub const RETRY_WAIT: Duration = Duration::from_secs(10);

/// Listen backlog: a server serves exactly one peer in its lifetime
pub const SINGLE_PEER_BACKLOG: u32 = 1;

/// Which end of the link this process is
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dials the server
    Client,
    /// Binds, listens and accepts one client
    Server,
}

impl Role {
    /// Label used in throughput reports and log lines
    pub fn label(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Requested socket type
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Stream socket
    #[default]
    Tcp,
    /// Datagram socket; clients only, servers fail at listen
    Udp,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "udp" => Ok(TransportKind::Udp),
            other => Err(format!("transport must be either udp or tcp, not {}", other)),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Udp => f.write_str("udp"),
        }
    }
}

/// Immutable per-session configuration.
///
/// Built once before establishment and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Client or server
    pub role: Role,
    /// Socket type
    pub transport: TransportKind,
    /// Server host to dial (client) or local address to bind (server)
    pub address: String,
    /// TCP port
    pub port: u16,
    /// Whether the channel must be wrapped in TLS
    pub tls_enabled: bool,
    /// Client only: give up once accumulated retry wait reaches this
    pub connect_timeout: Duration,
    /// Client only: wait between connect attempts
    pub retry_wait: Duration,
    /// Throughput report interval; zero reports on every transfer
    pub stats_interval: Duration,
    /// Server only: listen backlog
    pub listen_backlog: u32,
    /// Server only: optional deadline for the single accept
    pub accept_timeout: Option<Duration>,
    /// Optional bound on the teardown drain loop
    pub drain_timeout: Option<Duration>,
}

impl EndpointConfig {
    /// Defaults for a client dialling `address`
    pub fn client(address: impl Into<String>, port: u16) -> Self {
        Self {
            role: Role::Client,
            address: address.into(),
            port,
            ..Self::default()
        }
    }

    /// Defaults for a server bound to the wildcard address
    pub fn server(port: u16) -> Self {
        Self {
            role: Role::Server,
            address: "0.0.0.0".to_string(),
            port,
            ..Self::default()
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            role: Role::Client,
            transport: TransportKind::Tcp,
            address: "localhost".to_string(),
            port: DEFAULT_TCP_PORT,
            tls_enabled: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_wait: RETRY_WAIT,
            stats_interval: DEFAULT_STATS_INTERVAL,
            listen_backlog: SINGLE_PEER_BACKLOG,
            accept_timeout: None,
            drain_timeout: None,
        }
    }
}
