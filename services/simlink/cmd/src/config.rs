//! Configuration handling for the simlink binary.
//!
//! This module reads the optional YAML config file and the environment
//! variables the simulation launcher sets, producing the endpoint
//! configuration the session core consumes.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use simlink_session::{
    EndpointConfig, Role, TransportKind, DEFAULT_CONNECT_TIMEOUT, DEFAULT_STATS_INTERVAL,
    DEFAULT_TCP_PORT, RETRY_WAIT, SINGLE_PEER_BACKLOG,
};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Link configuration shared by both roles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Server hostname or IP address the client dials
    pub server_ip: String,
    /// TCP port
    pub port: u16,
    /// Transport kind, `tcp` or `udp`
    pub transport: String,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Maximum time the client keeps retrying (seconds)
    pub connect_timeout_secs: u64,
    /// Throughput report interval (seconds, 0 reports on every transfer)
    pub stats_interval_secs: u64,
    /// Wait between connect attempts (seconds)
    pub retry_wait_secs: u64,
    /// Give up waiting for a client after this long (seconds, unset waits forever)
    pub accept_timeout_secs: Option<u64>,
    /// Give up draining the peer at close after this long (seconds)
    pub drain_timeout_secs: Option<u64>,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Path to the server certificate chain (PEM)
    pub cert_file: String,
    /// Path to the server private key (PEM)
    pub key_file: String,
    /// Path to the CA certificate the client trusts (PEM)
    pub ca_file: String,
    /// Name the server certificate must carry; defaults to `server_ip`
    pub server_name: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: "server.crt".to_string(),
            key_file: "server.key".to_string(),
            ca_file: "server.crt".to_string(),
            server_name: None,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            server_ip: "localhost".to_string(),
            port: DEFAULT_TCP_PORT,
            transport: "tcp".to_string(),
            tls: TlsConfig::default(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            stats_interval_secs: DEFAULT_STATS_INTERVAL.as_secs(),
            retry_wait_secs: RETRY_WAIT.as_secs(),
            accept_timeout_secs: None,
            drain_timeout_secs: Some(30),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    link: Option<LinkConfig>,
}

impl LinkConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(RootConfig { link: Some(link) }) => {
                    config = link;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Ok(RootConfig { link: None }) => {
                    warn!("No link section in {:?}, using defaults", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?}, using defaults: {}",
                        config_path.as_ref(),
                        e
                    );
                }
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", config_path.as_ref()),
        }

        config.apply_environment_overrides();
        config.log_summary();
        Ok(config)
    }

    /// Defaults plus environment, for runs without a config file
    pub fn from_environment() -> Self {
        let mut config = Self::default();
        config.apply_environment_overrides();
        config.log_summary();
        config
    }

    fn log_summary(&self) {
        info!(
            "Final link configuration: server_ip={}, port={}, transport={}, tls={}, connect_timeout={}s, stats_interval={}s",
            self.server_ip,
            self.port,
            self.transport,
            self.tls.enabled,
            self.connect_timeout_secs,
            self.stats_interval_secs
        );
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(server_ip) = lookup("SERVER_IP") {
            info!("User programmed server IP: {}", server_ip);
            self.server_ip = server_ip;
        }

        if let Some(port) = lookup("TCP_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.port = port;
                    info!("User programmed TCP port: {}", port);
                }
                Err(_) => warn!("Ignoring invalid TCP_PORT: {}", port),
            }
        }

        if let Some(timeout) = lookup("CLIENT_CONNECT_TO") {
            match timeout.parse::<u64>() {
                Ok(secs) => {
                    self.connect_timeout_secs = secs;
                    info!("User programmed client connect timeout: {} sec", secs);
                }
                Err(_) => warn!("Ignoring invalid CLIENT_CONNECT_TO: {}", timeout),
            }
        }

        if let Some(interval) = lookup("STATS_INTV") {
            match interval.parse::<u64>() {
                Ok(secs) => {
                    self.stats_interval_secs = secs;
                    info!("User programmed stats interval: {} sec", secs);
                }
                Err(_) => warn!("Ignoring invalid STATS_INTV: {}", interval),
            }
        }

        if let Some(mode) = lookup("SSL_MODE") {
            match mode.parse::<i64>() {
                Ok(mode) => {
                    self.tls.enabled = mode != 0;
                    info!("User programmed SSL mode: {}", self.tls.enabled);
                }
                Err(_) => warn!("Ignoring invalid SSL_MODE: {}", mode),
            }
        }

        if let Some(transport) = lookup("SIMLINK_TRANSPORT") {
            info!("User programmed transport: {}", transport);
            self.transport = transport;
        }

        if let Some(cert) = lookup("SIMLINK_TLS_CERT") {
            info!("User programmed certificate file: {}", cert);
            self.tls.cert_file = cert;
        }

        if let Some(key) = lookup("SIMLINK_TLS_KEY") {
            info!("User programmed key file: {}", key);
            self.tls.key_file = key;
        }

        if let Some(ca) = lookup("SIMLINK_TLS_CA") {
            info!("User programmed CA file: {}", ca);
            self.tls.ca_file = ca;
        }
    }

    /// Name the client checks the server certificate against
    pub fn tls_server_name(&self) -> &str {
        self.tls.server_name.as_deref().unwrap_or(&self.server_ip)
    }

    /// Build the immutable endpoint configuration for `role`
    pub fn endpoint(&self, role: Role) -> Result<EndpointConfig> {
        let transport = self
            .transport
            .parse::<TransportKind>()
            .map_err(anyhow::Error::msg)?;
        let base = match role {
            Role::Client => EndpointConfig::client(self.server_ip.clone(), self.port),
            Role::Server => EndpointConfig::server(self.port),
        };

        Ok(EndpointConfig {
            transport,
            tls_enabled: self.tls.enabled,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            retry_wait: Duration::from_secs(self.retry_wait_secs),
            stats_interval: Duration::from_secs(self.stats_interval_secs),
            listen_backlog: SINGLE_PEER_BACKLOG,
            accept_timeout: self.accept_timeout_secs.map(Duration::from_secs),
            drain_timeout: self.drain_timeout_secs.map(Duration::from_secs),
            ..base
        })
    }
}
