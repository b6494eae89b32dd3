//! Host diagnostics printed by the server so a client operator knows where to connect.

use std::io;
use std::net::IpAddr;
use tracing::{info, warn};

/// Hostname and the addresses it resolves to
#[derive(Debug, Clone, Default)]
pub struct HostDiagnostics {
    /// Local hostname, `None` if the system would not report it
    pub hostname: Option<String>,
    /// Addresses the hostname resolves to, in resolver order, deduplicated
    pub addresses: Vec<IpAddr>,
}

/// The system hostname as reported by the OS
pub fn local_hostname() -> io::Result<String> {
    Ok(hostname::get()?.to_string_lossy().into_owned())
}

/// Resolve the local hostname and log every address; failures are only logged
pub async fn log_host_diagnostics() -> HostDiagnostics {
    let hostname = match local_hostname() {
        Ok(name) => name,
        Err(e) => {
            warn!("Failed to get hostname: {}", e);
            return HostDiagnostics::default();
        }
    };
    info!("Hostname= {}", hostname);
    info!("Use this hostname: {} when connecting from a client", hostname);

    let mut addresses = Vec::new();
    match tokio::net::lookup_host((hostname.as_str(), 0)).await {
        Ok(addrs) => {
            info!("IP addresses for {}:", hostname);
            for addr in addrs {
                let ip = addr.ip();
                if addresses.contains(&ip) {
                    continue;
                }
                let version = if ip.is_ipv4() { "IPv4" } else { "IPv6" };
                info!("  {}: {}", version, ip);
                addresses.push(ip);
            }
        }
        Err(e) => warn!("Failed to resolve hostname {}: {}", hostname, e),
    }

    HostDiagnostics {
        hostname: Some(hostname),
        addresses,
    }
}
