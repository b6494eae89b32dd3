//! simlink binary.
//!
//! Runs one end of a point-to-point packet link. The server accepts a single
//! client and echoes every packet back; the client sends a number of
//! simulation packets and checks that each echo matches what it sent.

use clap::{Args, Parser, Subcommand};
use simlink_session::{
    load_client_tls, load_server_tls, EndpointConfig, EstablishError, Role, Session,
};
use simlink_wire::{Packet, SimPacket};
use std::io;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::LinkConfig;
use logging::SimlinkLogFormatter;

/// Point-to-point TCP/TLS packet link for simulation peers
#[derive(Parser, Debug)]
#[command(name = "simlink", version, about = "Point-to-point TCP/TLS packet link")]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept one client and echo its packets until it closes
    Server(EndpointArgs),
    /// Connect to the server, send packets and verify the echoes
    Client(ClientArgs),
}

/// Flags shared by both roles; each overrides file and environment
#[derive(Args, Debug, Default)]
struct EndpointArgs {
    /// Server hostname or IP address
    #[arg(long)]
    address: Option<String>,

    /// TCP port
    #[arg(long)]
    port: Option<u16>,

    /// Transport kind: tcp or udp
    #[arg(long)]
    transport: Option<String>,

    /// Enable TLS
    #[arg(long)]
    tls: bool,

    /// Throughput report interval, e.g. 60s (0s reports every packet)
    #[arg(long)]
    stats_interval: Option<humantime::Duration>,

    /// Maximum time the client keeps retrying, e.g. 30m
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,
}

#[derive(Args, Debug)]
struct ClientArgs {
    #[command(flatten)]
    endpoint: EndpointArgs,

    /// Number of packets to send
    #[arg(long, default_value = "100")]
    packets: u32,
}

impl EndpointArgs {
    fn apply(&self, link: &mut LinkConfig) {
        if let Some(address) = &self.address {
            link.server_ip = address.clone();
        }
        if let Some(port) = self.port {
            link.port = port;
        }
        if let Some(transport) = &self.transport {
            link.transport = transport.clone();
        }
        if self.tls {
            link.tls.enabled = true;
        }
        if let Some(interval) = &self.stats_interval {
            link.stats_interval_secs = interval.as_secs();
        }
        if let Some(timeout) = &self.connect_timeout {
            link.connect_timeout_secs = timeout.as_secs();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("simlink={}", cli.log_level).parse()?)
        .add_directive(format!("simlink_session={}", cli.log_level).parse()?)
        .add_directive(format!("simlink_wire={}", cli.log_level).parse()?);

    let role = match &cli.command {
        Command::Server(_) => Role::Server,
        Command::Client(_) => Role::Client,
    };
    let formatter = SimlinkLogFormatter::new("simlink".to_string()).with_role(role.label());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!("Starting simlink v{}", env!("CARGO_PKG_VERSION"));

    let mut link = match &cli.config {
        Some(path) => LinkConfig::load_from_file(path)?,
        None => LinkConfig::from_environment(),
    };

    match cli.command {
        Command::Server(flags) => {
            flags.apply(&mut link);
            let endpoint = link.endpoint(Role::Server)?;
            run_server(&link, &endpoint).await
        }
        Command::Client(flags) => {
            flags.endpoint.apply(&mut link);
            let endpoint = link.endpoint(Role::Client)?;
            run_client(&link, &endpoint, flags.packets).await
        }
    }
}

/// Security failures end the process; everything else goes back to the caller
fn exit_if_fatal(role: Role, err: EstablishError) -> anyhow::Error {
    if err.is_fatal() {
        component_error!("establish", "Fatal error, exiting: {}", err);
        std::process::exit(1);
    }
    anyhow::Error::new(err).context(format!("{} establishment failed", role))
}

async fn run_server(link: &LinkConfig, endpoint: &EndpointConfig) -> anyhow::Result<()> {
    let tls = if endpoint.tls_enabled {
        match load_server_tls(&link.tls.cert_file, &link.tls.key_file) {
            Ok(tls) => Some(tls),
            Err(e) => return Err(exit_if_fatal(Role::Server, e)),
        }
    } else {
        None
    };

    let mut session = Session::open_server(endpoint, tls.as_ref())
        .await
        .map_err(|e| exit_if_fatal(Role::Server, e))?;
    component_info!("echo", "Echoing packets from {}", session.peer_addr());

    let mut packet = Packet::zeroed();
    let mut echoed = 0u64;
    let result = loop {
        match session.receive_full(&mut packet).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(e),
        }
        component_debug!("echo", "Echoing packet {}", echoed);
        if let Err(e) = session.send_full(&packet).await {
            break Err(e);
        }
        echoed += 1;
    };

    if let Err(e) = &result {
        component_warn!("echo", "Data plane stopped: {}", e);
    }
    session.close().await;
    component_info!("echo", "Echoed {} packets", echoed);
    Ok(())
}

async fn run_client(link: &LinkConfig, endpoint: &EndpointConfig, packets: u32) -> anyhow::Result<()> {
    let tls = if endpoint.tls_enabled {
        match load_client_tls(&link.tls.ca_file, link.tls_server_name()) {
            Ok(tls) => Some(tls),
            Err(e) => return Err(exit_if_fatal(Role::Client, e)),
        }
    } else {
        None
    };

    let mut session = Session::open_client(endpoint, tls.as_ref())
        .await
        .map_err(|e| exit_if_fatal(Role::Client, e))?;
    component_info!("verify", "Sending {} packets to {}", packets, session.peer_addr());

    let mut mismatches = 0u32;
    let result: io::Result<()> = async {
        let mut echo = Packet::zeroed();
        for control in 0..packets {
            let sent = SimPacket::new(control, [control, !control, control.rotate_left(8), 0]);
            session.send_full(&sent.encode()).await?;
            session.receive_full(&mut echo).await?;

            let received = SimPacket::from(&echo);
            if received != sent {
                component_warn!(
                    "verify",
                    "Echo mismatch for packet {}: got control {:#x}",
                    control,
                    received.control
                );
                mismatches += 1;
            } else {
                component_debug!("verify", "Packet {} verified", control);
            }
        }
        Ok(())
    }
    .await;

    session.close().await;

    result?;
    if mismatches > 0 {
        anyhow::bail!("{} of {} echoed packets did not match", mismatches, packets);
    }
    component_info!("verify", "All {} packets echoed correctly", packets);
    Ok(())
}
