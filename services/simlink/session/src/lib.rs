//! Point-to-point TCP/TLS sessions exchanging fixed-size simulation packets.
//!
//! One side runs as a server that binds, listens for a single peer and
//! accepts it; the other runs as a client that dials with a bounded
//! fixed-interval retry. Either side may layer TLS over the connection. Once
//! established, the session moves fixed-size [`Packet`](simlink_wire::Packet)s
//! in both directions, keeps throughput counters and reports them
//! periodically, and tears the connection down with a half-close so the peer
//! never sees a reset.
//!
//! ## Features
//!
//! - **Establishment**: client retry loop and single-peer server accept
//! - **TLS**: rustls contexts loaded from PEM, handshake over the raw socket
//! - **Data plane**: single-call and full-packet send/receive
//! - **Throughput**: interval reports plus a final report on close
//! - **Teardown**: release TLS, shut down writes, drain, close
//!
//! ## Example
//!
//! ```rust,no_run
//! use simlink_session::{EndpointConfig, Session};
//! use simlink_wire::SimPacket;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EndpointConfig::client("localhost", 8080);
//! let mut session = Session::open_client(&config, None).await?;
//!
//! let packet = SimPacket::new(1, [0xA, 0xB, 0xC, 0xD]).encode();
//! session.send_full(&packet).await?;
//!
//! let mut echo = simlink_wire::Packet::zeroed();
//! session.receive_full(&mut echo).await?;
//!
//! session.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connector;
pub mod diagnostics;
pub mod error;
pub mod reporter;
pub mod session;
pub mod state;
pub mod teardown;
pub mod transport;

// Re-export main types
pub use config::{
    EndpointConfig, Role, TransportKind, DEFAULT_CONNECT_TIMEOUT, DEFAULT_STATS_INTERVAL,
    DEFAULT_TCP_PORT, RETRY_WAIT, SINGLE_PEER_BACKLOG,
};
pub use connector::{resolve, BoundListener, ClientConnector, Established, ServerListener};
pub use diagnostics::{local_hostname, log_host_diagnostics, HostDiagnostics};
pub use error::EstablishError;
pub use reporter::{Direction, ThroughputReport, ThroughputReporter, SHUTDOWN_LABEL};
pub use session::Session;
pub use state::{Lifecycle, SessionState};
pub use teardown::{graceful_close, DrainEnd, DrainOutcome, HalfClose, SocketTeardown};
pub use transport::IoStream;

pub use transport::tls::{
    accept_tls, client_tls_from_pem, connect_tls, load_client_tls, load_server_tls,
    make_client_config, make_server_config, server_tls_from_pem, ClientTls, SecureContext,
    ServerTls,
};
