//! Core session: establishment entry points, data plane and teardown.
//!
//! A [`Session`] owns one socket, the optional TLS session layered over it and
//! the secure context that session came from, plus its own throughput
//! counters. Nothing here is process-global, so several sessions may coexist.

use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use simlink_wire::{Packet, PACKET_LEN};

use crate::config::{EndpointConfig, Role};
use crate::connector::{ClientConnector, Established, ServerListener};
use crate::diagnostics::log_host_diagnostics;
use crate::error::EstablishError;
use crate::reporter::{Direction, ThroughputReport, ThroughputReporter, SHUTDOWN_LABEL};
use crate::state::{Lifecycle, SessionState};
use crate::teardown::{graceful_close, SocketTeardown};
use crate::transport::tls::{ClientTls, SecureContext, ServerTls};
use crate::transport::IoStream;

/// One established point-to-point session
#[derive(Debug)]
pub struct Session {
    config: EndpointConfig,
    lifecycle: Lifecycle,
    stream: Option<IoStream>,
    secure_context: Option<SecureContext>,
    reporter: ThroughputReporter,
    peer: SocketAddr,
}

impl Session {
    /// Run the client establishment sequence
    pub async fn open_client(
        config: &EndpointConfig,
        tls: Option<&ClientTls>,
    ) -> Result<Self, EstablishError> {
        let config = EndpointConfig {
            role: Role::Client,
            ..config.clone()
        };
        let established = ClientConnector::new(&config, tls).connect().await?;
        Ok(Self::from_established(config, established))
    }

    /// Run the server establishment sequence, logging host diagnostics first
    pub async fn open_server(
        config: &EndpointConfig,
        tls: Option<&ServerTls>,
    ) -> Result<Self, EstablishError> {
        let config = EndpointConfig {
            role: Role::Server,
            ..config.clone()
        };
        if config.tls_enabled && tls.is_none() {
            return Err(EstablishError::SecureContext(
                "TLS enabled but no server secure context was provided".to_string(),
            ));
        }

        log_host_diagnostics().await;

        let listener = ServerListener::bind(&config).await?;
        let established = listener.accept(tls).await?;
        Ok(Self::from_established(config, established))
    }

    /// Wrap a channel produced by [`ClientConnector`] or [`ServerListener`]
    pub fn from_established(config: EndpointConfig, established: Established) -> Self {
        let Established {
            stream,
            secure_context,
            peer,
            lifecycle,
        } = established;

        info!(
            "{} session established with {} (tls: {})",
            config.role,
            peer,
            stream.is_secure()
        );

        // Throughput window starts at establishment
        let reporter = ThroughputReporter::new(config.stats_interval);
        debug!("{} throughput reports every {:?}", config.role, reporter.interval());

        Self {
            config,
            lifecycle,
            stream: Some(stream),
            secure_context,
            reporter,
            peer,
        }
    }

    /// Client or server
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the channel is TLS-protected
    pub fn is_secure(&self) -> bool {
        self.stream.as_ref().is_some_and(IoStream::is_secure)
    }

    /// Configuration the session was opened with
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Throughput counters for the current window
    pub fn reporter(&self) -> &ThroughputReporter {
        &self.reporter
    }

    /// Write one packet with a single transfer call.
    ///
    /// The raw result is returned unchanged: a short count or `Ok(0)` is not
    /// retried. Use [`Session::send_full`] to insist on the whole packet.
    pub async fn send(&mut self, packet: &Packet) -> io::Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        let n = stream.write(packet.as_bytes()).await?;
        if n > 0 {
            // Counted once written; a flush failure below does not undo the transfer
            self.account(Direction::Sent, n);
        }

        // Push any buffered TLS record onto the socket
        if let Some(stream) = self.stream.as_mut() {
            stream.flush().await?;
        }
        Ok(n)
    }

    /// Read into `packet` with a single transfer call.
    ///
    /// May return fewer than [`PACKET_LEN`] bytes; `Ok(0)` means the peer
    /// closed. Use [`Session::receive_full`] to insist on the whole packet.
    pub async fn receive(&mut self, packet: &mut Packet) -> io::Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        let n = stream.read(packet.as_mut_bytes()).await?;

        if n > 0 {
            self.account(Direction::Received, n);
        }
        Ok(n)
    }

    /// Write the whole packet or fail
    pub async fn send_full(&mut self, packet: &Packet) -> io::Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        stream.write_all(packet.as_bytes()).await?;
        stream.flush().await?;

        self.account(Direction::Sent, PACKET_LEN);
        Ok(PACKET_LEN)
    }

    /// Read a whole packet or fail with `UnexpectedEof`
    pub async fn receive_full(&mut self, packet: &mut Packet) -> io::Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        stream.read_exact(packet.as_mut_bytes()).await?;

        self.account(Direction::Received, PACKET_LEN);
        Ok(PACKET_LEN)
    }

    fn account(&mut self, direction: Direction, n: usize) {
        self.reporter.record(direction, n);
        self.reporter.maybe_report(self.config.role.label());
    }

    /// Graceful teardown; calling it again is a no-op returning `None`.
    ///
    /// Returns the final throughput report emitted for the session.
    pub async fn close(&mut self) -> Option<ThroughputReport> {
        if self.lifecycle.state() != SessionState::Established {
            debug!("close() on {} session ignored", self.lifecycle.state());
            return None;
        }
        self.lifecycle.transition(SessionState::Closing);

        let mut channel = SocketTeardown::new(self.stream.take(), self.secure_context.take());
        let outcome = graceful_close(&mut channel, self.config.drain_timeout).await;
        debug!("{} teardown with {}: {:?}", self.config.role, self.peer, outcome);

        self.lifecycle.transition(SessionState::Closed);
        info!("{} session with {} closed", self.config.role, self.peer);
        Some(self.reporter.flush(SHUTDOWN_LABEL))
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "session is not established")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_certs;
    use simlink_wire::SimPacket;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const TEST_DEADLINE: Duration = Duration::from_secs(10);

    fn loopback_server() -> EndpointConfig {
        EndpointConfig {
            address: "127.0.0.1".to_string(),
            drain_timeout: Some(Duration::from_secs(5)),
            ..EndpointConfig::server(0)
        }
    }

    fn loopback_client(addr: SocketAddr) -> EndpointConfig {
        EndpointConfig {
            drain_timeout: Some(Duration::from_secs(5)),
            retry_wait: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
            ..EndpointConfig::client("127.0.0.1", addr.port())
        }
    }

    /// Server that echoes every full packet until the peer closes
    async fn spawn_echo_server(
        config: EndpointConfig,
        tls: Option<ServerTls>,
    ) -> (SocketAddr, JoinHandle<Result<u64, EstablishError>>) {
        let listener = ServerListener::bind(&config).await.unwrap();
        let addr = listener.local_addr();

        let handle = tokio::spawn(async move {
            let established = listener.accept(tls.as_ref()).await?;
            let mut session = Session::from_established(config, established);
            let mut packet = Packet::zeroed();
            let mut echoed = 0;
            while session.receive_full(&mut packet).await.is_ok() {
                session.send_full(&packet).await.unwrap();
                echoed += 1;
            }
            session.close().await;
            Ok(echoed)
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn test_plain_round_trip() {
        let (addr, server) = spawn_echo_server(loopback_server(), None).await;

        let mut client = Session::open_client(&loopback_client(addr), None).await.unwrap();
        assert_eq!(client.state(), SessionState::Established);
        assert!(!client.is_secure());

        let sent = SimPacket::new(0xC0FFEE, [1, 2, 3, 4]).encode();
        assert_eq!(client.send(&sent).await.unwrap(), PACKET_LEN);

        let mut echoed = Packet::zeroed();
        client.receive_full(&mut echoed).await.unwrap();
        assert_eq!(echoed, sent);

        client.close().await;
        let count = timeout(TEST_DEADLINE, server).await.unwrap().unwrap().unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_tls_round_trip() {
        let (server_tls, client_tls) = test_certs::localhost_pair();
        let server_config = EndpointConfig {
            tls_enabled: true,
            ..loopback_server()
        };
        let (addr, server) = spawn_echo_server(server_config, Some(server_tls)).await;

        let client_config = EndpointConfig {
            tls_enabled: true,
            ..loopback_client(addr)
        };
        let mut client = Session::open_client(&client_config, Some(&client_tls)).await.unwrap();
        assert!(client.is_secure());

        for control in 0..5u32 {
            let sent = SimPacket::new(control, [control; 4]).encode();
            client.send_full(&sent).await.unwrap();
            let mut echoed = Packet::zeroed();
            client.receive_full(&mut echoed).await.unwrap();
            assert_eq!(echoed, sent);
        }

        client.close().await;
        let count = timeout(TEST_DEADLINE, server).await.unwrap().unwrap().unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_throughput_counters_track_packets() {
        let listener = ServerListener::bind(&loopback_server()).await.unwrap();
        let addr = listener.local_addr();
        let server = tokio::spawn(async move {
            let established = listener.accept(None).await.unwrap();
            let mut session = Session::from_established(loopback_server(), established);
            let mut packet = Packet::zeroed();
            for _ in 0..8 {
                session.receive_full(&mut packet).await.unwrap();
            }
            let received = session.reporter().bytes_received();
            session.close().await;
            received
        });

        let mut client = Session::open_client(&loopback_client(addr), None).await.unwrap();
        let packet = Packet::from_bytes([0x5A; PACKET_LEN]);
        for _ in 0..8 {
            client.send_full(&packet).await.unwrap();
        }
        assert_eq!(client.reporter().bytes_sent(), 8 * PACKET_LEN as u64);
        assert_eq!(client.reporter().bytes_received(), 0);

        let report = client.close().await.expect("final report");
        assert_eq!(report.label, SHUTDOWN_LABEL);
        assert_eq!(report.bytes_sent, 8 * PACKET_LEN as u64);
        assert_eq!(client.reporter().bytes_sent(), 0);

        let received = timeout(TEST_DEADLINE, server).await.unwrap().unwrap();
        assert_eq!(received, 8 * PACKET_LEN as u64);
    }

    #[tokio::test]
    async fn test_send_accounts_the_written_count() {
        let (addr, server) = spawn_echo_server(loopback_server(), None).await;
        let mut client = Session::open_client(&loopback_client(addr), None).await.unwrap();

        let n = client.send(&Packet::from_bytes([0x11; PACKET_LEN])).await.unwrap();
        assert!(n > 0);
        assert_eq!(client.reporter().bytes_sent(), n as u64);

        client.close().await;
        timeout(TEST_DEADLINE, server).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_receive_full_rejects_partial_packet() {
        let listener = ServerListener::bind(&loopback_server()).await.unwrap();
        let addr = listener.local_addr();
        let server = tokio::spawn(async move {
            let mut established = listener.accept(None).await.unwrap();
            established.stream.write_all(&[0xAB; 10]).await.unwrap();
            established.stream.shutdown().await.unwrap();
            established
        });

        let mut client = Session::open_client(&loopback_client(addr), None).await.unwrap();
        let mut packet = Packet::zeroed();
        let err = client.receive_full(&mut packet).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(client.reporter().bytes_received(), 0);

        client.close().await;
        timeout(TEST_DEADLINE, server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_datagram_session_round_trip() {
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = peer.recv_from(&mut buf).await.unwrap();
            peer.send_to(&buf[..n], from).await.unwrap();
            n
        });

        let config = EndpointConfig {
            transport: crate::config::TransportKind::Udp,
            ..loopback_client(addr)
        };
        let mut client = Session::open_client(&config, None).await.unwrap();
        assert!(!client.is_secure());

        let sent = SimPacket::new(9, [1, 2, 3, 4]).encode();
        assert_eq!(client.send(&sent).await.unwrap(), PACKET_LEN);
        let mut echo_packet = Packet::zeroed();
        assert_eq!(client.receive(&mut echo_packet).await.unwrap(), PACKET_LEN);
        assert_eq!(echo_packet, sent);
        assert_eq!(client.reporter().bytes_sent(), PACKET_LEN as u64);
        assert_eq!(client.reporter().bytes_received(), PACKET_LEN as u64);

        let report = client.close().await.expect("final report");
        assert_eq!(report.bytes_sent, PACKET_LEN as u64);
        assert_eq!(timeout(TEST_DEADLINE, echo).await.unwrap().unwrap(), PACKET_LEN);
    }

    #[tokio::test]
    async fn test_close_twice_is_safe() {
        let (addr, server) = spawn_echo_server(loopback_server(), None).await;
        let mut client = Session::open_client(&loopback_client(addr), None).await.unwrap();

        assert!(client.close().await.is_some());
        assert_eq!(client.state(), SessionState::Closed);
        assert!(client.close().await.is_none());

        let err = client.send(&Packet::zeroed()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        timeout(TEST_DEADLINE, server).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_receive_reports_peer_close() {
        let (addr, server) = spawn_echo_server(loopback_server(), None).await;
        let mut client = Session::open_client(&loopback_client(addr), None).await.unwrap();

        // Half-close from our side: the echo server sees EOF, closes, and we read 0
        let mut packet = Packet::zeroed();
        client.stream.as_mut().unwrap().shutdown().await.unwrap();
        assert_eq!(client.receive(&mut packet).await.unwrap(), 0);
        assert_eq!(client.reporter().bytes_received(), 0);

        client.close().await;
        timeout(TEST_DEADLINE, server).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tls_client_against_plain_server_fails_handshake() {
        let (_, client_tls) = test_certs::localhost_pair();
        let listener = ServerListener::bind(&loopback_server()).await.unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let established = listener.accept(None).await.unwrap();
            let mut session = Session::from_established(loopback_server(), established);
            // The ClientHello arrives as ordinary bytes; nothing is ever decrypted
            let mut packet = Packet::zeroed();
            let n = session.receive(&mut packet).await.unwrap();
            session.close().await;
            n
        });

        let client_config = EndpointConfig {
            tls_enabled: true,
            ..loopback_client(addr)
        };
        let err = timeout(TEST_DEADLINE, Session::open_client(&client_config, Some(&client_tls)))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, EstablishError::Handshake { .. }), "{:?}", err);
        assert!(err.is_fatal());

        assert!(timeout(TEST_DEADLINE, server).await.unwrap().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_plain_client_against_tls_server_fails_handshake() {
        let (server_tls, _) = test_certs::localhost_pair();
        let server_config = EndpointConfig {
            tls_enabled: true,
            ..loopback_server()
        };
        let listener = ServerListener::bind(&server_config).await.unwrap();
        let addr = listener.local_addr();
        let server = tokio::spawn(async move { listener.accept(Some(&server_tls)).await });

        let mut client = Session::open_client(&loopback_client(addr), None).await.unwrap();
        client.send(&Packet::from_bytes([0xAB; PACKET_LEN])).await.unwrap();

        let err = timeout(TEST_DEADLINE, server).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, EstablishError::Handshake { .. }), "{:?}", err);
        assert!(err.is_fatal());

        client.close().await;
    }

    #[tokio::test]
    async fn test_open_server_requires_context_when_tls_enabled() {
        let config = EndpointConfig {
            tls_enabled: true,
            ..loopback_server()
        };
        let err = Session::open_server(&config, None).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
