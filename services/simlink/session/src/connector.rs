//! Connection establishment for both roles.
//!
//! The client resolves the server, dials it with a fixed-interval retry
//! bounded by the configured connect timeout, and optionally runs a TLS client
//! handshake. The server binds the wildcard address, listens for exactly one
//! peer, accepts it, closes the listener and optionally runs a TLS server
//! handshake. Either way the result is an [`Established`] channel.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};

use crate::config::{EndpointConfig, TransportKind};
use crate::error::EstablishError;
use crate::state::{Lifecycle, SessionState};
use crate::transport::tls::{self, ClientTls, SecureContext, ServerTls};
use crate::transport::IoStream;

/// A channel that completed establishment
#[derive(Debug)]
pub struct Established {
    /// Ready-to-use stream
    pub stream: IoStream,
    /// Secure context the stream's TLS session was derived from
    pub secure_context: Option<SecureContext>,
    /// Peer address
    pub peer: SocketAddr,
    /// Lifecycle, now in [`SessionState::Established`]
    pub lifecycle: Lifecycle,
}

/// Look up `host:port`, IPv4 candidates first
pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, EstablishError> {
    let resolution_error = |source: io::Error| EstablishError::Resolution {
        host: host.to_string(),
        port,
        source,
    };

    let (mut v4, v6): (Vec<SocketAddr>, Vec<SocketAddr>) = tokio::net::lookup_host((host, port))
        .await
        .map_err(resolution_error)?
        .partition(|addr| addr.is_ipv4());

    v4.extend(v6);
    if v4.is_empty() {
        return Err(resolution_error(io::Error::new(
            io::ErrorKind::NotFound,
            "no addresses returned",
        )));
    }
    Ok(v4)
}

fn new_socket(addr: &SocketAddr) -> io::Result<TcpSocket> {
    match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

fn set_nodelay(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
}

/// Dials the server with a bounded fixed-interval retry
pub struct ClientConnector<'a> {
    config: &'a EndpointConfig,
    tls: Option<&'a ClientTls>,
    lifecycle: Lifecycle,
}

impl<'a> ClientConnector<'a> {
    /// Prepare a connector; `tls` is only used when the config enables TLS
    pub fn new(config: &'a EndpointConfig, tls: Option<&'a ClientTls>) -> Self {
        Self {
            config,
            tls,
            lifecycle: Lifecycle::new("client"),
        }
    }

    /// Run the client establishment sequence
    pub async fn connect(mut self) -> Result<Established, EstablishError> {
        match self.connect_inner().await {
            Ok(established) => Ok(established),
            Err(e) => {
                self.lifecycle.fail();
                error!("Client establishment failed at {}: {}", e.step(), e);
                Err(e)
            }
        }
    }

    async fn connect_inner(&mut self) -> Result<Established, EstablishError> {
        let config = self.config;

        let client_tls = match (config.tls_enabled, self.tls) {
            (true, Some(tls)) => Some(tls),
            (true, None) => {
                return Err(EstablishError::SecureContext(
                    "TLS enabled but no client secure context was provided".to_string(),
                ))
            }
            (false, _) => None,
        };

        self.lifecycle.transition(SessionState::Resolving);
        let candidates = resolve(&config.address, config.port).await?;
        debug!("Resolved {}:{} to {:?}", config.address, config.port, candidates);

        if config.transport == TransportKind::Udp {
            return self.connect_datagram(candidates).await;
        }

        // First candidate whose socket can be created
        let mut last_err = None;
        let mut chosen = None;
        for addr in candidates {
            match new_socket(&addr) {
                Ok(socket) => {
                    chosen = Some((addr, socket));
                    break;
                }
                Err(e) => {
                    debug!("Socket creation for {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        let (addr, mut socket) = chosen.ok_or_else(|| EstablishError::SocketCreate {
            host: config.address.clone(),
            port: config.port,
            source: last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no usable candidate")),
        })?;

        self.lifecycle.transition(SessionState::ClientConnecting);
        info!("Connecting to {} ({}:{})", addr, config.address, config.port);

        let mut attempts: u32 = 0;
        let mut waited = Duration::ZERO;
        let tcp_stream = loop {
            attempts += 1;
            match socket.connect(addr).await {
                Ok(stream) => break stream,
                Err(e) => {
                    debug!("Connect attempt {} to {} failed: {}", attempts, addr, e);
                    tokio::time::sleep(config.retry_wait).await;
                    waited += config.retry_wait;
                    info!("Retried to connect to server at {:>5} seconds", waited.as_secs());

                    if config.retry_wait.is_zero() || waited >= config.connect_timeout {
                        return Err(EstablishError::Connect {
                            addr,
                            attempts,
                            waited,
                            source: e,
                        });
                    }

                    socket = new_socket(&addr).map_err(|source| EstablishError::SocketCreate {
                        host: config.address.clone(),
                        port: config.port,
                        source,
                    })?;
                }
            }
        };

        set_nodelay(&tcp_stream);
        info!("TCP connection established to {} after {} attempt(s)", addr, attempts);

        let (stream, secure_context) = match client_tls {
            Some(client_tls) => {
                self.lifecycle.transition(SessionState::SecureHandshake);
                let stream = tls::connect_tls(client_tls, tcp_stream)
                    .await
                    .map_err(|source| EstablishError::Handshake { peer: addr, source })?;
                (stream, Some(client_tls.context()))
            }
            None => (IoStream::Plain(tcp_stream), None),
        };

        self.lifecycle.transition(SessionState::Established);
        Ok(Established {
            stream,
            secure_context,
            peer: addr,
            lifecycle: std::mem::replace(&mut self.lifecycle, Lifecycle::new("client")),
        })
    }
}

impl ClientConnector<'_> {
    /// Datagram client: bind an ephemeral local port and fix the default peer.
    /// No handshake happens, so there is nothing to retry.
    async fn connect_datagram(
        &mut self,
        candidates: Vec<SocketAddr>,
    ) -> Result<Established, EstablishError> {
        let config = self.config;
        if config.tls_enabled {
            return Err(EstablishError::SecureContext(
                "TLS is not available over udp".to_string(),
            ));
        }

        let mut last_err = None;
        let mut chosen = None;
        for addr in candidates {
            match UdpSocket::bind(unspecified_for(&addr)).await {
                Ok(socket) => {
                    chosen = Some((addr, socket));
                    break;
                }
                Err(e) => {
                    debug!("Datagram socket for {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        let (addr, socket) = chosen.ok_or_else(|| EstablishError::SocketCreate {
            host: config.address.clone(),
            port: config.port,
            source: last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no usable candidate")),
        })?;

        self.lifecycle.transition(SessionState::ClientConnecting);
        socket
            .connect(addr)
            .await
            .map_err(|source| EstablishError::Connect {
                addr,
                attempts: 1,
                waited: Duration::ZERO,
                source,
            })?;
        info!("Datagram socket connected to {} ({}:{})", addr, config.address, config.port);

        self.lifecycle.transition(SessionState::Established);
        Ok(Established {
            stream: IoStream::Datagram(socket),
            secure_context: None,
            peer: addr,
            lifecycle: std::mem::replace(&mut self.lifecycle, Lifecycle::new("client")),
        })
    }
}

/// Server side: bind and listen
pub struct ServerListener;

impl ServerListener {
    /// Resolve the bind address, bind the first usable candidate and listen
    pub async fn bind(config: &EndpointConfig) -> Result<BoundListener, EstablishError> {
        let mut lifecycle = Lifecycle::new("server");
        match Self::bind_inner(config, &mut lifecycle).await {
            Ok((listener, local_addr)) => {
                lifecycle.transition(SessionState::Listening);
                info!("Listening on {} for a single client", local_addr);
                Ok(BoundListener {
                    listener,
                    local_addr,
                    accept_timeout: config.accept_timeout,
                    tls_enabled: config.tls_enabled,
                    lifecycle,
                })
            }
            Err(e) => {
                lifecycle.fail();
                error!("Server establishment failed at {}: {}", e.step(), e);
                Err(e)
            }
        }
    }

    async fn bind_inner(
        config: &EndpointConfig,
        lifecycle: &mut Lifecycle,
    ) -> Result<(TcpListener, SocketAddr), EstablishError> {
        lifecycle.transition(SessionState::Resolving);
        let candidates = resolve(&config.address, config.port).await?;

        lifecycle.transition(SessionState::ServerBinding);
        if config.transport == TransportKind::Udp {
            return Err(Self::datagram_listen_error(config, candidates[0]).await);
        }

        let mut last_create_err = None;
        let mut last_bind_err = None;
        let mut bound = None;
        for addr in candidates {
            let socket = match new_socket(&addr) {
                Ok(socket) => socket,
                Err(e) => {
                    debug!("Socket creation for {} failed: {}", addr, e);
                    last_create_err = Some(e);
                    continue;
                }
            };

            if let Err(e) = socket.set_reuseaddr(true) {
                warn!("Failed to set SO_REUSEADDR on {}: {}", addr, e);
            }
            if let Err(e) = socket.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
            }

            match socket.bind(addr) {
                Ok(()) => {
                    bound = Some(socket);
                    break;
                }
                Err(e) => {
                    warn!("bind {}: {}", addr, e);
                    last_bind_err = Some(e);
                }
            }
        }

        let socket = match (bound, last_bind_err, last_create_err) {
            (Some(socket), _, _) => socket,
            (None, Some(source), _) => {
                return Err(EstablishError::Bind {
                    port: config.port,
                    source,
                })
            }
            (None, None, source) => {
                return Err(EstablishError::SocketCreate {
                    host: config.address.clone(),
                    port: config.port,
                    source: source
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no usable candidate")),
                })
            }
        };

        let local_addr = socket.local_addr().map_err(|source| EstablishError::Bind {
            port: config.port,
            source,
        })?;

        let listener = socket
            .listen(config.listen_backlog)
            .map_err(|source| EstablishError::Listen {
                addr: local_addr,
                source,
            })?;

        Ok((listener, local_addr))
    }
}

impl ServerListener {
    /// A datagram socket binds like a stream socket but cannot listen
    async fn datagram_listen_error(config: &EndpointConfig, addr: SocketAddr) -> EstablishError {
        let socket = match UdpSocket::bind(addr).await {
            Ok(socket) => socket,
            Err(source) => {
                return EstablishError::Bind {
                    port: config.port,
                    source,
                }
            }
        };
        EstablishError::Listen {
            addr: socket.local_addr().unwrap_or(addr),
            source: io::Error::new(
                io::ErrorKind::Unsupported,
                "listen is not supported on a datagram socket",
            ),
        }
    }
}

/// A listening socket waiting for its one peer
#[derive(Debug)]
pub struct BoundListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    accept_timeout: Option<Duration>,
    tls_enabled: bool,
    lifecycle: Lifecycle,
}

impl BoundListener {
    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept exactly one peer, close the listener, then run the TLS handshake if enabled
    pub async fn accept(mut self, tls: Option<&ServerTls>) -> Result<Established, EstablishError> {
        let result = Self::accept_inner(
            self.listener,
            self.local_addr,
            self.accept_timeout,
            self.tls_enabled,
            tls,
            &mut self.lifecycle,
        )
        .await;

        match result {
            Ok((stream, secure_context, peer)) => {
                self.lifecycle.transition(SessionState::Established);
                Ok(Established {
                    stream,
                    secure_context,
                    peer,
                    lifecycle: self.lifecycle,
                })
            }
            Err(e) => {
                self.lifecycle.fail();
                error!("Server establishment failed at {}: {}", e.step(), e);
                Err(e)
            }
        }
    }

    async fn accept_inner(
        listener: TcpListener,
        local_addr: SocketAddr,
        accept_timeout: Option<Duration>,
        tls_enabled: bool,
        tls: Option<&ServerTls>,
        lifecycle: &mut Lifecycle,
    ) -> Result<(IoStream, Option<SecureContext>, SocketAddr), EstablishError> {
        let server_tls = match (tls_enabled, tls) {
            (true, Some(tls)) => Some(tls),
            (true, None) => {
                return Err(EstablishError::SecureContext(
                    "TLS enabled but no server secure context was provided".to_string(),
                ))
            }
            (false, _) => None,
        };

        let accepted = match accept_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, listener.accept()).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no client connected within {:?}", deadline),
                )),
            },
            None => listener.accept().await,
        };

        // Single peer per lifetime: stop accepting as soon as accept returns
        drop(listener);

        let (tcp_stream, peer) = accepted.map_err(|source| EstablishError::Accept {
            addr: local_addr,
            source,
        })?;
        info!("Accepted client {} on {}; listener closed", peer, local_addr);
        set_nodelay(&tcp_stream);

        match server_tls {
            Some(server_tls) => {
                lifecycle.transition(SessionState::SecureHandshake);
                let stream = tls::accept_tls(server_tls, tcp_stream)
                    .await
                    .map_err(|source| EstablishError::Handshake { peer, source })?;
                Ok((stream, Some(server_tls.context()), peer))
            }
            None => Ok((IoStream::Plain(tcp_stream), None, peer)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn loopback_server() -> EndpointConfig {
        EndpointConfig {
            address: "127.0.0.1".to_string(),
            ..EndpointConfig::server(0)
        }
    }

    #[tokio::test]
    async fn test_resolve_orders_ipv4_first() {
        let addrs = resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addrs[0], "127.0.0.1:8080".parse().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retry_is_bounded() {
        let port = free_port();
        let config = EndpointConfig {
            connect_timeout: Duration::from_secs(30),
            retry_wait: Duration::from_secs(10),
            ..EndpointConfig::client("127.0.0.1", port)
        };

        let started = tokio::time::Instant::now();
        let err = ClientConnector::new(&config, None).connect().await.unwrap_err();

        match err {
            EstablishError::Connect {
                attempts, waited, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(waited, Duration::from_secs(30));
            }
            other => panic!("expected connect error, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_attempts_round_up() {
        let port = free_port();
        let config = EndpointConfig {
            connect_timeout: Duration::from_secs(25),
            retry_wait: Duration::from_secs(10),
            ..EndpointConfig::client("127.0.0.1", port)
        };

        match ClientConnector::new(&config, None).connect().await {
            Err(EstablishError::Connect {
                attempts, waited, ..
            }) => {
                assert_eq!(attempts, 3);
                assert!(waited >= Duration::from_secs(25));
            }
            Ok(established) => panic!("unexpected connection to {}", established.peer),
            Err(other) => panic!("expected connect error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listener_closed_after_accept() {
        let bound = ServerListener::bind(&loopback_server()).await.unwrap();
        let addr = bound.local_addr();

        let server = tokio::spawn(async move { bound.accept(None).await });
        let _client = TcpStream::connect(addr).await.unwrap();
        let established = server.await.unwrap().unwrap();
        assert_eq!(established.lifecycle.state(), SessionState::Established);

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_second_simultaneous_client_is_never_served() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let bound = ServerListener::bind(&loopback_server()).await.unwrap();
        let addr = bound.local_addr();

        // Both connect before the server accepts
        let mut first = TcpStream::connect(addr).await.unwrap();
        let first_local = first.local_addr().unwrap();
        let mut second = TcpStream::connect(addr).await.ok();

        let mut established = bound.accept(None).await.unwrap();
        assert_eq!(established.peer, first_local);
        established.stream.write_all(b"x").await.unwrap();
        let mut byte = [0u8; 1];
        first.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"x");

        // The queued connection is dropped with the listener
        if let Some(second) = second.as_mut() {
            let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut byte)).await;
            match read {
                Ok(Ok(n)) => assert_eq!(n, 0),
                Ok(Err(_)) => {}
                Err(_) => panic!("second client is still waiting on a closed listener"),
            }
        }
    }

    #[tokio::test]
    async fn test_accept_deadline() {
        let config = EndpointConfig {
            accept_timeout: Some(Duration::from_millis(50)),
            ..loopback_server()
        };
        let bound = ServerListener::bind(&config).await.unwrap();
        let err = bound.accept(None).await.unwrap_err();
        match err {
            EstablishError::Accept { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::TimedOut)
            }
            other => panic!("expected accept error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = EndpointConfig {
            address: "127.0.0.1".to_string(),
            ..EndpointConfig::server(taken.local_addr().unwrap().port())
        };

        let err = ServerListener::bind(&config).await.unwrap_err();
        assert!(matches!(err, EstablishError::Bind { .. }), "{:?}", err);
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_udp_client_connects_datagram_socket() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let config = EndpointConfig {
            transport: TransportKind::Udp,
            ..EndpointConfig::client("127.0.0.1", peer_addr.port())
        };

        let established = ClientConnector::new(&config, None).connect().await.unwrap();
        assert!(established.stream.is_datagram());
        assert!(established.secure_context.is_none());
        assert_eq!(established.peer, peer_addr);
        assert_eq!(established.lifecycle.state(), SessionState::Established);
    }

    #[tokio::test]
    async fn test_udp_client_refuses_tls() {
        let config = EndpointConfig {
            transport: TransportKind::Udp,
            tls_enabled: true,
            ..EndpointConfig::client("127.0.0.1", 9)
        };
        let (_, client_tls) = crate::transport::test_certs::localhost_pair();
        let err = ClientConnector::new(&config, Some(&client_tls))
            .connect()
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_udp_server_fails_at_listen() {
        let config = EndpointConfig {
            role: Role::Server,
            transport: TransportKind::Udp,
            ..loopback_server()
        };
        let err = ServerListener::bind(&config).await.unwrap_err();
        match err {
            EstablishError::Listen { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::Unsupported)
            }
            other => panic!("expected listen error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tls_without_context_is_fatal() {
        let config = EndpointConfig {
            tls_enabled: true,
            ..EndpointConfig::client("127.0.0.1", 9)
        };
        let err = ClientConnector::new(&config, None).connect().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, EstablishError::SecureContext(_)));
    }
}
