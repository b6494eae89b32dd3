//! TCP, TLS and datagram channels for simlink sessions.
//!
//! [`IoStream`] is the channel the data plane reads and writes. It is either a
//! plain TCP stream, the same stream wrapped in a rustls session, or a
//! connected UDP socket. It can be taken apart again at teardown so the TLS
//! state is released before the socket is shut down.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

/// Unified channel type: plain TCP, TLS, or a connected datagram socket
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS stream, server side
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// TLS stream, client side
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
    /// UDP socket connected to its single peer; one write is one datagram
    Datagram(UdpSocket),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Datagram(socket) => socket.poll_recv(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Datagram(socket) => socket.poll_send(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Datagram(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
            // Datagrams have no write direction to close
            IoStream::Datagram(_) => Poll::Ready(Ok(())),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying socket
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
            IoStream::Datagram(socket) => socket.peer_addr(),
        }
    }

    /// Whether a TLS session wraps the socket
    pub fn is_secure(&self) -> bool {
        matches!(self, IoStream::Tls(_) | IoStream::TlsClient(_))
    }

    /// Whether this is a datagram channel
    pub fn is_datagram(&self) -> bool {
        matches!(self, IoStream::Datagram(_))
    }

    /// Drop the TLS session state (if any), keeping the raw socket
    pub fn into_raw(self) -> IoStream {
        match self {
            IoStream::Tls(stream) => IoStream::Plain(stream.into_inner().0),
            IoStream::TlsClient(stream) => IoStream::Plain(stream.into_inner().0),
            raw => raw,
        }
    }
}

impl std::fmt::Debug for IoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            IoStream::Plain(_) => "Plain",
            IoStream::Tls(_) => "Tls",
            IoStream::TlsClient(_) => "TlsClient",
            IoStream::Datagram(_) => "Datagram",
        };
        f.debug_struct("IoStream")
            .field("kind", &kind)
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

/// TLS contexts and handshakes
pub mod tls {
    use super::*;
    use crate::error::EstablishError;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::path::Path;
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::{debug, info};

    /// ALPN identifier offered by both ends
    pub const ALPN_PROTOCOL: &[u8] = b"simlink/1";

    /// Reusable TLS configuration a secure session is derived from
    #[derive(Clone)]
    pub enum SecureContext {
        /// Client-side configuration
        Client(Arc<ClientConfig>),
        /// Server-side configuration
        Server(Arc<ServerConfig>),
    }

    impl std::fmt::Debug for SecureContext {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                SecureContext::Client(_) => f.write_str("SecureContext::Client"),
                SecureContext::Server(_) => f.write_str("SecureContext::Server"),
            }
        }
    }

    /// Client secure context plus the name the server certificate must carry
    #[derive(Clone)]
    pub struct ClientTls {
        /// Rustls client configuration
        pub config: Arc<ClientConfig>,
        /// Server name for SNI and certificate verification
        pub server_name: ServerName<'static>,
    }

    /// Server secure context preloaded with certificate and key
    #[derive(Clone)]
    pub struct ServerTls {
        /// Rustls server configuration
        pub config: Arc<ServerConfig>,
    }

    impl std::fmt::Debug for ClientTls {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ClientTls")
                .field("server_name", &self.server_name)
                .finish_non_exhaustive()
        }
    }

    impl std::fmt::Debug for ServerTls {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ServerTls").finish_non_exhaustive()
        }
    }

    impl ClientTls {
        /// Wrap a client configuration; fails if `sni` is not a valid server name
        pub fn new(config: ClientConfig, sni: &str) -> Result<Self, EstablishError> {
            let server_name = ServerName::try_from(sni.to_owned())
                .map_err(|_| EstablishError::SecureContext(format!("invalid server name: {}", sni)))?;
            Ok(Self {
                config: Arc::new(config),
                server_name,
            })
        }

        /// The context this client derives sessions from
        pub fn context(&self) -> SecureContext {
            SecureContext::Client(self.config.clone())
        }
    }

    impl ServerTls {
        /// Wrap a server configuration
        pub fn new(config: ServerConfig) -> Self {
            Self {
                config: Arc::new(config),
            }
        }

        /// The context this server derives sessions from
        pub fn context(&self) -> SecureContext {
            SecureContext::Server(self.config.clone())
        }
    }

    fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
        let certs = rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificate chain")?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }
        Ok(certs)
    }

    /// Create a TLS server configuration from PEM certificate chain and key
    pub fn make_server_config(cert_chain_pem: &str, private_key_pem: &str) -> Result<ServerConfig> {
        info!("Creating TLS server configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certs = parse_certs(cert_chain_pem)?;

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Failed to configure server certificate")?;

        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        info!("TLS server configuration created successfully");
        Ok(config)
    }

    /// Create a TLS client configuration trusting the PEM certificates in `ca_pem`
    pub fn make_client_config(ca_pem: &str) -> Result<ClientConfig> {
        info!("Creating TLS client configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        for ca_cert in parse_certs(ca_pem).context("Failed to parse CA certificates")? {
            roots
                .add(ca_cert)
                .context("Failed to add CA certificate to root store")?;
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        info!("TLS client configuration created successfully");
        Ok(config)
    }

    /// Server context from PEM strings
    pub fn server_tls_from_pem(cert_pem: &str, key_pem: &str) -> Result<ServerTls, EstablishError> {
        make_server_config(cert_pem, key_pem)
            .map(ServerTls::new)
            .map_err(|e| EstablishError::SecureContext(format!("{:#}", e)))
    }

    /// Client context from a PEM trust anchor string
    pub fn client_tls_from_pem(ca_pem: &str, server_name: &str) -> Result<ClientTls, EstablishError> {
        let config = make_client_config(ca_pem)
            .map_err(|e| EstablishError::SecureContext(format!("{:#}", e)))?;
        ClientTls::new(config, server_name)
    }

    fn read_pem(path: &Path, what: &str) -> Result<String, EstablishError> {
        std::fs::read_to_string(path).map_err(|e| {
            EstablishError::SecureContext(format!("failed to read {} {:?}: {}", what, path, e))
        })
    }

    /// Server context from certificate and key files
    pub fn load_server_tls(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<ServerTls, EstablishError> {
        let cert = read_pem(cert_path.as_ref(), "certificate")?;
        let key = read_pem(key_path.as_ref(), "private key")?;
        server_tls_from_pem(&cert, &key)
    }

    /// Client context from a trust anchor file
    pub fn load_client_tls(
        ca_path: impl AsRef<Path>,
        server_name: &str,
    ) -> Result<ClientTls, EstablishError> {
        let ca = read_pem(ca_path.as_ref(), "CA certificate")?;
        client_tls_from_pem(&ca, server_name)
    }

    /// Run the server side of the handshake on an accepted socket
    pub async fn accept_tls(server: &ServerTls, tcp_stream: TcpStream) -> std::io::Result<IoStream> {
        debug!("Accepting TLS connection from {:?}", tcp_stream.peer_addr().ok());

        let tls_stream = TlsAcceptor::from(server.config.clone())
            .accept(tcp_stream)
            .await?;

        debug!(
            "TLS connection accepted, protocol {:?}",
            tls_stream.get_ref().1.protocol_version()
        );
        Ok(IoStream::Tls(tls_stream))
    }

    /// Run the client side of the handshake on a connected socket
    pub async fn connect_tls(client: &ClientTls, tcp_stream: TcpStream) -> std::io::Result<IoStream> {
        debug!(
            "Connecting via TLS to {:?} (SNI: {:?})",
            tcp_stream.peer_addr().ok(),
            client.server_name
        );

        let tls_stream = TlsConnector::from(client.config.clone())
            .connect(client.server_name.clone(), tcp_stream)
            .await?;

        debug!(
            "TLS connection established, protocol {:?}",
            tls_stream.get_ref().1.protocol_version()
        );
        Ok(IoStream::TlsClient(tls_stream))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_stream_peer_addr() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = TcpStream::connect(bound_addr).await.unwrap();
        let io_stream = IoStream::Plain(stream);

        assert_eq!(io_stream.peer_addr().unwrap(), bound_addr);
        assert!(!io_stream.is_secure());
    }

    #[tokio::test]
    async fn test_datagram_channel_moves_whole_datagrams() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(peer.local_addr().unwrap()).await.unwrap();

        let mut channel = IoStream::Datagram(socket);
        assert!(channel.is_datagram());
        assert!(!channel.is_secure());
        assert_eq!(channel.peer_addr().unwrap(), peer.local_addr().unwrap());

        assert_eq!(channel.write(b"ping").await.unwrap(), 4);
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        peer.send_to(b"pong", from).await.unwrap();
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");

        // No half-close for datagrams; the socket stays usable
        channel.shutdown().await.unwrap();
        assert!(matches!(channel.into_raw(), IoStream::Datagram(_)));
    }

    #[tokio::test]
    async fn test_tls_handshake_and_unwrap() {
        let (server_tls, client_tls) = test_certs::localhost_pair();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = tls::accept_tls(&server_tls, socket).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert!(stream.is_secure());
            buf
        });

        let socket = TcpStream::connect(bound_addr).await.unwrap();
        let mut stream = tls::connect_tls(&client_tls, socket).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(&server.await.unwrap(), b"hello");

        let raw = stream.into_raw();
        assert!(matches!(raw, IoStream::Plain(_)));
        assert_eq!(raw.peer_addr().unwrap(), bound_addr);
    }

    #[test]
    fn test_bad_pem_is_secure_context_error() {
        let err = tls::server_tls_from_pem("not a cert", "not a key").unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.step(), "secure-context");

        let err = tls::load_client_tls("/nonexistent/ca.pem", "localhost").unwrap_err();
        assert!(matches!(err, crate::EstablishError::SecureContext(_)));
    }

    #[test]
    fn test_contexts_debug_without_key_material() {
        let (server_tls, client_tls) = test_certs::localhost_pair();
        assert_eq!(format!("{:?}", server_tls), "ServerTls { .. }");

        let client = format!("{:?}", client_tls);
        assert!(client.starts_with("ClientTls {"));
        assert!(client.contains("localhost"));
    }
}
