//! Graceful, symmetric session teardown.
//!
//! The order is fixed: drop the TLS session, half-close the socket for
//! writing, drain whatever the peer still sends until it half-closes too,
//! close the socket, then drop the secure context. Writing the FIN before
//! draining and closing only after the drain avoids resetting the
//! connection while the peer still has data in flight.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::transport::tls::SecureContext;
use crate::transport::IoStream;

/// Read buffer size used while draining
pub const DRAIN_BUFFER_SIZE: usize = 128;

/// Operations teardown needs from a channel
#[async_trait]
pub trait HalfClose: Send {
    /// Drop per-connection TLS state, keeping the raw socket
    fn release_secure_session(&mut self);

    /// Shut down the outbound direction
    async fn shutdown_write(&mut self) -> io::Result<()>;

    /// One raw read from the socket
    async fn drain_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close the socket; later calls do nothing
    fn close(&mut self);

    /// Drop the secure context
    fn release_secure_context(&mut self);
}

/// Why the drain loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainEnd {
    /// Peer half-closed (read returned 0)
    PeerClosed,
    /// Read failed with a non-interrupt error
    Error(io::ErrorKind),
    /// Drain deadline elapsed
    TimedOut,
}

/// Summary of a finished teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Bytes read and discarded while draining
    pub bytes_drained: u64,
    /// Why draining stopped
    pub end: DrainEnd,
}

/// Run the teardown sequence. Never fails; errors are logged and swallowed.
pub async fn graceful_close<T>(channel: &mut T, drain_timeout: Option<Duration>) -> DrainOutcome
where
    T: HalfClose + ?Sized,
{
    channel.release_secure_session();

    if let Err(e) = channel.shutdown_write().await {
        debug!("Write shutdown failed: {}", e);
    }

    let mut bytes_drained = 0u64;
    let end = match drain_timeout {
        Some(deadline) => {
            match tokio::time::timeout(deadline, drain(&mut *channel, &mut bytes_drained)).await {
                Ok(end) => end,
                Err(_) => {
                    warn!("Peer did not close within {:?}; closing anyway", deadline);
                    DrainEnd::TimedOut
                }
            }
        }
        None => drain(&mut *channel, &mut bytes_drained).await,
    };
    debug!("Drain finished ({:?}, {} bytes discarded)", end, bytes_drained);

    channel.close();
    channel.release_secure_context();

    DrainOutcome { bytes_drained, end }
}

async fn drain<T>(channel: &mut T, bytes_drained: &mut u64) -> DrainEnd
where
    T: HalfClose + ?Sized,
{
    let mut buf = [0u8; DRAIN_BUFFER_SIZE];
    loop {
        match channel.drain_read(&mut buf).await {
            Ok(0) => return DrainEnd::PeerClosed,
            Ok(n) => *bytes_drained += n as u64,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return DrainEnd::Error(e.kind()),
        }
    }
}

/// [`HalfClose`] over a session's real channel and secure context
#[derive(Debug)]
pub struct SocketTeardown {
    stream: Option<IoStream>,
    raw: Option<IoStream>,
    secure_context: Option<SecureContext>,
}

impl SocketTeardown {
    /// Take ownership of the pieces teardown releases
    pub fn new(stream: Option<IoStream>, secure_context: Option<SecureContext>) -> Self {
        Self {
            stream,
            raw: None,
            secure_context,
        }
    }

    fn raw_mut(&mut self) -> io::Result<&mut IoStream> {
        self.raw
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

#[async_trait]
impl HalfClose for SocketTeardown {
    fn release_secure_session(&mut self) {
        if let Some(stream) = self.stream.take() {
            if stream.is_secure() {
                debug!("Releasing TLS session");
            }
            self.raw = Some(stream.into_raw());
        }
    }

    async fn shutdown_write(&mut self) -> io::Result<()> {
        // shutdown(SHUT_WR) for TCP, nothing for datagrams
        self.raw_mut()?.shutdown().await
    }

    async fn drain_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.raw_mut()? {
            // A connected datagram peer never signals end of stream
            IoStream::Datagram(_) => Ok(0),
            raw => raw.read(buf).await,
        }
    }

    fn close(&mut self) {
        if self.raw.take().is_some() {
            debug!("Socket closed");
        }
    }

    fn release_secure_context(&mut self) {
        if self.secure_context.take().is_some() {
            debug!("Secure context released");
        }
    }
}
