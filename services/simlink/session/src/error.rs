//! Establishment error types.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while bringing a session to the established state.
///
/// Resolution, socket, bind, listen, accept and connect failures are ordinary
/// errors the caller may retry or report. [`EstablishError::SecureContext`]
/// and [`EstablishError::Handshake`] are fatal: a channel whose security layer
/// failed must never carry data, so callers are expected to terminate.
#[derive(Error, Debug)]
pub enum EstablishError {
    /// Address or service lookup failed
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolution {
        /// Host that was looked up
        host: String,
        /// Port that was looked up
        port: u16,
        /// Resolver error
        #[source]
        source: io::Error,
    },

    /// No candidate address produced a usable socket
    #[error("failed to create socket for {host}:{port}: {source}")]
    SocketCreate {
        /// Configured host
        host: String,
        /// Configured port
        port: u16,
        /// Last socket creation error
        #[source]
        source: io::Error,
    },

    /// Connect retry budget exhausted
    #[error("failed to connect to {addr} after {attempts} attempts ({waited:?} waited): {source}")]
    Connect {
        /// Candidate that was being dialled
        addr: SocketAddr,
        /// Number of connect attempts made
        attempts: u32,
        /// Accumulated retry wait
        waited: Duration,
        /// Error from the last attempt
        #[source]
        source: io::Error,
    },

    /// Every bind candidate failed
    #[error("failed to bind port {port}: {source}")]
    Bind {
        /// Port that was requested
        port: u16,
        /// Error from the last candidate
        #[source]
        source: io::Error,
    },

    /// `listen` failed on the bound socket
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        /// Bound address
        addr: SocketAddr,
        /// Listen error
        #[source]
        source: io::Error,
    },

    /// `accept` failed or its deadline passed
    #[error("failed to accept on {addr}: {source}")]
    Accept {
        /// Listening address
        addr: SocketAddr,
        /// Accept error
        #[source]
        source: io::Error,
    },

    /// TLS configuration, certificate or key could not be loaded
    #[error("secure context error: {0}")]
    SecureContext(String),

    /// TLS handshake failed
    #[error("TLS handshake with {peer} failed: {source}")]
    Handshake {
        /// Remote address
        peer: SocketAddr,
        /// Handshake error
        #[source]
        source: io::Error,
    },
}

impl EstablishError {
    /// True for security failures that must terminate the caller
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EstablishError::SecureContext(_) | EstablishError::Handshake { .. }
        )
    }

    /// Short name of the establishment step that failed
    pub fn step(&self) -> &'static str {
        match self {
            EstablishError::Resolution { .. } => "resolve",
            EstablishError::SocketCreate { .. } => "socket",
            EstablishError::Connect { .. } => "connect",
            EstablishError::Bind { .. } => "bind",
            EstablishError::Listen { .. } => "listen",
            EstablishError::Accept { .. } => "accept",
            EstablishError::SecureContext(_) => "secure-context",
            EstablishError::Handshake { .. } => "handshake",
        }
    }
}
