//! Server error types.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the server core.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configured bind address could not be resolved. The server
    /// cannot be constructed.
    #[error("cannot resolve bind address '{addr}': {source}")]
    AddressResolution {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The port stayed busy for the whole retry window. Carries the most
    /// recent bind error.
    #[error("bind to {addr} failed after {attempts} attempt(s): {source}")]
    BindExhausted {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// One or more session handlers failed to close during shutdown. All
    /// handlers were still attempted before this surfaced.
    #[error("shutdown failed: {failures} session(s) failed to close, first error: {first}")]
    Shutdown {
        failures: usize,
        first: SessionError,
    },
}

/// Errors produced by a protocol session. Contained to that session; they
/// never reach the accept loop.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session closed")]
    Closed,
}
