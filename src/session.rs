//! Session capability traits.
//!
//! A protocol implementation plugs into the server core through two seams:
//! [`SessionFactory`] turns an accepted stream into a handler, and
//! [`SessionHandler`] runs one client session. The core never parses a byte
//! of the wire protocol.

use crate::error::SessionError;
use crate::stream::ClientStream;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

/// Protocol-specific logic executed for one accepted connection.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Runs the session until the peer disconnects or an unrecoverable
    /// session error occurs. Must return promptly once [`close`] has been
    /// invoked.
    ///
    /// [`close`]: SessionHandler::close
    async fn run(&self) -> Result<(), SessionError>;

    /// Releases all session resources and forces any in-progress
    /// [`run`] to terminate. Safe to call after `run` has completed, and
    /// more than once: shutdown and a racing registration rejection may
    /// both reach the same handler.
    ///
    /// [`run`]: SessionHandler::run
    fn close(&self) -> Result<(), SessionError>;
}

/// Creates a session handler for each accepted connection.
pub trait SessionFactory: Send + Sync + 'static {
    /// Wraps an accepted stream into a new session handler. Called once per
    /// connection, after the TLS handshake when TLS is configured.
    fn create(&self, stream: ClientStream, peer: SocketAddr) -> Arc<dyn SessionHandler>;
}
