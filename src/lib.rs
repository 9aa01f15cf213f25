//! # portico
//!
//! Protocol-agnostic TCP server core.
//!
//! This crate provides:
//! - Listening socket lifecycle: bind with bounded retry, accept loop,
//!   graceful shutdown
//! - Session lifecycle bookkeeping with shutdown fan-out
//! - Optional TLS via rustls
//! - Layered configuration (defaults, YAML file, environment)
//!
//! Protocol logic lives behind the [`SessionFactory`] and [`SessionHandler`]
//! capability traits; the core never parses a byte of the wire protocol.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod stream;
pub mod tls;

pub use config::{BindRetryConfig, Config, ConfigError, ServerSettings, TlsConfig};
pub use dispatcher::ConnectionDispatcher;
pub use error::{ServerError, SessionError};
pub use registry::{SessionId, SessionRegistry};
pub use server::{BindRetry, Server, ServerConfig, ServerStats};
pub use session::{SessionFactory, SessionHandler};
pub use stream::ClientStream;
