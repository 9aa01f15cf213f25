//! TCP server core: bind with retry, accept loop, shutdown fan-out.

use crate::config::ServerSettings;
use crate::dispatcher::ConnectionDispatcher;
use crate::error::ServerError;
use crate::registry::SessionRegistry;
use crate::session::SessionFactory;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio_rustls::TlsAcceptor;

/// Address bound when no bind address is configured.
const WILDCARD_ADDR: &str = "0.0.0.0";

/// Bind retry policy.
///
/// The OS may hold a port busy for a short moment after its previous owner
/// exits (rapid restarts in tests), so bind conflicts are re-attempted a
/// bounded number of times. This is not a reconnect strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRetry {
    /// Maximum bind attempts before giving up.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for BindRetry {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            delay: Duration::from_millis(10),
        }
    }
}

/// Runtime server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Immutable listen settings.
    pub settings: ServerSettings,
    /// Bind retry policy.
    pub bind_retry: BindRetry,
    /// TLS acceptor, required when `settings.secure` is set.
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("settings", &self.settings)
            .field("bind_retry", &self.bind_retry)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            bind_retry: BindRetry::default(),
            tls_acceptor: None,
        }
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Overrides the bind retry policy.
    pub fn with_bind_retry(mut self, retry: BindRetry) -> Self {
        self.bind_retry = retry;
        self
    }

    /// Returns whether TLS is enabled.
    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub sessions_failed_total: AtomicU64,
    pub tls_handshake_failures: AtomicU64,
}

/// Protocol-agnostic TCP server.
///
/// Owns the listening socket lifecycle and the bookkeeping of live
/// sessions; everything protocol-specific happens behind the
/// [`SessionFactory`] passed at construction.
pub struct Server {
    config: ServerConfig,
    bind_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    dispatcher: ConnectionDispatcher,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    started: watch::Sender<Option<SocketAddr>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Creates a new server.
    ///
    /// Resolves the configured bind address eagerly; a server whose address
    /// cannot be resolved is never constructed. A secure configuration
    /// without a TLS acceptor is rejected the same way.
    pub fn new(
        config: ServerConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, ServerError> {
        if config.settings.secure && config.tls_acceptor.is_none() {
            return Err(ServerError::TlsConfig(
                "secure flag set but no TLS acceptor configured".into(),
            ));
        }

        let bind_addr = resolve_bind_addr(&config.settings)?;
        let registry = Arc::new(SessionRegistry::new());
        let stats = Arc::new(ServerStats::default());
        let dispatcher = ConnectionDispatcher::new(
            factory,
            registry.clone(),
            config.tls_acceptor.clone(),
            stats.clone(),
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        let (started_tx, _) = watch::channel(None);

        Ok(Self {
            config,
            bind_addr,
            registry,
            dispatcher,
            stats,
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
            started: started_tx,
            local_addr: parking_lot::Mutex::new(None),
        })
    }

    /// Binds the listening socket, retrying transient conflicts.
    async fn open_listener(&self) -> Result<TcpListener, ServerError> {
        let retry = self.config.bind_retry;
        let mut last_conflict: Option<io::Error> = None;

        for attempt in 1..=retry.max_attempts {
            match TcpListener::bind(self.bind_addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    tracing::debug!(
                        "bind attempt {}/{} on {} conflicted, retrying",
                        attempt,
                        retry.max_attempts,
                        self.bind_addr
                    );
                    last_conflict = Some(e);
                    tokio::time::sleep(retry.delay).await;
                }
                Err(e) => return Err(ServerError::Io(e)),
            }
        }

        let source = last_conflict.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrInUse, "no bind attempts were made")
        });
        Err(ServerError::BindExhausted {
            addr: self.bind_addr,
            attempts: retry.max_attempts,
            source,
        })
    }

    /// Runs the server until shutdown.
    ///
    /// Binds (fatal if the retry window is exhausted), publishes the
    /// startup signal exactly once, then accepts connections until
    /// [`shutdown`] is requested. Accept-time I/O errors are expected
    /// during shutdown races and never stop the loop.
    ///
    /// [`shutdown`]: Server::shutdown
    pub async fn run(&self) -> Result<(), ServerError> {
        // Subscribe before the startup signal is observable: a shutdown
        // requested by a waiter must not slip between bind and the loop.
        let mut shutdown_rx = self.shutdown.subscribe();

        let listener = self.open_listener().await?;
        let local_addr = listener.local_addr()?;

        *self.local_addr.lock() = Some(local_addr);
        self.running.store(true, Ordering::SeqCst);
        self.started.send_replace(Some(local_addr));

        tracing::info!(
            "{} listening on {} ({})",
            self.config.settings.protocol,
            local_addr,
            if self.config.tls_enabled() {
                "TLS"
            } else {
                "plain"
            }
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            if !self.is_running() {
                                tracing::warn!(
                                    "discarding connection from {} accepted during shutdown",
                                    peer
                                );
                                continue;
                            }
                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.dispatcher.dispatch(stream, peer);
                        }
                        Err(e) => {
                            // Expected while the socket is being torn down.
                            tracing::debug!("accept error on {}: {}", local_addr, e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        drop(listener);
        tracing::info!("{} stopped accepting on {}", self, local_addr);
        self.shutdown()
    }

    /// Closes every active session, then releases the listening socket.
    ///
    /// Idempotent and safe under concurrent invocation: a later call finds
    /// an empty registry and an already signalled accept loop. Session
    /// close failures are escalated after the whole registry has been
    /// attempted.
    pub fn shutdown(&self) -> Result<(), ServerError> {
        let drained = self.registry.close_all();
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(());

        match drained {
            Ok(0) => Ok(()),
            Ok(n) => {
                tracing::info!("{} closed {} active session(s)", self, n);
                Ok(())
            }
            Err(e) => {
                tracing::error!("{} shutdown error: {}", self, e);
                Err(e)
            }
        }
    }

    /// Waits until the server has bound its listening socket, returning the
    /// bound address. The signal is published exactly once per server
    /// lifetime; the server does not support start/stop cycles.
    pub async fn wait_until_running(&self) -> SocketAddr {
        let mut rx = self.started.subscribe();
        loop {
            if let Some(addr) = *rx.borrow_and_update() {
                return addr;
            }
            if rx.changed().await.is_err() {
                // The sender lives inside self and cannot drop while we
                // hold a borrow of it.
                unreachable!("startup channel closed while server alive");
            }
        }
    }

    /// Returns whether the server is accepting connections.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The address the listening socket is bound to, once running. With
    /// port 0 this is the ephemeral port the OS picked.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// The resolved bind address.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// The configured port.
    pub fn port(&self) -> u16 {
        self.config.settings.port
    }

    /// The protocol label, descriptive only.
    pub fn protocol(&self) -> &str {
        &self.config.settings.protocol
    }

    /// The immutable settings this server was built from.
    pub fn settings(&self) -> &ServerSettings {
        &self.config.settings
    }

    /// Number of currently active sessions.
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.config.settings.protocol, self.config.settings.port
        )
    }
}

/// Resolves the configured bind address, or the wildcard address if unset.
fn resolve_bind_addr(settings: &ServerSettings) -> Result<SocketAddr, ServerError> {
    let host = settings.bind_address.as_deref().unwrap_or(WILDCARD_ADDR);
    (host, settings.port)
        .to_socket_addrs()
        .map_err(|e| ServerError::AddressResolution {
            addr: host.to_string(),
            source: e,
        })?
        .next()
        .ok_or_else(|| ServerError::AddressResolution {
            addr: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
        })
}
