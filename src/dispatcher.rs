//! Per-connection dispatch: TLS handshake, session creation, execution.

use crate::error::ServerError;
use crate::registry::SessionRegistry;
use crate::server::ServerStats;
use crate::session::SessionFactory;
use crate::stream::ClientStream;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// Turns accepted sockets into running sessions.
///
/// Each connection gets its own worker task. The session itself runs on a
/// nested task so that a panic inside `run` surfaces as a join error
/// instead of tearing the worker down; the worker deregisters the session
/// afterwards no matter how `run` ended.
pub struct ConnectionDispatcher {
    factory: Arc<dyn SessionFactory>,
    registry: Arc<SessionRegistry>,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
    stats: Arc<ServerStats>,
}

impl ConnectionDispatcher {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        registry: Arc<SessionRegistry>,
        tls_acceptor: Option<Arc<TlsAcceptor>>,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            factory,
            registry,
            tls_acceptor,
            stats,
        }
    }

    /// Hands one accepted connection to a freshly spawned worker.
    pub fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let factory = self.factory.clone();
        let registry = self.registry.clone();
        let tls_acceptor = self.tls_acceptor.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let stream =
                match Self::secure_stream(stream, tls_acceptor.as_deref(), peer).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!("[{}] TLS handshake failed: {}", peer, e);
                        stats.tls_handshake_failures.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                };

            let handler = factory.create(stream, peer);
            let Some(id) = registry.register(handler.clone()) else {
                // Shutdown won the race; the session never runs.
                tracing::debug!("[{}] rejecting connection, server shutting down", peer);
                if let Err(e) = handler.close() {
                    tracing::debug!("[{}] close of rejected session failed: {}", peer, e);
                }
                return;
            };

            stats.connections_active.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("[{}] session started", peer);

            let run = {
                let handler = handler.clone();
                tokio::spawn(async move { handler.run().await })
            };
            match run.await {
                Ok(Ok(())) => tracing::debug!("[{}] session finished", peer),
                Ok(Err(e)) => {
                    stats.sessions_failed_total.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("[{}] session error: {}", peer, e);
                }
                Err(e) => {
                    stats.sessions_failed_total.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("[{}] session panicked: {}", peer, e);
                }
            }

            // Always reached, whatever happened to the session above.
            registry.deregister(id);
            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!("[{}] session deregistered", peer);
        });
    }

    /// Optionally performs the TLS handshake on an accepted stream.
    async fn secure_stream(
        stream: TcpStream,
        acceptor: Option<&TlsAcceptor>,
        peer: SocketAddr,
    ) -> Result<ClientStream, ServerError> {
        match acceptor {
            Some(acceptor) => {
                tracing::debug!("[{}] performing TLS handshake", peer);
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
                Ok(ClientStream::Tls { stream: tls_stream })
            }
            None => Ok(ClientStream::Plain { stream }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::session::SessionHandler;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    enum Behavior {
        Succeed,
        Fail,
        Panic,
    }

    struct ScriptedSession {
        behavior: Behavior,
        ran: AtomicBool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl SessionHandler for ScriptedSession {
        async fn run(&self) -> Result<(), SessionError> {
            self.ran.store(true, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err(SessionError::Protocol("scripted failure".into())),
                Behavior::Panic => panic!("scripted panic"),
            }
        }

        fn close(&self) -> Result<(), SessionError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedFactory {
        behavior: fn() -> Behavior,
        last: parking_lot::Mutex<Option<Arc<ScriptedSession>>>,
    }

    impl ScriptedFactory {
        fn new(behavior: fn() -> Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                last: parking_lot::Mutex::new(None),
            })
        }

        fn last(&self) -> Arc<ScriptedSession> {
            self.last.lock().clone().expect("no session created")
        }
    }

    impl SessionFactory for ScriptedFactory {
        fn create(&self, _stream: ClientStream, _peer: SocketAddr) -> Arc<dyn SessionHandler> {
            let session = Arc::new(ScriptedSession {
                behavior: (self.behavior)(),
                ran: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            });
            *self.last.lock() = Some(session.clone());
            session
        }
    }

    async fn connected_pair() -> (TcpStream, SocketAddr) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        (accepted, peer)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn dispatcher(
        factory: Arc<ScriptedFactory>,
    ) -> (ConnectionDispatcher, Arc<SessionRegistry>, Arc<ServerStats>) {
        let registry = Arc::new(SessionRegistry::new());
        let stats = Arc::new(ServerStats::default());
        let dispatcher =
            ConnectionDispatcher::new(factory, registry.clone(), None, stats.clone());
        (dispatcher, registry, stats)
    }

    #[tokio::test]
    async fn test_session_runs_and_deregisters() {
        let factory = ScriptedFactory::new(|| Behavior::Succeed);
        let (dispatcher, registry, _stats) = dispatcher(factory.clone());

        let (stream, peer) = connected_pair().await;
        dispatcher.dispatch(stream, peer);

        wait_for(|| {
            factory
                .last
                .lock()
                .as_ref()
                .is_some_and(|s| s.ran.load(Ordering::SeqCst))
        })
        .await;
        wait_for(|| registry.is_empty()).await;
    }

    #[tokio::test]
    async fn test_failing_session_is_deregistered() {
        let factory = ScriptedFactory::new(|| Behavior::Fail);
        let (dispatcher, registry, stats) = dispatcher(factory.clone());

        let (stream, peer) = connected_pair().await;
        dispatcher.dispatch(stream, peer);

        wait_for(|| stats.sessions_failed_total.load(Ordering::SeqCst) == 1).await;
        wait_for(|| registry.is_empty()).await;
        assert!(factory.last().ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_session_is_deregistered() {
        let factory = ScriptedFactory::new(|| Behavior::Panic);
        let (dispatcher, registry, stats) = dispatcher(factory.clone());

        let (stream, peer) = connected_pair().await;
        dispatcher.dispatch(stream, peer);

        wait_for(|| stats.sessions_failed_total.load(Ordering::SeqCst) == 1).await;
        wait_for(|| registry.is_empty()).await;
        wait_for(|| stats.connections_active.load(Ordering::SeqCst) == 0).await;
    }

    #[tokio::test]
    async fn test_connection_after_shutdown_never_runs() {
        let factory = ScriptedFactory::new(|| Behavior::Succeed);
        let (dispatcher, registry, _stats) = dispatcher(factory.clone());
        registry.close_all().unwrap();

        let (stream, peer) = connected_pair().await;
        dispatcher.dispatch(stream, peer);

        // The worker rejects the registration and closes the session.
        wait_for(|| {
            factory
                .last
                .lock()
                .as_ref()
                .is_some_and(|s| s.closed.load(Ordering::SeqCst))
        })
        .await;

        let session = factory.last();
        assert!(!session.ran.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }
}
