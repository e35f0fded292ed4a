//! The Server: binds listeners, accepts connections, and coordinates
//! graceful shutdown across every session it has spawned (§4.1).

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::connection::DebugSink;
use crate::error::{Error, Result};
use crate::handler::HandlerFactory;
use crate::join::JoinCounter;
use crate::session::Session;
use crate::DEFAULT_PORT;

/// How long the accept loop sleeps after a transient `accept()` failure
/// before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Consecutive `accept()` failures tolerated before `serve` gives up and
/// returns an error — roughly three seconds of retrying at the delay above.
const MAX_ACCEPT_RETRIES: u32 = 30;

struct Inner {
    handler_factory: Option<Arc<dyn HandlerFactory>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    debug_sink: Option<DebugSink>,
    notify_shutdown: broadcast::Sender<()>,
    listeners: Mutex<HashSet<u64>>,
    next_listener_id: AtomicU64,
    next_connection_id: AtomicU64,
    /// Tracks sessions spawned but not yet fully closed. See `join.rs` for
    /// why this is a plain counter rather than the mpsc-close pattern
    /// `Session` itself uses for its handler join counter: `Server` is a
    /// shared, cloneable, reusable handle, so there is no single owner who
    /// could drop a "master" sender to signal completion.
    join: JoinCounter,
}

/// An embeddable LDAP v3 server core.
///
/// `Server` is cheap to clone (an `Arc` internally) so the same handle can be
/// passed to multiple `serve` calls — one per listener — and to whichever
/// task later calls `shutdown`.
#[derive(Clone)]
pub struct Server(Arc<Inner>);

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Bind a TCP listener at `address` and serve on it until shutdown.
    ///
    /// An empty `address` binds `0.0.0.0` on the default LDAP port.
    pub async fn listen_and_serve(&self, address: &str) -> Result<()> {
        let address = resolve_listen_address(address);

        let listener = TcpListener::bind(&address).await?;
        info!(%address, "listening");
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener until the server
    /// shuts down or accepting fails permanently.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let factory = self
            .0
            .handler_factory
            .clone()
            .ok_or(Error::MissingHandlerFactory)?;

        let listener_id = self.0.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.0.listeners.lock().unwrap().insert(listener_id);

        let mut shutdown_rx = self.0.notify_shutdown.subscribe();

        let result = loop {
            tokio::select! {
                accepted = accept_with_backoff(&listener) => {
                    match accepted {
                        Ok((socket, peer)) => self.spawn_session(socket, peer, &factory),
                        Err(err) => break Err(err),
                    }
                }
                _ = shutdown_rx.recv() => break Ok(()),
            }
        };

        self.0.listeners.lock().unwrap().remove(&listener_id);
        result
    }

    fn spawn_session(&self, socket: TcpStream, peer: SocketAddr, factory: &Arc<dyn HandlerFactory>) {
        let Some(handler) = factory.make_handler(peer) else {
            debug!(%peer, "embedder declined connection");
            return;
        };

        let id = self.0.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let notify_shutdown = self.0.notify_shutdown.subscribe();

        self.0.join.inc();
        let server = self.clone();

        let session = Session::new(
            id,
            peer,
            socket,
            handler,
            notify_shutdown,
            self.0.read_timeout,
            self.0.write_timeout,
            self.0.debug_sink.clone(),
        );

        tokio::spawn(async move {
            session.run().await;
            server.0.join.dec();
        });
    }

    /// Close every registered listener (which unblocks their accept loops)
    /// and signal every active session to begin closing, then wait until
    /// every one of them has finished its close protocol.
    ///
    /// Idempotent: calling this more than once is harmless, though only the
    /// first call's broadcast send has any effect.
    pub async fn shutdown(&self) {
        self.0.listeners.lock().unwrap().clear();
        // Ignored: `send` only errors when there are no receivers, which is
        // a legitimate state (no active sessions, no serve() call running).
        let _ = self.0.notify_shutdown.send(());
        self.0.join.wait_zero().await;
    }
}

/// An empty address binds `0.0.0.0` on the default LDAP port; anything else
/// is passed through to `TcpListener::bind` unchanged.
fn resolve_listen_address(address: &str) -> String {
    if address.is_empty() {
        format!("0.0.0.0:{DEFAULT_PORT}")
    } else {
        address.to_string()
    }
}

async fn accept_with_backoff(listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
    retry_with_backoff(|| listener.accept()).await.map_err(Error::from)
}

/// Retries a fallible async operation, pausing `ACCEPT_RETRY_DELAY` between
/// attempts, up to `MAX_ACCEPT_RETRIES` times before giving up. Generic over
/// the operation so the retry/give-up logic can be exercised in tests
/// without a real listener.
async fn retry_with_backoff<T, F, Fut>(mut attempt: F) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut retries = 0u32;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                retries += 1;
                if retries > MAX_ACCEPT_RETRIES {
                    error!(%err, retries, "accept failed too many times, giving up");
                    return Err(err);
                }
                warn!(%err, retries, "accept failed, retrying after backoff");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Builds a [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    handler_factory: Option<Arc<dyn HandlerFactory>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    debug_sink: Option<DebugSink>,
}

impl ServerBuilder {
    /// Set the connection-construction callback invoked for each accepted
    /// connection. Required: `serve`/`listen_and_serve` fail fast with
    /// `Error::MissingHandlerFactory` if this was never set.
    pub fn connection_handler<F>(mut self, factory: F) -> Self
    where
        F: HandlerFactory,
    {
        self.handler_factory = Some(Arc::new(factory));
        self
    }

    /// Per-read deadline applied to every session's Frame Reader. Unset by
    /// default (reads never time out on their own).
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Per-write deadline applied to every session's Writer Task.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Install a sink that receives a human-readable line for select
    /// lifecycle events (currently: session start and session close), in
    /// addition to the structured `tracing` events emitted unconditionally.
    pub fn debug_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.debug_sink = Some(Arc::new(sink));
        self
    }

    pub fn build(self) -> Server {
        let (notify_shutdown, _) = broadcast::channel(1);

        Server(Arc::new(Inner {
            handler_factory: self.handler_factory,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            debug_sink: self.debug_sink,
            notify_shutdown,
            listeners: Mutex::new(HashSet::new()),
            next_listener_id: AtomicU64::new(0),
            next_connection_id: AtomicU64::new(0),
            join: JoinCounter::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;

    #[tokio::test]
    async fn serve_without_connection_handler_fails_fast() {
        let server = Server::builder().build();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let err = server.serve(listener).await.unwrap_err();
        assert!(matches!(err, Error::MissingHandlerFactory));
    }

    #[tokio::test]
    async fn shutdown_with_no_sessions_returns_immediately() {
        struct Unused;
        #[async_trait::async_trait]
        impl Handler for Unused {
            async fn serve(
                &self,
                _ctx: crate::handler::Context,
                _response: crate::outbound::ResponseWriter,
                _message: crate::handler::Message,
            ) {
            }
        }

        let server = Server::builder()
            .connection_handler(|_peer: SocketAddr| Some(Arc::new(Unused) as Arc<dyn Handler>))
            .build();

        server.shutdown().await;
    }

    #[tokio::test]
    async fn serve_exits_once_shutdown_is_signalled() {
        struct Unused;
        #[async_trait::async_trait]
        impl Handler for Unused {
            async fn serve(
                &self,
                _ctx: crate::handler::Context,
                _response: crate::outbound::ResponseWriter,
                _message: crate::handler::Message,
            ) {
            }
        }

        let server = Server::builder()
            .connection_handler(|_peer: SocketAddr| Some(Arc::new(Unused) as Arc<dyn Handler>))
            .build();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let serve_server = server.clone();
        let serve_task = tokio::spawn(async move { serve_server.serve(listener).await });

        // Give the accept loop a chance to start before signalling shutdown.
        tokio::task::yield_now().await;
        server.shutdown().await;

        assert!(serve_task.await.unwrap().is_ok());
        assert!(server.0.listeners.lock().unwrap().is_empty());
    }

    #[test]
    fn default_port_selection_resolves_empty_address_to_the_default_port() {
        assert_eq!(resolve_listen_address(""), format!("0.0.0.0:{DEFAULT_PORT}"));
        assert_eq!(resolve_listen_address("127.0.0.1:1234"), "127.0.0.1:1234");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_accept_failure_is_retried_after_a_backoff_pause() {
        let attempts = AtomicU64::new(0);

        let result = retry_with_backoff(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(io::Error::new(io::ErrorKind::Other, "transient"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_gives_up_after_max_retries() {
        let attempts = AtomicU64::new(0);

        let result: io::Result<()> = retry_with_backoff(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(io::Error::new(io::ErrorKind::Other, "permanent")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_ACCEPT_RETRIES as u64 + 1);
    }
}
