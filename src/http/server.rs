//! Listener accept loop and server control.
//!
//! # Responsibilities
//! - Accept connections from any number of listeners
//! - Derive each connection's context and spawn its task
//! - Retry temporary accept failures with backoff
//! - Track listeners and connections for shutdown
//!
//! # Design Decisions
//! - One root cancellation token per server; every listener and connection
//!   context descends from it, so forceful shutdown is a single cancel
//! - Closing a listener means the accept loop stops polling it and drops it
//! - Connection limit enforced with a semaphore acquired before `accept`

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::http::conn::{ConnShared, ConnStateHook, Connection, Limits};
use crate::http::context::{BaseContextHook, ConnContextHook, Context};
use crate::http::dispatch::Dispatcher;
use crate::http::handler::SharedHandler;
use crate::lifecycle::wait_until_drained;
use crate::net::{is_temporary, ConnInfo, ConnState, ConnectionId, ConnectionTracker, Listener};
use crate::observability::metrics;
use crate::resilience::backoff::AcceptBackoff;
use crate::routing::Registry;

/// Why `serve` returned.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The server was shut down.
    #[error("server closed")]
    Closed,

    /// The listener failed with a non-temporary error.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShutdownError {
    #[error("shutdown already in progress")]
    InProgress,

    #[error("shutdown deadline exceeded; remaining connections were cancelled")]
    DeadlineExceeded,
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    registry: Option<Arc<Registry>>,
    handler: Option<SharedHandler>,
    base_context: Option<BaseContextHook>,
    conn_context: Option<ConnContextHook>,
    conn_state_hook: Option<ConnStateHook>,
}

impl ServerBuilder {
    /// Default registry used when no top-level handler is configured.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Top-level handler; bypasses the registry.
    pub fn handler(mut self, handler: SharedHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build each listener's base context.
    pub fn base_context<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<SocketAddr>, Context) -> Context + Send + Sync + 'static,
    {
        self.base_context = Some(Arc::new(hook));
        self
    }

    /// Rewrite each accepted connection's context.
    pub fn conn_context<F>(mut self, hook: F) -> Self
    where
        F: Fn(Context, &ConnInfo) -> Context + Send + Sync + 'static,
    {
        self.conn_context = Some(Arc::new(hook));
        self
    }

    /// Observe connection state transitions.
    pub fn conn_state_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ConnInfo, ConnState) + Send + Sync + 'static,
    {
        self.conn_state_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Server {
        let registry = self.registry.unwrap_or_default();
        let default_handler: SharedHandler = registry.clone();
        let dispatcher = Dispatcher::new(
            self.handler,
            default_handler,
            self.config.http.disable_general_options_handler,
        );

        let root = CancellationToken::new();
        let shared = Arc::new(ConnShared {
            dispatcher,
            limits: Limits::from_config(&self.config),
            state_hook: self.conn_state_hook,
            drain: CancellationToken::new(),
        });
        let limit = match self.config.listener.max_connections {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        Server {
            inner: Arc::new(Inner {
                config: self.config,
                registry,
                shared,
                base_context: self.base_context,
                conn_context: self.conn_context,
                root,
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                connections: ConnectionTracker::new(),
                shutting_down: AtomicBool::new(false),
                limit,
            }),
        }
    }
}

struct Inner {
    config: ServerConfig,
    registry: Arc<Registry>,
    shared: Arc<ConnShared>,
    base_context: Option<BaseContextHook>,
    conn_context: Option<ConnContextHook>,
    root: CancellationToken,
    /// Close tokens of listeners currently being served.
    listeners: Mutex<HashMap<u64, CancellationToken>>,
    next_listener_id: AtomicU64,
    connections: ConnectionTracker,
    shutting_down: AtomicBool,
    limit: Option<Arc<Semaphore>>,
}

/// An HTTP/1.1 server. Cheap to clone; clones control the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            registry: None,
            handler: None,
            base_context: None,
            conn_context: None,
            conn_state_hook: None,
        }
    }

    /// Server routing through `registry`.
    pub fn new(config: ServerConfig, registry: Arc<Registry>) -> Self {
        Self::builder(config).registry(registry).build()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Number of connections currently tracked.
    pub fn active_connections(&self) -> usize {
        self.inner.connections.active_count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<u64, CancellationToken>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept connections on `listener` until shutdown or a fatal error.
    ///
    /// Always returns an error: [`ServerError::Closed`] after shutdown,
    /// otherwise the accept error that stopped the loop. The listener is
    /// dropped on return.
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<(), ServerError> {
        let local_addr = listener.local_addr().ok();
        let Some(tracked) = self.track_listener() else {
            return Err(ServerError::Closed);
        };

        let base = Context::with_token(self.inner.root.child_token());
        let base = match &self.inner.base_context {
            Some(hook) => hook(local_addr, base),
            None => base,
        };

        tracing::info!(address = ?local_addr, "Accepting connections");

        let result = self.accept_loop(&listener, local_addr, &base, &tracked.close).await;

        tracing::info!(address = ?local_addr, "Listener closed");
        result
    }

    async fn accept_loop<L: Listener>(
        &self,
        listener: &L,
        local_addr: Option<SocketAddr>,
        base: &Context,
        close: &CancellationToken,
    ) -> Result<(), ServerError> {
        let mut backoff = AcceptBackoff::new();

        loop {
            if self.is_shutting_down() {
                return Err(ServerError::Closed);
            }

            let permit = match &self.inner.limit {
                Some(limit) => tokio::select! {
                    biased;
                    _ = close.cancelled() => return Err(ServerError::Closed),
                    permit = Arc::clone(limit).acquire_owned() => {
                        Some(permit.map_err(|_| ServerError::Closed)?)
                    }
                },
                None => None,
            };

            let accepted = tokio::select! {
                biased;
                _ = close.cancelled() => return Err(ServerError::Closed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((io, peer_addr)) => {
                    backoff.reset();
                    metrics::connection_accepted();
                    self.spawn_connection(Box::new(io), peer_addr, local_addr, base, permit);
                }
                Err(err) => {
                    if self.is_shutting_down() {
                        return Err(ServerError::Closed);
                    }
                    let temporary = is_temporary(&err);
                    metrics::accept_error(temporary);
                    if !temporary {
                        tracing::error!(error = %err, "Accept failed");
                        return Err(ServerError::Accept(err));
                    }

                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Temporary accept error; retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = close.cancelled() => return Err(ServerError::Closed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn spawn_connection(
        &self,
        io: crate::net::BoxedIo,
        peer_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
        base: &Context,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let info = ConnInfo {
            id: ConnectionId::new(),
            peer_addr,
            local_addr,
        };

        let context = match &self.inner.conn_context {
            Some(hook) => hook(base.child(), &info),
            None => base.child(),
        };
        let guard = self
            .inner
            .connections
            .track(&info, context.cancellation().clone());

        let span = tracing::info_span!(
            "conn",
            connection_id = %info.id,
            peer_addr = %peer_addr,
        );
        tracing::debug!(parent: &span, "Connection accepted");

        let connection = Connection::new(info, io, guard, context, Arc::clone(&self.inner.shared));
        tokio::spawn(
            async move {
                let _permit = permit;
                connection.run().await;
            }
            .instrument(span),
        );
    }

    fn track_listener(&self) -> Option<TrackedListener> {
        let mut listeners = self.listeners();
        // Checked under the lock so shutdown cannot miss a new listener.
        if self.is_shutting_down() {
            return None;
        }
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let close = CancellationToken::new();
        listeners.insert(id, close.clone());
        Some(TrackedListener {
            server: self.clone(),
            id,
            close,
        })
    }

    fn close_listeners(&self) -> usize {
        let listeners = self.listeners();
        for close in listeners.values() {
            close.cancel();
        }
        listeners.len()
    }

    fn cancel_everything(&self) {
        self.inner.root.cancel();
        let cancelled = self.inner.connections.cancel_all();
        tracing::info!(connections = cancelled, "Cancelled remaining connections");
    }

    /// Stop the server.
    ///
    /// Every listener is closed. Forceful mode cancels every connection
    /// context and returns at once. Graceful mode lets idle connections
    /// close, waits for active ones to finish, and falls back to forceful
    /// cancellation if `deadline` passes first.
    ///
    /// A second graceful call while one is running returns
    /// [`ShutdownError::InProgress`]; a forceful call always cancels.
    pub async fn shutdown(
        &self,
        graceful: bool,
        deadline: Option<Duration>,
    ) -> Result<(), ShutdownError> {
        let already = {
            let _listeners = self.listeners();
            self.inner.shutting_down.swap(true, Ordering::AcqRel)
        };

        if !graceful {
            tracing::info!("Forceful shutdown");
            self.close_listeners();
            self.cancel_everything();
            return Ok(());
        }
        if already {
            return Err(ShutdownError::InProgress);
        }

        let listeners = self.close_listeners();
        self.inner.shared.drain.cancel();
        tracing::info!(
            listeners,
            connections = self.active_connections(),
            "Graceful shutdown started"
        );

        let deadline = deadline.map(|d| Instant::now() + d);
        if wait_until_drained(&self.inner.connections, deadline).await {
            tracing::info!("All connections drained");
            Ok(())
        } else {
            self.cancel_everything();
            Err(ShutdownError::DeadlineExceeded)
        }
    }
}

/// Removes a listener from the table when its accept loop ends.
struct TrackedListener {
    server: Server,
    id: u64,
    close: CancellationToken,
}

impl Drop for TrackedListener {
    fn drop(&mut self) {
        self.server.listeners().remove(&self.id);
    }
}
