//! Per-connection request/response loop.
//!
//! # Responsibilities
//! - Decode requests one at a time and dispatch them in order
//! - Apply idle, header, read and write deadlines
//! - Answer malformed input and handler panics with error responses
//! - Report state transitions to the tracker and the state hook
//!
//! # Design Decisions
//! - Responses are strictly ordered: the next request is not decoded until
//!   the previous response is finished
//! - Recoverable malformed input keeps the connection; anything that loses
//!   framing closes it
//! - A handler that hijacks the transport ends the loop without closing

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use http::{HeaderValue, StatusCode, Version};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::http::codec::{body_length, parse_head, DecodeError, HeadScanner};
use crate::http::context::Context;
use crate::http::dispatch::Dispatcher;
use crate::http::request::{Request, X_REQUEST_ID};
use crate::http::response::{error, ResponseWriter};
use crate::http::transport::Transport;
use crate::net::{BoxedIo, ConnInfo, ConnState, ConnectionGuard};
use crate::observability::metrics;

const LINGER: Duration = Duration::from_millis(500);

/// Observes every connection state transition.
pub type ConnStateHook = Arc<dyn Fn(&ConnInfo, ConnState) + Send + Sync>;

/// Per-connection limits, resolved from configuration once.
#[derive(Debug, Clone)]
pub(crate) struct Limits {
    pub read_header: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
    pub idle: Option<Duration>,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    pub keep_alive: bool,
}

impl Limits {
    pub(crate) fn from_config(config: &ServerConfig) -> Self {
        Self {
            read_header: config.timeouts.read_header(),
            read: config.timeouts.read(),
            write: config.timeouts.write(),
            idle: config.timeouts.idle(),
            max_header_bytes: config.http.max_header_bytes,
            max_body_bytes: config.http.max_body_bytes,
            keep_alive: config.http.keep_alive,
        }
    }
}

/// State shared by every connection of one server.
pub(crate) struct ConnShared {
    pub dispatcher: Dispatcher,
    pub limits: Limits,
    pub state_hook: Option<ConnStateHook>,
    /// Cancelled when graceful shutdown starts: idle connections close and
    /// active ones stop keeping alive.
    pub drain: CancellationToken,
}

enum Outcome {
    KeepAlive,
    Close,
    Hijacked,
}

pub(crate) struct Connection {
    info: ConnInfo,
    transport: Option<Transport>,
    guard: ConnectionGuard,
    context: Context,
    shared: Arc<ConnShared>,
    /// Set after rejecting input that may still be arriving.
    linger: bool,
}

impl Connection {
    pub(crate) fn new(
        info: ConnInfo,
        io: BoxedIo,
        guard: ConnectionGuard,
        context: Context,
        shared: Arc<ConnShared>,
    ) -> Self {
        let transport = Transport::new(io, context.cancellation().clone());
        Self {
            info,
            transport: Some(transport),
            guard,
            context,
            shared,
            linger: false,
        }
    }

    fn set_state(&self, state: ConnState) {
        if self.guard.state() == state {
            return;
        }
        self.guard.set_state(state);
        tracing::trace!(state = %state, "Connection state changed");
        if let Some(hook) = &self.shared.state_hook {
            hook(&self.info, state);
        }
    }

    pub(crate) async fn run(mut self) {
        if let Some(hook) = &self.shared.state_hook {
            hook(&self.info, ConnState::New);
        }

        let mut served: u64 = 0;
        loop {
            let request = match self.read_request().await {
                Ok(request) => request,
                Err(err) => {
                    if self.answer_decode_error(err).await {
                        continue;
                    }
                    break;
                }
            };
            served += 1;

            match self.serve_request(request).await {
                Outcome::KeepAlive => self.set_state(ConnState::Idle),
                Outcome::Close => break,
                Outcome::Hijacked => {
                    self.guard.detach();
                    if let Some(hook) = &self.shared.state_hook {
                        hook(&self.info, ConnState::Hijacked);
                    }
                    tracing::debug!(requests = served, "Connection hijacked");
                    return;
                }
            }
        }

        if let Some(transport) = self.transport.as_mut() {
            transport.shutdown().await;
            if self.linger {
                transport.discard_input(Instant::now() + LINGER).await;
            }
        }
        self.context.cancellation().cancel();
        self.set_state(ConnState::Closed);
        tracing::debug!(requests = served, "Connection closed");
    }

    /// Read and decode the next request.
    async fn read_request(&mut self) -> Result<Request, DecodeError> {
        let limits = &self.shared.limits;
        let Some(transport) = self.transport.as_mut() else {
            return Err(DecodeError::Closed);
        };

        // Wait for the first byte. Graceful shutdown may close us here.
        if transport.read_buf.is_empty() {
            let deadline = limits.idle.map(|d| Instant::now() + d);
            let n = transport
                .read_more(deadline, Some(&self.shared.drain))
                .await?;
            if n == 0 {
                return Err(DecodeError::Closed);
            }
        }
        self.guard.set_state(ConnState::Active);
        if let Some(hook) = &self.shared.state_hook {
            hook(&self.info, ConnState::Active);
        }

        let started = Instant::now();
        let read_deadline = limits.read.map(|d| started + d);
        let header_deadline = match (limits.read_header.map(|d| started + d), read_deadline) {
            (Some(h), Some(r)) => Some(h.min(r)),
            (h, r) => h.or(r),
        };

        let mut scanner = HeadScanner::default();
        let head_end = loop {
            if let Some(end) = scanner.find(&transport.read_buf) {
                if end > limits.max_header_bytes {
                    return Err(header_too_large());
                }
                break end;
            }
            if transport.read_buf.len() > limits.max_header_bytes {
                return Err(header_too_large());
            }
            if transport.read_more(header_deadline, None).await? == 0 {
                return Err(truncated());
            }
        };

        let block = transport.read_buf.split_to(head_end);
        let head = parse_head(&block)?;
        let length = body_length(&head)?;
        if length > limits.max_body_bytes {
            return Err(DecodeError::fatal(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large",
            ));
        }

        while transport.read_buf.len() < length {
            if transport.read_more(read_deadline, None).await? == 0 {
                return Err(truncated());
            }
        }
        let body = transport.read_buf.split_to(length).freeze();

        Request::from_parts(head, body, self.info.peer_addr, self.context.child())
    }

    /// Respond to a decode failure. Returns true if the connection continues.
    async fn answer_decode_error(&mut self, err: DecodeError) -> bool {
        let (status, reason, recoverable) = match err {
            DecodeError::Malformed {
                status,
                reason,
                recoverable,
            } => (status, reason, recoverable),
            DecodeError::Closed => return false,
            other => {
                metrics::decode_error(other.kind());
                tracing::debug!(error = %other, "Connection ended while reading request");
                return false;
            }
        };

        metrics::decode_error("malformed");
        tracing::debug!(status = status.as_u16(), reason, "Malformed request");

        let keep = recoverable && self.shared.limits.keep_alive && !self.shared.drain.is_cancelled();
        let method = http::Method::GET;
        let mut w = ResponseWriter::new(&mut self.transport, Version::HTTP_11, &method);
        if let Some(write) = self.shared.limits.write {
            set_write_deadline(&mut w, write);
        }
        if !keep {
            w.close_after();
        }
        error(&mut w, reason, status);
        let finished = w.finish().await;
        let keep = keep && finished.is_ok() && w.keep_alive();
        self.linger = !recoverable;
        if keep {
            self.set_state(ConnState::Idle);
        }
        keep
    }

    async fn serve_request(&mut self, req: Request) -> Outcome {
        let span = tracing::debug_span!(
            "request",
            request_id = %req.id(),
            method = %req.method(),
            path = req.path(),
        );
        let start = std::time::Instant::now();
        let shared = Arc::clone(&self.shared);

        let keep_alive = shared.limits.keep_alive && !req.wants_close() && !shared.drain.is_cancelled();

        let outcome = async {
            let mut w = ResponseWriter::new(&mut self.transport, req.version(), req.method());
            if let Ok(id) = HeaderValue::from_str(req.id().as_str()) {
                w.headers_mut().insert(X_REQUEST_ID, id);
            }
            if let Some(write) = shared.limits.write {
                set_write_deadline(&mut w, write);
            }
            if !keep_alive {
                w.close_after();
            }

            let served = AssertUnwindSafe(shared.dispatcher.dispatch(&mut w, &req))
                .catch_unwind()
                .await;

            if let Err(panic) = served {
                let message = panic_message(&*panic);
                tracing::error!(panic = message, "Handler panicked");
                if w.reset() {
                    error(&mut w, "Internal Server Error", StatusCode::INTERNAL_SERVER_ERROR);
                } else {
                    w.abort();
                }
                w.close_after();
            }

            if w.is_hijacked() {
                return Outcome::Hijacked;
            }

            let status = w.status();
            let finished = w.finish().await;
            metrics::record_request(status.as_u16(), start);
            tracing::debug!(
                status = status.as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Request completed"
            );

            match finished {
                Ok(()) if w.keep_alive() => Outcome::KeepAlive,
                Ok(()) => Outcome::Close,
                Err(err) => {
                    log_write_error(&err);
                    Outcome::Close
                }
            }
        }
        .instrument(span)
        .await;

        req.context().cancellation().cancel();
        outcome
    }
}

fn set_write_deadline(w: &mut ResponseWriter<'_>, write: Duration) {
    w.set_write_deadline(Some(Instant::now() + write));
}

fn header_too_large() -> DecodeError {
    DecodeError::fatal(
        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        "request header too large",
    )
}

fn truncated() -> DecodeError {
    DecodeError::Truncated(io::Error::from(io::ErrorKind::UnexpectedEof))
}

fn log_write_error(err: &io::Error) {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted => {
            tracing::debug!(error = %err, "Response write aborted")
        }
        _ => tracing::warn!(error = %err, "Response write failed"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
