//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Listener
//!     → server.rs (accept loop, backoff, connection tracking)
//!     → conn.rs (per-connection loop, deadlines, keep-alive)
//!         → codec.rs (parse head, frame body)
//!         → request.rs (target split, host, request ID)
//!         → dispatch.rs (OPTIONS *, configured handler, registry)
//!         → response.rs (buffer, frame, flush, hijack)
//!     → Send to client
//! ```
//!
//! # Design Decisions
//! - Handlers see a decoded `Request` and a `ResponseWriter`, never the
//!   socket, unless they hijack it
//! - Every suspension point observes the connection's cancellation token

pub mod codec;
pub mod conn;
pub mod context;
pub(crate) mod dispatch;
pub mod handler;
pub mod request;
pub mod response;
pub mod server;
pub(crate) mod transport;

pub use codec::DecodeError;
pub use conn::ConnStateHook;
pub use context::{BaseContextHook, ConnContextHook, Context};
pub use handler::{handler_fn, not_found, GlobalOptions, Handler, HandlerFn, RedirectHandler, SharedHandler};
pub use request::{Request, RequestId, X_REQUEST_ID};
pub use response::{error, HijackError, Hijacked, ResponseWriter};
pub use server::{Server, ServerBuilder, ServerError, ShutdownError};
