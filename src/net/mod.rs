//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Transport listener
//!     → listener.rs (Listener trait, accept error classification)
//!     → http::server (accept loop, backoff, spawn per connection)
//!     → connection.rs (ids, state machine, tracking table)
//!     → http::conn (request/response cycles)
//!
//! Connection States:
//!     New → Active ⇄ Idle → Closed
//!              └──→ Hijacked
//! ```
//!
//! # Design Decisions
//! - The accept loop only depends on the `Listener` trait, so tests can
//!   inject scripted failures
//! - Each connection tracked for graceful shutdown
//! - Hijacked connections leave the tracking table immediately

pub mod connection;
pub mod listener;

pub use connection::{ConnInfo, ConnState, ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{is_temporary, BoxedIo, Io, Listener};
