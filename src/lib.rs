//! HTTP/1.1 server core: a longest-match pattern registry and a listener
//! accept loop with backoff, connection tracking and graceful shutdown.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod routing;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use crate::config::ServerConfig;
pub use crate::http::{Handler, Request, ResponseWriter, Server, ServerBuilder, ServerError, ShutdownError};
pub use crate::routing::{RegistrationError, Registry};
