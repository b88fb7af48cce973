//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Registration (startup):
//!     pattern string
//!     → pattern.rs (validate, split host/path, classify exact vs subtree)
//!     → registry.rs (exact map + length-ordered subtree list, published atomically)
//!
//! Incoming Request (host, path)
//!     → registry.rs (clean path, redirect if needed)
//!     → exact probe (host+path, then path)
//!     → subtree scan, longest pattern first
//!     → matched handler, or 404
//! ```
//!
//! # Design Decisions
//! - Exact match always wins over a subtree match
//! - Longest subtree wins; ties keep registration order
//! - Host-qualified patterns only match their host; bare patterns match any
//! - Registration errors are returned, never fatal

pub mod pattern;
pub mod registry;

pub use pattern::Pattern;
pub use registry::{Registry, Resolved, RouteMatch};

use thiserror::Error;

/// Errors returned by [`Registry::register`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("pattern must not be empty")]
    EmptyPattern,

    #[error("handler must not be absent")]
    NilHandler,

    #[error("pattern already registered: {0}")]
    DuplicatePattern(String),

    #[error("host-qualified pattern has no path: {0}")]
    MissingPath(String),
}
