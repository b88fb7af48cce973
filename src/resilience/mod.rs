//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Accept loop:
//!     → temporary accept error
//!     → backoff.rs (AcceptBackoff: 5ms, doubling, capped at 1s)
//!     → sleep, retry; reset on next success
//!
//! Graceful shutdown:
//!     → poll tracking table
//!     → backoff.rs (calculate_backoff: jittered poll interval)
//! ```
//!
//! # Design Decisions
//! - Accept backoff is deterministic so its schedule is testable
//! - Poll intervals carry jitter so many servers do not poll in lockstep

pub mod backoff;
