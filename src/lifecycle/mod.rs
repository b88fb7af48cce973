//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Stop accepting → drain token cancelled → poll tracking table
//!         → empty: done
//!         → deadline passed: forceful cancellation
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has a deadline: forced cancellation once it passes

pub mod shutdown;
pub mod signals;

pub use shutdown::wait_until_drained;
pub use signals::shutdown_signal;
