//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Track connection state (New → Active ⇄ Idle → Closed, or Hijacked)
//! - Generate unique connection IDs for tracing
//! - Keep the table of live connections for shutdown signaling

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, no request bytes read yet.
    New = 0,
    /// Reading a request or writing its response.
    Active = 1,
    /// Keep-alive, waiting for the next request.
    Idle = 2,
    /// A handler took over the raw transport.
    Hijacked = 3,
    /// Transport released.
    Closed = 4,
}

impl From<u8> for ConnState {
    fn from(val: u8) -> Self {
        match val {
            0 => ConnState::New,
            1 => ConnState::Active,
            2 => ConnState::Idle,
            3 => ConnState::Hijacked,
            _ => ConnState::Closed,
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::New => "new",
            ConnState::Active => "active",
            ConnState::Idle => "idle",
            ConnState::Hijacked => "hijacked",
            ConnState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Static facts about an accepted connection.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
}

#[derive(Debug)]
struct TrackedConn {
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
}

type Table = HashMap<ConnectionId, TrackedConn>;

/// Tracks live connections for graceful and forceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    table: Arc<Mutex<Table>>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new connection in state `New`. The returned guard removes it
    /// from the table when dropped.
    pub fn track(&self, info: &ConnInfo, cancel: CancellationToken) -> ConnectionGuard {
        let state = Arc::new(AtomicU8::new(ConnState::New as u8));
        self.lock().insert(
            info.id,
            TrackedConn {
                state: Arc::clone(&state),
                cancel,
            },
        );
        metrics::connection_opened();
        ConnectionGuard {
            tracker: self.clone(),
            id: info.id,
            state,
            tracked: true,
        }
    }

    /// Current number of tracked connections.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// True when no connection is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of tracked connections in `state`.
    pub fn count_in(&self, state: ConnState) -> usize {
        self.lock()
            .values()
            .filter(|c| ConnState::from(c.state.load(Ordering::Acquire)) == state)
            .count()
    }

    /// True when every tracked connection is idle or closed.
    pub fn is_quiescent(&self) -> bool {
        self.lock().values().all(|c| {
            matches!(
                ConnState::from(c.state.load(Ordering::Acquire)),
                ConnState::Idle | ConnState::Closed
            )
        })
    }

    /// Cancel every tracked connection's context.
    pub fn cancel_all(&self) -> usize {
        let table = self.lock();
        for conn in table.values() {
            conn.cancel.cancel();
        }
        table.len()
    }

    fn untrack(&self, id: ConnectionId) {
        if self.lock().remove(&id).is_some() {
            metrics::connection_closed();
        }
    }
}

/// Guard that tracks a connection's lifetime.
/// Removes the connection from the table when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
    state: Arc<AtomicU8>,
    tracked: bool,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::Acquire))
    }

    /// Record a state transition.
    pub fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Stop tracking without closing: ownership of the transport has left
    /// the server.
    pub fn detach(&mut self) {
        self.set_state(ConnState::Hijacked);
        if self.tracked {
            self.tracker.untrack(self.id);
            self.tracked = false;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracked {
            self.set_state(ConnState::Closed);
            self.tracker.untrack(self.id);
            tracing::trace!(connection_id = %self.id, "Connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ConnInfo {
        ConnInfo {
            id: ConnectionId::new(),
            peer_addr: "127.0.0.1:40000".parse().unwrap(),
            local_addr: None,
        }
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ConnState::New,
            ConnState::Active,
            ConnState::Idle,
            ConnState::Hijacked,
            ConnState::Closed,
        ] {
            assert_eq!(ConnState::from(state as u8), state);
        }
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(&info(), CancellationToken::new());
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track(&info(), CancellationToken::new());
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn quiescence_follows_states() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track(&info(), CancellationToken::new());
        assert!(!tracker.is_quiescent());

        guard.set_state(ConnState::Active);
        assert_eq!(tracker.count_in(ConnState::Active), 1);
        assert!(!tracker.is_quiescent());

        guard.set_state(ConnState::Idle);
        assert!(tracker.is_quiescent());
    }

    #[test]
    fn detach_removes_without_closing() {
        let tracker = ConnectionTracker::new();
        let mut guard = tracker.track(&info(), CancellationToken::new());
        guard.detach();
        assert!(tracker.is_empty());
        assert_eq!(guard.state(), ConnState::Hijacked);
        drop(guard);
        assert!(tracker.is_empty());
    }

    #[test]
    fn cancel_all_signals_every_connection() {
        let tracker = ConnectionTracker::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let _ga = tracker.track(&info(), a.clone());
        let _gb = tracker.track(&info(), b.clone());

        assert_eq!(tracker.cancel_all(), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
