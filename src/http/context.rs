//! Cancellation context carried by every connection and request.
//!
//! The server owns a root token. Each listener derives a base context from
//! it and each connection a child of that, so cancelling the root reaches
//! every in-flight read, write and handler that watches its context.

use std::net::SocketAddr;
use std::sync::Arc;

use http::Extensions;
use tokio_util::sync::CancellationToken;

use crate::net::ConnInfo;

/// Cancellation plus typed values attached by server hooks.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    extensions: Extensions,
}

impl Context {
    /// Root a context at `cancel`. Only the server creates roots, so every
    /// context a hook can see descends from the server's token.
    pub(crate) fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            extensions: Extensions::new(),
        }
    }

    /// A context cancelled with this one (or on its own), sharing values.
    pub(crate) fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            extensions: self.extensions.clone(),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Attach a value, replacing any previous value of the same type.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.extensions.insert(value)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }
}

/// Builds the base context for a listener from the listener's address.
pub type BaseContextHook = Arc<dyn Fn(Option<SocketAddr>, Context) -> Context + Send + Sync>;

/// Rewrites the context of a freshly accepted connection.
pub type ConnContextHook = Arc<dyn Fn(Context, &ConnInfo) -> Context + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Tenant(&'static str);

    #[test]
    fn child_inherits_values_and_cancellation() {
        let root = CancellationToken::new();
        let mut base = Context::with_token(root.clone());
        base.insert(Tenant("blue"));

        let child = base.child();
        assert_eq!(child.get::<Tenant>(), Some(&Tenant("blue")));
        assert!(!child.is_cancelled());

        root.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancelling_child_leaves_parent() {
        let base = Context::with_token(CancellationToken::new());
        let child = base.child();
        child.cancellation().cancel();
        assert!(!base.is_cancelled());
    }
}
