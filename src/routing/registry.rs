//! Pattern registry: pattern → handler lookup.
//!
//! # Responsibilities
//! - Store registered routes
//! - Resolve (path, host) to the most specific route
//! - Serve requests as a top-level handler (redirects, 404)
//!
//! # Design Decisions
//! - Readers load an immutable snapshot (`ArcSwap`), never a half-built table
//! - Writers clone the current table, insert, and publish; they are
//!   serialized by a mutex and only expected at startup
//! - Exact keys in a `HashMap`; subtree patterns in a `Vec` kept sorted by
//!   descending length via binary-search insertion
//! - Exact match always beats any subtree match

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::{Method, StatusCode};

use crate::http::handler::{asterisk_target, not_found, Handler, HandlerFn, RedirectHandler, SharedHandler};
use crate::http::request::Request;
use crate::http::response::ResponseWriter;
use crate::routing::pattern::{clean_path, normalize_host, Pattern};
use crate::routing::RegistrationError;

/// A registered route.
pub struct RouteEntry {
    pattern: Pattern,
    handler: SharedHandler,
}

impl RouteEntry {
    /// The pattern this entry was registered under.
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }
}

/// Result of a successful lookup.
#[derive(Clone)]
pub struct RouteMatch {
    /// Handler bound to the matched pattern.
    pub handler: SharedHandler,
    /// The matched pattern, normalized.
    pub pattern: String,
}

impl fmt::Debug for RouteMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteMatch")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Handler chosen for a request, including synthesized redirects and 404s.
#[derive(Clone)]
pub struct Resolved {
    pub handler: SharedHandler,
    /// Matched pattern; `None` for redirects and not-found.
    pub pattern: Option<String>,
}

/// One published version of the routing table.
#[derive(Clone, Default)]
struct RouteTable {
    exact: HashMap<String, Arc<RouteEntry>>,
    /// Subtree entries, longest pattern first, ties in insertion order.
    prefixes: Vec<Arc<RouteEntry>>,
    /// Set once any host-qualified pattern is registered.
    hosts: bool,
}

impl RouteTable {
    fn insert(&mut self, entry: RouteEntry) {
        let entry = Arc::new(entry);
        if entry.pattern.is_prefix() {
            let len = entry.pattern.specificity();
            let at = self
                .prefixes
                .partition_point(|e| e.pattern.specificity() >= len);
            self.prefixes.insert(at, Arc::clone(&entry));
        }
        if entry.pattern.is_host_qualified() {
            self.hosts = true;
        }
        self.exact.insert(entry.pattern.as_str().to_string(), entry);
    }

    fn find(&self, path: &str, host: &str) -> Option<&Arc<RouteEntry>> {
        if self.hosts && !host.is_empty() {
            if let Some(entry) = self.exact.get(&format!("{host}{path}")) {
                return Some(entry);
            }
        }
        if let Some(entry) = self.exact.get(path) {
            return Some(entry);
        }

        let idx = self
            .prefixes
            .iter()
            .position(|e| e.pattern.covers(path, host))?;
        let entry = &self.prefixes[idx];

        // Host equality is a hard filter, so two host-qualified subtrees of
        // equal length can never both cover the same request.
        debug_assert!(
            !entry.pattern.is_host_qualified()
                || !self.prefixes[idx + 1..]
                    .iter()
                    .take_while(|e| e.pattern.specificity() == entry.pattern.specificity())
                    .any(|e| e.pattern.is_host_qualified() && e.pattern.covers(path, host)),
            "ambiguous host-qualified match for {host}{path}"
        );

        Some(entry)
    }

    fn contains(&self, path: &str, host: &str) -> bool {
        (self.hosts && self.exact.contains_key(&format!("{host}{path}")))
            || self.exact.contains_key(path)
    }
}

/// Maps request patterns to handlers with longest-match semantics.
///
/// A fresh `Registry` is cheap to build; servers take one by `Arc` so tests
/// can use isolated instances.
pub struct Registry {
    table: ArcSwap<RouteTable>,
    write_lock: Mutex<()>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Bind `handler` to `pattern`.
    ///
    /// On error the registry is left exactly as it was.
    pub fn register(
        &self,
        pattern: &str,
        handler: Option<SharedHandler>,
    ) -> Result<(), RegistrationError> {
        if pattern.is_empty() {
            return Err(RegistrationError::EmptyPattern);
        }
        let handler = handler.ok_or(RegistrationError::NilHandler)?;
        let pattern = Pattern::parse(pattern)?;

        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.table.load_full();
        if current.exact.contains_key(pattern.as_str()) {
            return Err(RegistrationError::DuplicatePattern(pattern.as_str().to_string()));
        }

        let mut next = RouteTable::clone(&current);
        tracing::debug!(
            pattern = pattern.as_str(),
            prefix = pattern.is_prefix(),
            host_qualified = pattern.is_host_qualified(),
            "Route registered"
        );
        next.insert(RouteEntry { pattern, handler });
        self.table.store(Arc::new(next));
        Ok(())
    }

    /// Register a stateful handler object.
    pub fn handle<H: Handler>(&self, pattern: &str, handler: H) -> Result<(), RegistrationError> {
        self.register(pattern, Some(Arc::new(handler)))
    }

    /// Register a closure handler.
    pub fn handle_fn<F>(&self, pattern: &str, f: F) -> Result<(), RegistrationError>
    where
        F: Fn(&mut ResponseWriter<'_>, &Request) + Send + Sync + 'static,
    {
        self.handle(pattern, HandlerFn::new(f))
    }

    /// Find the route for `path` on `host`.
    ///
    /// `host` may carry a port and any letter case; it is normalized first.
    pub fn lookup(&self, path: &str, host: &str) -> Option<RouteMatch> {
        let host = normalize_host(host);
        let table = self.table.load();
        table.find(path, &host).map(|entry| RouteMatch {
            handler: Arc::clone(&entry.handler),
            pattern: entry.pattern.as_str().to_string(),
        })
    }

    /// Choose the handler for a request.
    ///
    /// Besides plain lookup this issues `301` redirects for unclean paths
    /// and for subtree roots requested without their trailing slash. A `*`
    /// target gets `400`.
    pub fn resolve(&self, req: &Request) -> Resolved {
        if req.target() == "*" {
            return Resolved {
                handler: asterisk_target(),
                pattern: None,
            };
        }
        if *req.method() == Method::CONNECT {
            return self.resolve_path(req.path(), req.host());
        }

        let host = normalize_host(req.host());
        let path = clean_path(req.path());

        if self.should_redirect_to_slash(&path, &host) {
            let target = with_query(&format!("{path}/"), req.query());
            return redirect(target);
        }

        if path != req.path() {
            return redirect(with_query(&path, req.query()));
        }

        self.resolve_path(&path, &host)
    }

    fn resolve_path(&self, path: &str, host: &str) -> Resolved {
        match self.lookup(path, host) {
            Some(m) => Resolved {
                handler: m.handler,
                pattern: Some(m.pattern),
            },
            None => Resolved {
                handler: not_found(),
                pattern: None,
            },
        }
    }

    fn should_redirect_to_slash(&self, path: &str, host: &str) -> bool {
        if path.ends_with('/') {
            return false;
        }
        let table = self.table.load();
        !table.contains(path, host) && table.contains(&format!("{path}/"), host)
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.table.load().exact.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered patterns, sorted.
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.table.load().exact.keys().cloned().collect();
        patterns.sort();
        patterns
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("patterns", &self.patterns())
            .finish()
    }
}

#[async_trait]
impl Handler for Registry {
    async fn serve(&self, w: &mut ResponseWriter<'_>, req: &Request) {
        let resolved = self.resolve(req);
        tracing::debug!(
            path = req.path(),
            pattern = resolved.pattern.as_deref().unwrap_or(""),
            "Route resolved"
        );
        resolved.handler.serve(w, req).await;
    }
}

fn redirect(location: String) -> Resolved {
    Resolved {
        handler: Arc::new(RedirectHandler::new(location, StatusCode::MOVED_PERMANENTLY)),
        pattern: None,
    }
}

fn with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_string(),
    }
}
