//! Pattern parsing and structural matching.
//!
//! # Responsibilities
//! - Validate registration patterns
//! - Split host-qualified patterns into host and path
//! - Decide whether a pattern covers a request (exact or subtree)
//!
//! # Design Decisions
//! - Host matching is case-insensitive (hosts are lowercased on both sides)
//! - Path matching is case-sensitive
//! - A pattern ending in `/` names a subtree; anything else is exact
//! - No regex, no wildcards: matching is a string prefix test

use crate::routing::RegistrationError;

/// Path separator used by every pattern.
pub const SEPARATOR: char = '/';

/// A parsed, immutable registration pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    /// Normalized key used for the exact map (`host` lowercased).
    key: String,
    /// Host part, present only for host-qualified patterns.
    host: Option<String>,
    /// Path part, always starting with `/`.
    path: String,
}

impl Pattern {
    /// Parse a registration pattern.
    pub fn parse(raw: &str) -> Result<Self, RegistrationError> {
        if raw.is_empty() {
            return Err(RegistrationError::EmptyPattern);
        }

        if raw.starts_with(SEPARATOR) {
            return Ok(Self {
                key: raw.to_string(),
                host: None,
                path: raw.to_string(),
            });
        }

        let split = raw
            .find(SEPARATOR)
            .ok_or_else(|| RegistrationError::MissingPath(raw.to_string()))?;
        let host = raw[..split].to_lowercase();
        let path = raw[split..].to_string();

        Ok(Self {
            key: format!("{host}{path}"),
            host: Some(host),
            path,
        })
    }

    /// The normalized pattern string.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Host part of a host-qualified pattern.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Path part of the pattern.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// True if the pattern names a subtree (ends in the separator).
    pub fn is_prefix(&self) -> bool {
        self.path.ends_with(SEPARATOR)
    }

    /// True if the pattern is restricted to one host.
    pub fn is_host_qualified(&self) -> bool {
        self.host.is_some()
    }

    /// Length used to order prefix entries (longest first).
    pub fn specificity(&self) -> usize {
        self.key.len()
    }

    /// Structural prefix test against a request.
    ///
    /// `host` must already be normalized with [`normalize_host`].
    pub fn covers(&self, path: &str, host: &str) -> bool {
        if let Some(expected) = &self.host {
            if expected != host {
                return false;
            }
        }
        if self.is_prefix() {
            path.starts_with(self.path.as_str())
        } else {
            path == self.path
        }
    }
}

/// Lowercase a request host and strip any port.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    // Bracketed IPv6 literal: keep the brackets, drop the port.
    if let Some(end) = host.find(']') {
        return host[..=end].to_lowercase();
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_lowercase(),
        _ => host.to_lowercase(),
    }
}

/// Canonicalize a request path.
///
/// Resolves `.` and `..` segments and collapses repeated separators. A
/// trailing separator on the input is kept.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut cleaned = String::with_capacity(path.len());
    for segment in &segments {
        cleaned.push(SEPARATOR);
        cleaned.push_str(segment);
    }

    if cleaned.is_empty() || (path.ends_with(SEPARATOR) && !cleaned.ends_with(SEPARATOR)) {
        cleaned.push(SEPARATOR);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_paths() {
        let exact = Pattern::parse("/images/logo.png").unwrap();
        assert!(!exact.is_prefix());
        assert!(!exact.is_host_qualified());

        let subtree = Pattern::parse("/images/").unwrap();
        assert!(subtree.is_prefix());
        assert_eq!(subtree.path(), "/images/");
    }

    #[test]
    fn parse_host_qualified() {
        let p = Pattern::parse("Example.COM/api/").unwrap();
        assert_eq!(p.host(), Some("example.com"));
        assert_eq!(p.path(), "/api/");
        assert_eq!(p.as_str(), "example.com/api/");
        assert!(p.is_prefix());
    }

    #[test]
    fn parse_rejects_empty_and_pathless() {
        assert_eq!(Pattern::parse(""), Err(RegistrationError::EmptyPattern));
        assert!(matches!(
            Pattern::parse("example.com"),
            Err(RegistrationError::MissingPath(_))
        ));
    }

    #[test]
    fn covers_respects_host_filter() {
        let p = Pattern::parse("example.com/api/").unwrap();
        assert!(p.covers("/api/users", "example.com"));
        assert!(!p.covers("/api/users", "other.com"));
        assert!(!p.covers("/apix", "example.com"));

        let bare = Pattern::parse("/api/").unwrap();
        assert!(bare.covers("/api/users", "anything.org"));
    }

    #[test]
    fn normalize_host_strips_port() {
        assert_eq!(normalize_host("Example.com:8080"), "example.com");
        assert_eq!(normalize_host("example.com"), "example.com");
        assert_eq!(normalize_host("[::1]:443"), "[::1]");
    }

    #[test]
    fn clean_path_resolves_segments() {
        assert_eq!(clean_path("/a/b/../c"), "/a/c");
        assert_eq!(clean_path("//a///b/"), "/a/b/");
        assert_eq!(clean_path("/a/./b/."), "/a/b");
        assert_eq!(clean_path("/../.."), "/");
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/images/"), "/images/");
    }
}
