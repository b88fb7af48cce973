//! Handler capability and built-in handlers.
//!
//! # Design Decisions
//! - One async trait; closures are adapted by `HandlerFn`
//! - Handlers are shared behind `Arc` so the registry can hand out cheap
//!   clones to concurrent connections

use std::sync::Arc;

use async_trait::async_trait;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::{HeaderValue, Method, StatusCode};

use crate::http::request::Request;
use crate::http::response::{error, ResponseWriter};

/// Serves one request.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn serve(&self, w: &mut ResponseWriter<'_>, req: &Request);
}

/// A handler shared across connections.
pub type SharedHandler = Arc<dyn Handler>;

/// Adapts a plain closure into a [`Handler`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F> HandlerFn<F>
where
    F: Fn(&mut ResponseWriter<'_>, &Request) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: Fn(&mut ResponseWriter<'_>, &Request) + Send + Sync + 'static,
{
    async fn serve(&self, w: &mut ResponseWriter<'_>, req: &Request) {
        (self.f)(w, req)
    }
}

/// Shorthand for `Arc::new(HandlerFn::new(f))`.
pub fn handler_fn<F>(f: F) -> SharedHandler
where
    F: Fn(&mut ResponseWriter<'_>, &Request) + Send + Sync + 'static,
{
    Arc::new(HandlerFn::new(f))
}

struct NotFound;

#[async_trait]
impl Handler for NotFound {
    async fn serve(&self, w: &mut ResponseWriter<'_>, _req: &Request) {
        error(w, "404 page not found", StatusCode::NOT_FOUND);
    }
}

/// Replies `404 page not found`.
pub fn not_found() -> SharedHandler {
    Arc::new(NotFound)
}

struct AsteriskTarget;

#[async_trait]
impl Handler for AsteriskTarget {
    async fn serve(&self, w: &mut ResponseWriter<'_>, _req: &Request) {
        w.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        error(w, "400 bad request", StatusCode::BAD_REQUEST);
    }
}

/// Replies `400` and closes; no route can match a `*` target.
pub(crate) fn asterisk_target() -> SharedHandler {
    Arc::new(AsteriskTarget)
}

/// Redirects every request to a fixed location.
#[derive(Debug, Clone)]
pub struct RedirectHandler {
    location: String,
    status: StatusCode,
}

impl RedirectHandler {
    pub fn new(location: impl Into<String>, status: StatusCode) -> Self {
        Self {
            location: location.into(),
            status,
        }
    }
}

#[async_trait]
impl Handler for RedirectHandler {
    async fn serve(&self, w: &mut ResponseWriter<'_>, req: &Request) {
        match HeaderValue::from_str(&self.location) {
            Ok(location) => {
                w.headers_mut().insert(LOCATION, location);
            }
            Err(_) => {
                error(w, "invalid redirect location", StatusCode::INTERNAL_SERVER_ERROR);
                return;
            }
        }
        w.write_header(self.status);
        if *req.method() == Method::GET {
            let body = format!(
                "<a href=\"{}\">{}</a>.\n",
                html_escape(&self.location),
                self.status.canonical_reason().unwrap_or("Redirect")
            );
            w.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            );
            w.write(body);
        }
    }
}

/// Answers `OPTIONS *` with an empty 200. The request body, if any, has
/// already been consumed by the decoder.
pub struct GlobalOptions;

#[async_trait]
impl Handler for GlobalOptions {
    async fn serve(&self, w: &mut ResponseWriter<'_>, _req: &Request) {
        w.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    }
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::transport::Transport;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio_util::sync::CancellationToken;

    async fn run(handler: &dyn Handler, req: &Request) -> String {
        let (mut client, server) = duplex(64 * 1024);
        let mut slot = Some(Transport::new(Box::new(server), CancellationToken::new()));
        {
            let mut w = ResponseWriter::new(&mut slot, req.version(), req.method());
            handler.serve(&mut w, req).await;
            w.finish().await.unwrap();
        }
        drop(slot);
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn closure_handler_runs() {
        let h = handler_fn(|w, req| {
            w.write(format!("path={}", req.path()));
        });
        let req = Request::for_test(Method::GET, "/hello", "example.com");
        let text = run(h.as_ref(), &req).await;
        assert!(text.ends_with("path=/hello"));
    }

    #[tokio::test]
    async fn not_found_body() {
        let req = Request::for_test(Method::GET, "/missing", "example.com");
        let text = run(not_found().as_ref(), &req).await;
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with("404 page not found\n"));
    }

    #[tokio::test]
    async fn asterisk_target_is_bad_request() {
        let req = Request::for_test(Method::OPTIONS, "*", "example.com");
        let text = run(asterisk_target().as_ref(), &req).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("connection: close\r\n"));
    }

    #[tokio::test]
    async fn redirect_sets_location() {
        let h = RedirectHandler::new("/tree/?q=1", StatusCode::MOVED_PERMANENTLY);
        let req = Request::for_test(Method::GET, "/tree?q=1", "example.com");
        let text = run(&h, &req).await;
        assert!(text.starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
        assert!(text.contains("location: /tree/?q=1\r\n"));
    }

    #[tokio::test]
    async fn global_options_is_empty_ok() {
        let req = Request::for_test(Method::OPTIONS, "*", "example.com");
        let text = run(&GlobalOptions, &req).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 0\r\n"));
    }
}
