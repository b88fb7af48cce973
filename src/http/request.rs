//! Decoded request descriptor.
//!
//! # Responsibilities
//! - Assign a request ID (UUID v4, or an inbound `X-Request-ID`)
//! - Split the request target into path and query
//! - Extract routing-relevant information (host, path)
//! - Answer keep-alive questions for the connection lifecycle
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Absolute-form targets take their host from the target, not `Host`
//! - HTTP/1.1 requests without a host are rejected (400)

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use uuid::Uuid;

use crate::http::codec::{DecodeError, RequestHead};
use crate::http::context::Context;

/// Header carrying the request ID.
pub const X_REQUEST_ID: &str = "x-request-id";

const MAX_INBOUND_ID_LEN: usize = 128;

/// Correlation ID for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new random ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Reuse the caller's `X-Request-ID` if it is short and printable.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(X_REQUEST_ID)?.to_str().ok()?.trim();
        let acceptable = !value.is_empty()
            && value.len() <= MAX_INBOUND_ID_LEN
            && value.bytes().all(|b| b.is_ascii_graphic());
        acceptable.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully decoded request as seen by handlers.
#[derive(Debug)]
pub struct Request {
    head: RequestHead,
    path: String,
    query: Option<String>,
    host: String,
    body: Bytes,
    remote_addr: SocketAddr,
    id: RequestId,
    context: Context,
}

impl Request {
    /// Assemble a request from its decoded parts.
    pub(crate) fn from_parts(
        head: RequestHead,
        body: Bytes,
        remote_addr: SocketAddr,
        context: Context,
    ) -> Result<Self, DecodeError> {
        let (path, query, authority) = split_target(&head.method, &head.target)?;

        let host = match authority {
            Some(host) => host,
            None => match head.headers.get(HOST) {
                Some(value) => value
                    .to_str()
                    .map_err(|_| DecodeError::malformed(StatusCode::BAD_REQUEST, "invalid Host header"))?
                    .to_string(),
                None if head.version == Version::HTTP_11 => {
                    return Err(DecodeError::malformed(
                        StatusCode::BAD_REQUEST,
                        "missing required Host header",
                    ))
                }
                None => String::new(),
            },
        };

        let id = RequestId::from_headers(&head.headers).unwrap_or_default();

        Ok(Self {
            head,
            path,
            query,
            host,
            body,
            remote_addr,
            id,
            context,
        })
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// The request target exactly as sent.
    pub fn target(&self) -> &str {
        &self.head.target
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Host the request was addressed to, as sent (may include a port).
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Cancelled when the connection closes or the server shuts down hard.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// True if the client asked for the connection to end after this
    /// request.
    pub fn wants_close(&self) -> bool {
        let has_token = |token: &str| {
            self.head.headers.get_all(CONNECTION).iter().any(|v| {
                v.to_str()
                    .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                    .unwrap_or(false)
            })
        };
        match self.head.version {
            Version::HTTP_10 => !has_token("keep-alive"),
            _ => has_token("close"),
        }
    }
}

/// Split a request target into (path, query, authority host).
fn split_target(
    method: &Method,
    target: &str,
) -> Result<(String, Option<String>, Option<String>), DecodeError> {
    if target == "*" {
        return Ok(("*".to_string(), None, None));
    }

    let uri: Uri = target
        .parse()
        .map_err(|_| DecodeError::malformed(StatusCode::BAD_REQUEST, "invalid request target"))?;

    if *method == Method::CONNECT {
        // Authority-form: the target names the host, there is no path.
        let authority = uri.authority().map(|a| a.as_str().to_string());
        return Ok((target.to_string(), None, authority));
    }

    if uri.scheme().is_none() && !target.starts_with('/') {
        return Err(DecodeError::malformed(
            StatusCode::BAD_REQUEST,
            "invalid request target",
        ));
    }

    let path = match uri.path() {
        "" => "/".to_string(),
        p => p.to_string(),
    };
    let query = uri.query().map(str::to_string);
    let authority = uri
        .scheme()
        .and(uri.authority())
        .map(|a| a.as_str().to_string());

    Ok((path, query, authority))
}

#[cfg(test)]
impl Request {
    /// Build a request without a connection.
    pub(crate) fn for_test(method: Method, target: &str, host: &str) -> Self {
        use http::HeaderValue;
        use tokio_util::sync::CancellationToken;

        let mut headers = HeaderMap::new();
        if !host.is_empty() {
            headers.insert(HOST, HeaderValue::from_str(host).unwrap());
        }
        let head = RequestHead {
            method,
            target: target.to_string(),
            version: Version::HTTP_11,
            headers,
        };
        Self::from_parts(
            head,
            Bytes::new(),
            "127.0.0.1:50000".parse().unwrap(),
            Context::with_token(CancellationToken::new()),
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn head(method: Method, target: &str, version: Version, headers: &[(&'static str, &str)]) -> RequestHead {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        RequestHead {
            method,
            target: target.to_string(),
            version,
            headers: map,
        }
    }

    fn build(head: RequestHead) -> Result<Request, DecodeError> {
        use tokio_util::sync::CancellationToken;
        Request::from_parts(
            head,
            Bytes::new(),
            "127.0.0.1:1".parse().unwrap(),
            Context::with_token(CancellationToken::new()),
        )
    }

    #[test]
    fn splits_origin_form() {
        let req = build(head(Method::GET, "/a/b?x=1", Version::HTTP_11, &[("host", "example.com")])).unwrap();
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.query(), Some("x=1"));
        assert_eq!(req.host(), "example.com");
    }

    #[test]
    fn absolute_form_overrides_host_header() {
        let req = build(head(
            Method::GET,
            "http://api.example.com:8080/v1/",
            Version::HTTP_11,
            &[("host", "ignored.com")],
        ))
        .unwrap();
        assert_eq!(req.host(), "api.example.com:8080");
        assert_eq!(req.path(), "/v1/");
    }

    #[test]
    fn http11_requires_host() {
        let err = build(head(Method::GET, "/", Version::HTTP_11, &[])).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { status: StatusCode::BAD_REQUEST, .. }));

        let req = build(head(Method::GET, "/", Version::HTTP_10, &[])).unwrap();
        assert_eq!(req.host(), "");
    }

    #[test]
    fn asterisk_target() {
        let req = build(head(Method::OPTIONS, "*", Version::HTTP_11, &[("host", "a")])).unwrap();
        assert_eq!(req.path(), "*");
        assert_eq!(req.target(), "*");
    }

    #[test]
    fn keep_alive_rules() {
        let req = build(head(Method::GET, "/", Version::HTTP_11, &[("host", "a")])).unwrap();
        assert!(!req.wants_close());

        let req = build(head(Method::GET, "/", Version::HTTP_11, &[("host", "a"), ("connection", "Close")])).unwrap();
        assert!(req.wants_close());

        let req = build(head(Method::GET, "/", Version::HTTP_10, &[])).unwrap();
        assert!(req.wants_close());

        let req = build(head(Method::GET, "/", Version::HTTP_10, &[("connection", "keep-alive")])).unwrap();
        assert!(!req.wants_close());
    }

    #[test]
    fn inbound_request_id_is_adopted() {
        let req = build(head(
            Method::GET,
            "/",
            Version::HTTP_11,
            &[("host", "a"), (X_REQUEST_ID, "trace-123")],
        ))
        .unwrap();
        assert_eq!(req.id().as_str(), "trace-123");

        let generated = build(head(Method::GET, "/", Version::HTTP_11, &[("host", "a")])).unwrap();
        assert!(Uuid::parse_str(generated.id().as_str()).is_ok());
    }
}
