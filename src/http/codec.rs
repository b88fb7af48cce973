//! Minimal HTTP/1.1 wire codec.
//!
//! # Responsibilities
//! - Locate and parse a request header block (httparse)
//! - Determine request body framing
//! - Encode response heads and chunked body frames
//!
//! # Design Decisions
//! - Header blocks are parsed only once complete, so a malformed block can
//!   be skipped and the connection kept, unless it declares a body whose
//!   length can no longer be trusted
//! - Chunked request bodies are not supported (501)
//! - Response framing is chosen by the response writer, not here

use std::io;

use bytes::{BufMut, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use thiserror::Error;

/// httparse needs a preallocated header array of this size.
pub const MAX_HEADERS: usize = 100;

/// Terminates a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Decoded request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Failure to decode the next request on a connection.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Bounded, well-delimited bad input. Answered with `status`; when
    /// `recoverable` the connection continues with the next request.
    #[error("malformed request: {reason}")]
    Malformed {
        status: StatusCode,
        reason: &'static str,
        recoverable: bool,
    },

    /// The transport failed or hit EOF in the middle of a request.
    #[error("request truncated: {0}")]
    Truncated(#[source] io::Error),

    /// The peer closed the connection between requests.
    #[error("connection closed by peer")]
    Closed,

    /// A read deadline expired.
    #[error("timed out reading request")]
    TimedOut,

    /// The connection's context was cancelled.
    #[error("connection cancelled")]
    Cancelled,
}

impl DecodeError {
    pub fn malformed(status: StatusCode, reason: &'static str) -> Self {
        Self::Malformed {
            status,
            reason,
            recoverable: true,
        }
    }

    /// Malformed input after which the byte stream cannot be resynchronized.
    pub fn fatal(status: StatusCode, reason: &'static str) -> Self {
        Self::Malformed {
            status,
            reason,
            recoverable: false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed",
            Self::Truncated(_) => "truncated",
            Self::Closed => "closed",
            Self::TimedOut => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Offset just past the blank line ending a header block, if present.
///
/// Accepts both CRLF and bare LF line endings.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Some(i + 2),
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => return Some(i + 3),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Finds the end of a header block that arrives over several reads
/// without rescanning bytes already searched.
#[derive(Debug, Default)]
pub struct HeadScanner {
    scanned: usize,
}

impl HeadScanner {
    /// A terminator is at most three bytes, so it may straddle two reads.
    const OVERLAP: usize = 3;

    pub fn find(&mut self, buf: &[u8]) -> Option<usize> {
        let start = self.scanned.min(buf.len());
        match find_head_end(&buf[start..]) {
            Some(end) => {
                self.scanned = 0;
                Some(start + end)
            }
            None => {
                self.scanned = buf.len().saturating_sub(Self::OVERLAP);
                None
            }
        }
    }
}

/// Parse a complete header block.
pub fn parse_head(block: &[u8]) -> Result<RequestHead, DecodeError> {
    parse_block(block).map_err(|err| match err {
        DecodeError::Malformed { status, reason, .. } if declares_body(block) => {
            DecodeError::fatal(status, reason)
        }
        other => other,
    })
}

/// True if any header line names a body framing header.
fn declares_body(block: &[u8]) -> bool {
    block.split(|&b| b == b'\n').skip(1).any(|line| {
        let name = line.split(|&b| b == b':').next().unwrap_or_default().trim_ascii();
        name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str().as_bytes())
            || name.eq_ignore_ascii_case(TRANSFER_ENCODING.as_str().as_bytes())
    })
}

fn parse_block(block: &[u8]) -> Result<RequestHead, DecodeError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw_headers);

    match req.parse(block) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(DecodeError::malformed(StatusCode::BAD_REQUEST, "incomplete header block"))
        }
        Err(httparse::Error::TooManyHeaders) => {
            return Err(DecodeError::malformed(
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                "too many headers",
            ))
        }
        Err(httparse::Error::Version) => {
            return Err(DecodeError::malformed(
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                "unsupported HTTP version",
            ))
        }
        Err(_) => {
            return Err(DecodeError::malformed(StatusCode::BAD_REQUEST, "malformed request"))
        }
    }

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or(DecodeError::malformed(StatusCode::BAD_REQUEST, "invalid method"))?;
    let target = req
        .path
        .ok_or(DecodeError::malformed(StatusCode::BAD_REQUEST, "missing request target"))?
        .to_string();
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => {
            return Err(DecodeError::malformed(
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                "unsupported HTTP version",
            ))
        }
    };

    let mut headers = HeaderMap::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| DecodeError::malformed(StatusCode::BAD_REQUEST, "invalid header name"))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| DecodeError::malformed(StatusCode::BAD_REQUEST, "invalid header value"))?;
        headers.append(name, value);
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

/// Number of body bytes that follow the header block.
pub fn body_length(head: &RequestHead) -> Result<usize, DecodeError> {
    if head.headers.contains_key(TRANSFER_ENCODING) {
        return Err(DecodeError::fatal(
            StatusCode::NOT_IMPLEMENTED,
            "unsupported transfer encoding",
        ));
    }

    let mut length: Option<usize> = None;
    for value in head.headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or(DecodeError::fatal(StatusCode::BAD_REQUEST, "invalid content length"))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(DecodeError::fatal(
                    StatusCode::BAD_REQUEST,
                    "conflicting content length",
                ))
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length.unwrap_or(0))
}

/// True if responses with `status` may carry a body.
pub fn body_allowed(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Append a status line and headers.
pub fn encode_head(buf: &mut BytesMut, version: Version, status: StatusCode, headers: &HeaderMap) {
    let proto = if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    };
    let reason = status.canonical_reason().unwrap_or("");
    buf.put_slice(format!("{proto} {} {reason}\r\n", status.as_u16()).as_bytes());
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

/// Append one chunk of a chunked body.
pub fn encode_chunk(buf: &mut BytesMut, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    buf.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}
