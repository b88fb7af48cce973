//! Response sink handed to handlers.
//!
//! # Responsibilities
//! - Buffer status, headers and body until the handler flushes or returns
//! - Choose body framing when the head is committed
//! - Let a handler take over the raw transport (hijack)
//!
//! # Design Decisions
//! - `write` never blocks; bytes reach the wire on `flush` or when the
//!   handler returns, so small responses go out with `Content-Length`
//! - Streaming after `flush` uses chunked framing on HTTP/1.1 and
//!   close-delimited framing on HTTP/1.0
//! - A failed write poisons the writer; the connection closes afterwards

use std::fmt;
use std::io;

use bytes::{BufMut, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use thiserror::Error;
use tokio::time::Instant;

use crate::http::codec::{body_allowed, encode_chunk, encode_head, LAST_CHUNK};
use crate::http::request::X_REQUEST_ID;
use crate::http::transport::Transport;
use crate::net::BoxedIo;

/// How the body is delimited on the wire, fixed at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length { remaining: u64 },
    Chunked,
    Close,
    Empty,
}

/// The raw connection, taken over by a handler.
pub struct Hijacked {
    pub io: BoxedIo,
    /// Bytes already read from the peer but not consumed by the server.
    pub read_buf: BytesMut,
}

impl fmt::Debug for Hijacked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hijacked")
            .field("read_buf_len", &self.read_buf.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HijackError {
    #[error("response already committed")]
    AlreadyCommitted,

    #[error("connection already hijacked")]
    AlreadyHijacked,
}

/// Writes one response.
pub struct ResponseWriter<'a> {
    transport: &'a mut Option<Transport>,
    version: Version,
    head_request: bool,
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    framing: Option<Framing>,
    must_close: bool,
    failed: bool,
    aborted: bool,
}

impl<'a> ResponseWriter<'a> {
    pub(crate) fn new(transport: &'a mut Option<Transport>, version: Version, method: &Method) -> Self {
        Self {
            transport,
            version,
            head_request: *method == Method::HEAD,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            framing: None,
            must_close: false,
            failed: false,
            aborted: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Response headers. Changes after the head is committed have no effect.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Set the status code. Ignored once the head is committed.
    pub fn write_header(&mut self, status: StatusCode) {
        if self.is_committed() {
            tracing::warn!(status = status.as_u16(), "Superfluous write_header call");
            return;
        }
        self.status = status;
    }

    /// Append body bytes. Returns the number of bytes accepted.
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> usize {
        let data = data.as_ref();
        if self.transport.is_none() {
            tracing::warn!("Write on hijacked connection");
            return 0;
        }
        if matches!(self.framing, Some(Framing::Empty)) {
            return 0;
        }
        self.body.put_slice(data);
        data.len()
    }

    /// True once the status line and headers are on the wire.
    pub fn is_committed(&self) -> bool {
        self.framing.is_some()
    }

    pub fn is_hijacked(&self) -> bool {
        self.transport.is_none()
    }

    /// Commit the head if needed and send everything buffered so far.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.is_hijacked() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection hijacked"));
        }
        self.send(false).await
    }

    /// Take over the raw transport. The server forgets the connection.
    pub fn hijack(&mut self) -> Result<Hijacked, HijackError> {
        if self.transport.is_none() {
            return Err(HijackError::AlreadyHijacked);
        }
        if self.is_committed() {
            return Err(HijackError::AlreadyCommitted);
        }
        let transport = self.transport.take().ok_or(HijackError::AlreadyHijacked)?;
        let (io, read_buf) = transport.into_parts();
        Ok(Hijacked { io, read_buf })
    }

    /// Complete the response.
    pub(crate) async fn finish(&mut self) -> io::Result<()> {
        if self.is_hijacked() || self.aborted {
            return Ok(());
        }
        self.send(true).await
    }

    pub(crate) fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        if let Some(transport) = self.transport.as_mut() {
            transport.set_write_deadline(deadline);
        }
    }

    /// Mark the connection to close after this response.
    pub(crate) fn close_after(&mut self) {
        self.must_close = true;
    }

    /// True if the connection may carry another request afterwards.
    pub(crate) fn keep_alive(&self) -> bool {
        !self.must_close && !self.failed && !self.is_hijacked()
    }

    /// Give up on a committed response. Nothing more is written, so the body
    /// stays visibly incomplete, and the connection closes.
    pub(crate) fn abort(&mut self) {
        self.aborted = true;
        self.must_close = true;
        self.body.clear();
    }

    /// Discard an uncommitted response so an error can be sent instead.
    /// Returns false if it is too late.
    pub(crate) fn reset(&mut self) -> bool {
        if self.is_committed() || self.is_hijacked() {
            return false;
        }
        let request_id = self.headers.remove(X_REQUEST_ID);
        self.headers.clear();
        if let Some(id) = request_id {
            self.headers.insert(X_REQUEST_ID, id);
        }
        self.body.clear();
        self.status = StatusCode::OK;
        true
    }

    fn commit(&mut self, finishing: bool) -> Framing {
        if self
            .headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
        {
            self.must_close = true;
        }

        let declared = self
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let framing = if !body_allowed(self.status) {
            self.headers.remove(CONTENT_LENGTH);
            self.headers.remove(TRANSFER_ENCODING);
            Framing::Empty
        } else if let Some(remaining) = declared {
            Framing::Length { remaining }
        } else if finishing {
            self.headers
                .insert(CONTENT_LENGTH, HeaderValue::from(self.body.len() as u64));
            Framing::Length {
                remaining: self.body.len() as u64,
            }
        } else if self.version == Version::HTTP_11 {
            self.headers
                .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            Framing::Chunked
        } else {
            self.must_close = true;
            Framing::Close
        };

        if self.must_close {
            self.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        } else if self.version == Version::HTTP_10 {
            self.headers
                .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }
        framing
    }

    async fn send(&mut self, finishing: bool) -> io::Result<()> {
        if self.failed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "earlier write failed"));
        }

        let mut out = BytesMut::new();
        let mut framing = match self.framing {
            Some(framing) => framing,
            None => {
                let framing = self.commit(finishing);
                encode_head(&mut out, self.version, self.status, &self.headers);
                framing
            }
        };

        let body = self.body.split();
        if !self.head_request {
            match &mut framing {
                Framing::Length { remaining } => {
                    let take = body.len().min(*remaining as usize);
                    out.put_slice(&body[..take]);
                    *remaining -= take as u64;
                    if take < body.len() {
                        tracing::warn!(
                            excess = body.len() - take,
                            "Response body exceeds declared Content-Length"
                        );
                        self.must_close = true;
                    }
                }
                Framing::Chunked => {
                    encode_chunk(&mut out, &body);
                    if finishing {
                        out.put_slice(LAST_CHUNK);
                    }
                }
                Framing::Close => out.put_slice(&body),
                Framing::Empty => {}
            }
            if finishing && matches!(framing, Framing::Length { remaining } if remaining > 0) {
                // Short body: the peer would wait for bytes that never come.
                self.must_close = true;
            }
        }
        self.framing = Some(framing);

        if out.is_empty() {
            return Ok(());
        }
        let Some(transport) = self.transport.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection hijacked"));
        };
        if let Err(err) = transport.write_all(&out).await {
            self.failed = true;
            return Err(err);
        }
        Ok(())
    }
}

/// Reply with a plain-text error message.
pub fn error(w: &mut ResponseWriter<'_>, message: &str, status: StatusCode) {
    let headers = w.headers_mut();
    headers.remove(CONTENT_LENGTH);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    w.write_header(status);
    w.write(message);
    w.write(b"\n");
}
