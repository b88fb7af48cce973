//! Deadline- and cancellation-aware byte transport for one connection.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::http::codec::DecodeError;
use crate::net::BoxedIo;

const READ_CHUNK: usize = 8 * 1024;

pub(crate) struct Transport {
    io: BoxedIo,
    pub(crate) read_buf: BytesMut,
    cancel: CancellationToken,
    write_deadline: Option<Instant>,
}

impl Transport {
    pub(crate) fn new(io: BoxedIo, cancel: CancellationToken) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            cancel,
            write_deadline: None,
        }
    }

    /// Read more bytes into the buffer.
    ///
    /// Returns the number of bytes read; `0` means EOF. `drain` is only
    /// watched while waiting between requests.
    pub(crate) async fn read_more(
        &mut self,
        deadline: Option<Instant>,
        drain: Option<&CancellationToken>,
    ) -> Result<usize, DecodeError> {
        let Self {
            io,
            read_buf,
            cancel,
            ..
        } = self;
        read_buf.reserve(READ_CHUNK);

        let read = async {
            let result = match deadline {
                Some(at) => match timeout_at(at, io.read_buf(read_buf)).await {
                    Ok(result) => result,
                    Err(_) => return Err(DecodeError::TimedOut),
                },
                None => io.read_buf(read_buf).await,
            };
            result.map_err(DecodeError::Truncated)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DecodeError::Cancelled),
            _ = wait_for(drain) => Err(DecodeError::Closed),
            result = read => result,
        }
    }

    pub(crate) fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    /// Write and flush `data`, honoring the write deadline and cancellation.
    pub(crate) async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let Self {
            io,
            cancel,
            write_deadline,
            ..
        } = self;

        let write = async {
            io.write_all(data).await?;
            io.flush().await
        };
        let bounded = async {
            match *write_deadline {
                Some(at) => timeout_at(at, write)
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded"))?,
                None => write.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "connection cancelled")),
            result = bounded => result,
        }
    }

    /// Half-close the write side. Errors are irrelevant at this point.
    pub(crate) async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }

    /// Discard input until the peer closes or `deadline` passes, so a close
    /// with unread data does not turn into a reset.
    pub(crate) async fn discard_input(&mut self, deadline: Instant) {
        self.read_buf.clear();
        while let Ok(n) = self.read_more(Some(deadline), None).await {
            if n == 0 {
                break;
            }
            self.read_buf.clear();
        }
    }

    pub(crate) fn into_parts(self) -> (BoxedIo, BytesMut) {
        (self.io, self.read_buf)
    }
}

async fn wait_for(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
