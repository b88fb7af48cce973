//! Transport listener abstraction.
//!
//! # Responsibilities
//! - Define the `Listener` contract the accept loop consumes
//! - Bind TCP listeners from configuration
//! - Classify accept errors as temporary or fatal
//!
//! # Design Decisions
//! - Closing a listener is modelled by the accept loop ceasing to poll it
//!   and dropping it; there is no separate `close` call
//! - Accepted streams are type-erased once they enter the HTTP layer

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::config::ListenerConfig;

/// Byte stream a connection runs over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport handed to the connection lifecycle.
pub type BoxedIo = Box<dyn Io>;

/// A source of inbound connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Stream type produced by `accept`.
    type Io: Io;

    /// Wait for the next connection.
    async fn accept(&self) -> io::Result<(Self::Io, SocketAddr)>;

    /// Address this listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listener for TcpListener {
    type Io = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        // Best effort; a failure here does not make the stream unusable.
        let _ = stream.set_nodelay(true);
        Ok((stream, addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Error type for listener setup.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid bind address {address}: {source}")]
    InvalidAddress {
        address: String,
        source: std::net::AddrParseError,
    },

    #[error("failed to bind: {0}")]
    Bind(#[from] io::Error),
}

/// Bind a TCP listener to the configured address.
pub async fn bind(config: &ListenerConfig) -> Result<TcpListener, ListenerError> {
    let addr: SocketAddr =
        config
            .bind_address
            .parse()
            .map_err(|source| ListenerError::InvalidAddress {
                address: config.bind_address.clone(),
                source,
            })?;

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        address = %local_addr,
        max_connections = config.max_connections,
        "Listener bound"
    );

    Ok(listener)
}

// errno values shared by Linux and the BSDs.
const ENOMEM: i32 = 12;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// Returns true if an accept error is transient and the loop should retry.
///
/// Resource exhaustion (file descriptor limits, memory) and per-connection
/// failures that surface through `accept` are temporary; anything else means
/// the listener itself is broken.
pub fn is_temporary(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }
    matches!(err.raw_os_error(), Some(ENOMEM | ENFILE | EMFILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        assert!(is_temporary(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_temporary(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_temporary(&io::Error::from_raw_os_error(EMFILE)));
        assert!(is_temporary(&io::Error::from_raw_os_error(ENFILE)));
    }

    #[test]
    fn classifies_fatal_errors() {
        assert!(!is_temporary(&io::Error::from(io::ErrorKind::InvalidInput)));
        assert!(!is_temporary(&io::Error::from(io::ErrorKind::NotConnected)));
        assert!(!is_temporary(&io::Error::new(io::ErrorKind::Other, "listener closed")));
    }

    #[tokio::test]
    async fn bind_rejects_bad_address() {
        let config = ListenerConfig {
            bind_address: "not-an-address".into(),
            ..ListenerConfig::default()
        };
        assert!(matches!(
            bind(&config).await,
            Err(ListenerError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn tcp_listener_accepts() {
        let config = ListenerConfig {
            bind_address: "127.0.0.1:0".into(),
            ..ListenerConfig::default()
        };
        let listener = bind(&config).await.unwrap();
        let addr = Listener::local_addr(&listener).unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (_stream, peer) = Listener::accept(&listener).await.unwrap();
        let client = client.await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }
}
