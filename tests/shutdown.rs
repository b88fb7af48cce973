//! Graceful and forceful shutdown against live connections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use servemux::http::{Server, ServerError, ShutdownError};
use servemux::routing::Registry;
use servemux::{Handler, Request, ResponseWriter};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

mod common;

/// Reports when it starts, then waits for its context to be cancelled.
struct WaitForCancel {
    events: mpsc::UnboundedSender<&'static str>,
}

#[async_trait]
impl Handler for WaitForCancel {
    async fn serve(&self, w: &mut ResponseWriter<'_>, req: &Request) {
        let _ = self.events.send("started");
        req.context().cancelled().await;
        let _ = self.events.send("cancelled");
        w.write("cancelled");
    }
}

/// Takes a while, then answers.
struct Slow {
    events: mpsc::UnboundedSender<&'static str>,
}

#[async_trait]
impl Handler for Slow {
    async fn serve(&self, w: &mut ResponseWriter<'_>, _req: &Request) {
        let _ = self.events.send("started");
        tokio::time::sleep(Duration::from_millis(200)).await;
        w.write("done");
    }
}

fn registry_with<H: Handler>(handler: H) -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    registry.handle("/work", handler).unwrap();
    registry
        .handle_fn("/quick", |w, _req| {
            w.write("quick");
        })
        .unwrap();
    registry
}

async fn send_work(addr: std::net::SocketAddr) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        common::raw_exchange(addr, b"GET /work HTTP/1.1\r\nHost: a\r\n\r\n").await
    })
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<&'static str>) -> &'static str {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event")
        .expect("channel closed")
}

#[tokio::test]
async fn test_forceful_shutdown_cancels_in_flight() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let (server, addr, serving) = common::start(registry_with(WaitForCancel { events: tx })).await;

    let client = send_work(addr).await;
    assert_eq!(next_event(&mut events).await, "started");

    server.shutdown(false, None).await.unwrap();

    assert_eq!(next_event(&mut events).await, "cancelled");
    assert!(matches!(serving.await.unwrap(), Err(ServerError::Closed)));

    // The connection is torn down without a complete response.
    let text = client.await.unwrap();
    assert!(!text.contains("200 OK"), "{text}");
    assert!(common::eventually(|| server.active_connections() == 0).await);
}

#[tokio::test]
async fn test_graceful_shutdown_waits_for_active_requests() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let (server, addr, serving) = common::start(registry_with(Slow { events: tx })).await;

    // An idle keep-alive connection that graceful shutdown should close.
    let mut idle = TcpStream::connect(addr).await.unwrap();
    idle.write_all(b"GET /quick HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    common::read_until(&mut idle, "quick").await;

    let client = send_work(addr).await;
    assert_eq!(next_event(&mut events).await, "started");

    server.shutdown(true, Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(server.active_connections(), 0);

    let text = client.await.unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.ends_with("done"), "{text}");

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(1), idle.read_to_end(&mut rest))
        .await
        .expect("idle connection was not closed")
        .unwrap();
    assert_eq!(n, 0);

    assert!(matches!(serving.await.unwrap(), Err(ServerError::Closed)));
}

#[tokio::test]
async fn test_graceful_deadline_falls_back_to_cancellation() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let (server, addr, serving) = common::start(registry_with(WaitForCancel { events: tx })).await;

    let _client = send_work(addr).await;
    assert_eq!(next_event(&mut events).await, "started");

    let result = server.shutdown(true, Some(Duration::from_millis(100))).await;
    assert_eq!(result, Err(ShutdownError::DeadlineExceeded));
    assert_eq!(next_event(&mut events).await, "cancelled");
    assert!(matches!(serving.await.unwrap(), Err(ServerError::Closed)));
}

#[tokio::test]
async fn test_second_graceful_shutdown_is_rejected() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let (server, addr, _serving) = common::start(registry_with(WaitForCancel { events: tx })).await;

    let _client = send_work(addr).await;
    assert_eq!(next_event(&mut events).await, "started");

    let first = {
        let server = server.clone();
        tokio::spawn(async move { server.shutdown(true, Some(Duration::from_secs(5))).await })
    };
    assert!(common::eventually(|| server.is_shutting_down()).await);

    assert_eq!(server.shutdown(true, None).await, Err(ShutdownError::InProgress));

    // A forceful call still goes through and releases the first caller.
    server.shutdown(false, None).await.unwrap();
    assert_eq!(first.await.unwrap(), Ok(()));
}
