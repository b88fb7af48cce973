//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use servemux::config::ServerConfig;
use servemux::http::{Server, ServerError};
use servemux::net::Listener;
use servemux::routing::Registry;

/// Default config bound to an ephemeral port with short timeouts.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.timeouts.read_ms = 5_000;
    config.timeouts.write_ms = 5_000;
    config.timeouts.idle_ms = 5_000;
    config
}

/// Serve `server` on a fresh TCP listener.
pub async fn spawn_server(server: &Server) -> (SocketAddr, JoinHandle<Result<(), ServerError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = server.clone();
    let handle = tokio::spawn(async move { server.serve(listener).await });
    (addr, handle)
}

/// Start a server routing through `registry` with the default test config.
pub async fn start(registry: Arc<Registry>) -> (Server, SocketAddr, JoinHandle<Result<(), ServerError>>) {
    let server = Server::new(test_config(), registry);
    let (addr, handle) = spawn_server(&server).await;
    (server, addr, handle)
}

/// HTTP client that never uses a proxy or pools connections.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Write raw bytes and read until the server closes the connection.
pub async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

/// Read from `stream` until `needle` has been seen.
pub async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !String::from_utf8_lossy(&out).contains(needle) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before {needle:?} arrived");
            out.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("timed out waiting for response");
    String::from_utf8_lossy(&out).into_owned()
}

/// Poll `cond` until it holds or a second passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Listener that replays a script of accept results and records when each
/// accept was attempted. Pends forever once the script runs out.
#[derive(Clone, Default)]
pub struct ScriptedListener {
    script: Arc<Mutex<VecDeque<io::Result<DuplexStream>>>>,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl ScriptedListener {
    pub fn new(script: Vec<io::Result<DuplexStream>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            attempts: Arc::default(),
        }
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    /// Milliseconds between consecutive accept attempts.
    pub fn gaps_ms(&self) -> Vec<u64> {
        self.attempts()
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect()
    }
}

#[async_trait]
impl Listener for ScriptedListener {
    type Io = DuplexStream;

    async fn accept(&self) -> io::Result<(DuplexStream, SocketAddr)> {
        self.attempts.lock().unwrap().push(Instant::now());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result.map(|io| (io, "127.0.0.1:40000".parse().unwrap())),
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok("127.0.0.1:8080".parse().unwrap())
    }
}
