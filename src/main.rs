//! servemux server binary.
//!
//! ```text
//!     Client ──▶ net::Listener ──▶ http::Server (accept loop)
//!                                      │
//!                                      ▼
//!                               http::conn (per connection)
//!                                      │
//!                                      ▼
//!                               routing::Registry ──▶ handler
//! ```
//!
//! Serves a greeting on `/` and a JSON status on `/healthz`. SIGINT or
//! SIGTERM starts a graceful shutdown bounded by `shutdown_grace_ms`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use http::header::CONTENT_TYPE;
use http::HeaderValue;

use servemux::config::{load_config, ServerConfig};
use servemux::http::Server;
use servemux::lifecycle::shutdown_signal;
use servemux::net::listener::bind;
use servemux::observability::{logging, metrics};
use servemux::routing::Registry;

#[derive(Debug, Parser)]
#[command(name = "servemux", version, about = "HTTP/1.1 pattern-routing server")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

fn routes(registry: &Registry, started: Instant) -> Result<(), servemux::RegistrationError> {
    registry.handle_fn("/", |w, req| {
        w.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        w.write(format!("Hello from servemux, you asked for {}\n", req.path()));
    })?;

    registry.handle_fn("/healthz", move |w, _req| {
        let body = serde_json::json!({
            "status": "ok",
            "uptime_secs": started.elapsed().as_secs(),
        });
        w.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        w.write(body.to_string());
    })?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init_logging(&config.observability)?;
    tracing::info!("servemux v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        keep_alive = config.http.keep_alive,
        "Configuration loaded"
    );

    let registry = Arc::new(Registry::new());
    routes(&registry, Instant::now())?;

    let listener = bind(&config.listener).await?;
    let grace = config.timeouts.shutdown_grace();
    let server = Server::new(config, registry);

    let mut serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let stopped_early = tokio::select! {
        result = &mut serving => Some(result?),
        _ = shutdown_signal() => None,
    };

    let result = match stopped_early {
        Some(result) => result,
        None => {
            tracing::info!("Shutdown signal received, draining connections");
            if let Err(err) = server.shutdown(true, grace).await {
                tracing::warn!(error = %err, "Graceful shutdown incomplete");
            }
            serving.await?
        }
    };

    match result {
        Ok(()) | Err(servemux::ServerError::Closed) => {}
        Err(err) => return Err(err.into()),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
