//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Per-connection deadlines.
    pub timeouts: TimeoutConfig,

    /// Protocol limits and behavior switches.
    pub http: HttpConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure). 0 means unlimited.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Timeout configuration. Every value is in milliseconds; 0 disables it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for reading a request's header block.
    pub read_header_ms: u64,

    /// Deadline for reading an entire request, body included.
    pub read_ms: u64,

    /// Deadline for writing a response.
    pub write_ms: u64,

    /// How long a keep-alive connection may wait for its next request.
    /// Falls back to `read_ms` when 0.
    pub idle_ms: u64,

    /// How long the binary waits for in-flight connections on shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_header_ms: 10_000,
            read_ms: 30_000,
            write_ms: 30_000,
            idle_ms: 60_000,
            shutdown_grace_ms: 30_000,
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl TimeoutConfig {
    pub fn read_header(&self) -> Option<Duration> {
        millis(self.read_header_ms).or_else(|| self.read())
    }

    pub fn read(&self) -> Option<Duration> {
        millis(self.read_ms)
    }

    pub fn write(&self) -> Option<Duration> {
        millis(self.write_ms)
    }

    pub fn idle(&self) -> Option<Duration> {
        millis(self.idle_ms).or_else(|| self.read())
    }

    pub fn shutdown_grace(&self) -> Option<Duration> {
        millis(self.shutdown_grace_ms)
    }
}

/// HTTP protocol configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Largest accepted request header block, in bytes.
    pub max_header_bytes: usize,

    /// Largest accepted request body, in bytes.
    pub max_body_bytes: usize,

    /// Serve more than one request per connection.
    pub keep_alive: bool,

    /// Route `OPTIONS *` to the configured handler instead of answering it.
    pub disable_general_options_handler: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 1 << 20,
            max_body_bytes: 8 << 20,
            keep_alive: true,
            disable_general_options_handler: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Pretty for terminals, JSON for collectors.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_disables_timeouts() {
        let timeouts = TimeoutConfig {
            read_header_ms: 0,
            read_ms: 0,
            write_ms: 0,
            idle_ms: 0,
            shutdown_grace_ms: 0,
        };
        assert_eq!(timeouts.read_header(), None);
        assert_eq!(timeouts.write(), None);
        assert_eq!(timeouts.idle(), None);
    }

    #[test]
    fn idle_and_header_fall_back_to_read() {
        let timeouts = TimeoutConfig {
            read_header_ms: 0,
            read_ms: 250,
            idle_ms: 0,
            ..TimeoutConfig::default()
        };
        assert_eq!(timeouts.idle(), Some(Duration::from_millis(250)));
        assert_eq!(timeouts.read_header(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [listener]
            bind_address = "0.0.0.0:9000"

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.listener.bind_address, "0.0.0.0:9000");
        assert_eq!(config.listener.max_connections, 10_000);
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert!(config.http.keep_alive);
    }
}
