//! Listener and per-session settings for the broker's WebSocket transport.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Where and how the broker listens.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    /// 0 lets the OS pick a port; `NetworkModule::start` reports the real one.
    pub port: u16,
    /// Serve `wss://` instead of `ws://` when set.
    pub tls: Option<TlsConfig>,
    pub connection: ConnectionConfig,
    /// Origins allowed by CORS on the HTTP routes. `"*"` allows any.
    pub cors_origins: Vec<String>,
    /// Bound on plain HTTP handling (health checks, the upgrade handshake).
    pub request_timeout: Duration,
}

impl NetworkConfig {
    /// `host:port` as handed to the listener.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Rejects settings under which sessions could never make progress.
    ///
    /// # Errors
    ///
    /// Returns the first offending setting as a `ConfigError`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        self.connection.validate()
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            tls: None,
            connection: ConnectionConfig::default(),
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// PEM files for TLS termination. Deliberately has no `Default`.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Per-session backpressure and limits.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Frames queued for one session before senders start waiting.
    pub outbound_channel_capacity: usize,
    /// How long a reply, provider request, or result may wait for queue space.
    pub send_timeout: Duration,
    /// A session with no inbound traffic for this long is closed.
    pub idle_timeout: Duration,
    /// Largest inbound frame accepted, in bytes.
    pub ws_max_message_size: usize,
    pub ws_write_buffer_size: usize,
    pub ws_max_write_buffer_size: usize,
}

impl ConnectionConfig {
    /// # Errors
    ///
    /// Returns a `ConfigError` naming the first invalid limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_channel_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::ZeroSendTimeout);
        }
        if self.ws_write_buffer_size >= self.ws_max_write_buffer_size {
            return Err(ConfigError::WriteBuffer {
                buffer: self.ws_write_buffer_size,
                max: self.ws_max_write_buffer_size,
            });
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            ws_max_message_size: 1_048_576,    // 1 MB
            ws_write_buffer_size: 131_072,     // 128 KB
            ws_max_write_buffer_size: 524_288, // 512 KB
        }
    }
}

/// Invalid transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("bind host must not be empty")]
    EmptyHost,
    #[error("outbound channel capacity must be at least 1")]
    ZeroCapacity,
    #[error("send timeout must be non-zero")]
    ZeroSendTimeout,
    #[error("write buffer ({buffer} bytes) must be smaller than its maximum ({max} bytes)")]
    WriteBuffer { buffer: usize, max: usize },
}
