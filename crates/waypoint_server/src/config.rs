//! Configuration structures and loading
//!
//! This module defines the TOML-facing settings structs, the typed runtime
//! configuration derived from them, and the load-or-create logic the binary
//! uses at startup.

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Root configuration object, serialized to/from TOML.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AppConfig {
    /// Listener and connection settings
    pub server: ServerSettings,
    /// HTTP and WebSocket surface settings
    pub web: WebSettings,
    /// Optional logging configuration
    pub logging: Option<LoggingSettings>,
}

/// Listener and connection settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerSettings {
    /// Address the sniffed TCP port binds to
    ///
    /// Format: "IP:PORT". The same port carries the binary game protocol,
    /// plain HTTP and WebSocket upgrades.
    pub bind_address: String,

    /// Address the reliable-UDP endpoint binds to
    pub udp_bind_address: String,

    /// Maximum number of concurrent game connections
    ///
    /// Connections over the limit are dropped at accept time.
    pub max_connections: usize,

    /// Seconds of inbound silence before a game connection is swept
    pub idle_timeout_secs: u64,

    /// Bind one listener per CPU core with SO_REUSEPORT
    ///
    /// Only effective on platforms that support the option; elsewhere a
    /// single acceptor is used.
    pub use_reuse_port: bool,

    /// Hard cap on a frame's declared payload length, in bytes
    ///
    /// Checked against the frame header before any allocation.
    pub max_packet_bytes: usize,
}

/// HTTP and WebSocket surface settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WebSettings {
    /// Request-path prefix treated as a WebSocket upgrade
    pub websocket_uri: String,
}

/// Logging system configuration.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingSettings {
    /// Logging level filter
    ///
    /// Valid values: "trace", "debug", "info", "warn", "error"
    pub level: String,

    /// Enable JSON-formatted log output
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_address: "0.0.0.0:5123".to_string(),
                udp_bind_address: "0.0.0.0:5123".to_string(),
                max_connections: 1000,
                idle_timeout_secs: 180,
                use_reuse_port: false,
                max_packet_bytes: 52_428_800,
            },
            web: WebSettings {
                websocket_uri: "/ws".to_string(),
            },
            logging: Some(LoggingSettings::default()),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Check every field that can be wrong before anything binds.
    pub fn validate(&self) -> Result<(), ServerError> {
        self.server
            .bind_address
            .parse::<SocketAddr>()
            .map_err(|e| ServerError::Config(format!("bad bind_address: {e}")))?;
        self.server
            .udp_bind_address
            .parse::<SocketAddr>()
            .map_err(|e| ServerError::Config(format!("bad udp_bind_address: {e}")))?;
        if self.server.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be positive".into()));
        }
        if self.server.idle_timeout_secs == 0 {
            return Err(ServerError::Config("idle_timeout_secs must be positive".into()));
        }
        if self.server.max_packet_bytes == 0 {
            return Err(ServerError::Config("max_packet_bytes must be positive".into()));
        }
        if !self.web.websocket_uri.starts_with('/') {
            return Err(ServerError::Config(
                "websocket_uri must start with '/'".into(),
            ));
        }
        if let Some(logging) = &self.logging {
            if !LOG_LEVELS.contains(&logging.level.as_str()) {
                return Err(ServerError::Config(format!(
                    "unknown log level '{}'",
                    logging.level
                )));
            }
        }
        Ok(())
    }

    /// The typed runtime configuration. Call [`validate`](Self::validate)
    /// first; the parses here repeat its address checks.
    pub fn to_server_config(&self) -> Result<ServerConfig, ServerError> {
        let bind_address = self
            .server
            .bind_address
            .parse::<SocketAddr>()
            .map_err(|e| ServerError::Config(format!("bad bind_address: {e}")))?;
        let udp_bind_address = self
            .server
            .udp_bind_address
            .parse::<SocketAddr>()
            .map_err(|e| ServerError::Config(format!("bad udp_bind_address: {e}")))?;
        Ok(ServerConfig {
            bind_address,
            udp_bind_address,
            max_connections: self.server.max_connections,
            idle_timeout: Duration::from_secs(self.server.idle_timeout_secs),
            use_reuse_port: self.server.use_reuse_port,
            max_packet_bytes: self.server.max_packet_bytes,
            websocket_uri: self.web.websocket_uri.clone(),
        })
    }
}

/// Load configuration from `path`, or create the file with defaults when it
/// does not exist yet.
pub async fn load_or_create(path: &Path) -> Result<AppConfig, ServerError> {
    if path.exists() {
        let config_str = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ServerError::Config(format!("reading {}: {e}", path.display())))?;
        match toml::de::from_str::<AppConfig>(&config_str) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("Failed to parse config file {}: {}", path.display(), e);
                Err(ServerError::Config(e.to_string()))
            }
        }
    } else {
        warn!(
            "Configuration file not found: {}, using defaults",
            path.display()
        );

        let default_config = AppConfig::default();
        let config_str = toml::to_string_pretty(&default_config)
            .map_err(|e| ServerError::Config(e.to_string()))?;
        tokio::fs::write(path, config_str)
            .await
            .map_err(|e| ServerError::Config(format!("writing {}: {e}", path.display())))?;
        info!("Created default configuration file: {}", path.display());

        Ok(default_config)
    }
}

/// Validated runtime configuration handed to the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    pub udp_bind_address: SocketAddr,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub use_reuse_port: bool,
    pub max_packet_bytes: usize,
    pub websocket_uri: String,
}
