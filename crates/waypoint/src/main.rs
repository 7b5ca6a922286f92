//! Main application entry point for the relay server
//!
//! Provides the CLI interface, configuration loading and server startup
//! around [`waypoint_server::RelayServer`].

use clap::{Arg, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use waypoint_server::{load_or_create, AppConfig, LoggingSettings, RelayServer};

// ============================================================================
// CLI Interface
// ============================================================================

/// Command line arguments
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub bind_address: Option<String>,
    pub udp_bind_address: Option<String>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl CliArgs {
    /// Parse command line arguments
    pub fn parse() -> Self {
        let matches = Command::new("Waypoint Relay Server")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Game relay server: rooms, chat commands and traffic forwarding")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("config.toml"),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDRESS")
                    .help("TCP bind address (e.g., 0.0.0.0:5123)"),
            )
            .arg(
                Arg::new("udp-bind")
                    .long("udp-bind")
                    .value_name("ADDRESS")
                    .help("Reliable-UDP bind address (defaults to the TCP address)"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .get_matches();

        Self {
            config_path: PathBuf::from(
                matches
                    .get_one::<String>("config")
                    .expect("Default config path should always be set"),
            ),
            bind_address: matches.get_one::<String>("bind").cloned(),
            udp_bind_address: matches.get_one::<String>("udp-bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

// ============================================================================
// Logging Setup
// ============================================================================

/// Initialize logging system
fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    }

    info!("🔧 Logging initialized with level: {}", log_level);
    Ok(())
}

// ============================================================================
// Signal Handling
// ============================================================================

/// Setup graceful shutdown signal handling
async fn setup_signal_handlers() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("📡 Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}

// ============================================================================
// Application
// ============================================================================

/// Main application struct
pub struct Application {
    config: AppConfig,
    server: Arc<RelayServer>,
}

impl Application {
    /// Load configuration, apply CLI overrides and build the server.
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        // Load configuration first (before logging setup)
        let mut config = load_or_create(&args.config_path).await?;

        // Apply CLI overrides
        if let Some(bind_address) = args.bind_address {
            // Unless told otherwise, UDP follows the TCP address.
            if args.udp_bind_address.is_none() {
                config.server.udp_bind_address = bind_address.clone();
            }
            config.server.bind_address = bind_address;
        }

        if let Some(udp_bind_address) = args.udp_bind_address {
            config.server.udp_bind_address = udp_bind_address;
        }

        if let Some(log_level) = args.log_level {
            config.logging.get_or_insert_with(LoggingSettings::default).level = log_level;
        }

        if args.json_logs {
            config
                .logging
                .get_or_insert_with(LoggingSettings::default)
                .json_format = true;
        }

        // Validate configuration
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {}", e).into());
        }

        // Setup logging
        let logging = config.logging.clone().unwrap_or_default();
        setup_logging(&logging, args.json_logs)?;

        // Display banner after logging is setup
        display_banner();

        let server = Arc::new(RelayServer::new(config.to_server_config()?));

        info!("📂 Config: {}", args.config_path.display());

        Ok(Self { config, server })
    }

    /// Run the application until a shutdown signal arrives.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting Waypoint Relay Server");
        info!("📋 Configuration Summary:");
        info!("  🌐 TCP bind address: {}", self.config.server.bind_address);
        info!(
            "  🌐 UDP bind address: {}",
            self.config.server.udp_bind_address
        );
        info!(
            "  👥 Max connections: {}",
            self.config.server.max_connections
        );
        info!(
            "  ⏱️ Idle timeout: {}s",
            self.config.server.idle_timeout_secs
        );
        info!("  🌐 WebSocket URI: {}", self.config.web.websocket_uri);

        // Start server in background
        let server_handle = {
            let server = self.server.clone();
            tokio::spawn(async move {
                match server.start().await {
                    Ok(()) => {
                        info!("✅ Server completed successfully");
                    }
                    Err(e) => {
                        error!("❌ Server error: {:?}", e);
                        std::process::exit(1);
                    }
                }
            })
        };

        // Periodic statistics task
        let monitoring_handle = {
            let server = self.server.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
                // The first tick fires immediately; skip it.
                interval.tick().await;

                loop {
                    interval.tick().await;
                    info!(
                        "📊 System Health - {} connections | {} rooms",
                        server.active_sessions(),
                        server.active_rooms()
                    );
                }
            })
        };

        info!("✅ Waypoint Relay Server is now running!");
        info!(
            "🎮 Ready to accept connections on {}",
            self.config.server.bind_address
        );
        info!("🔍 Health monitoring active - stats every 60 seconds");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        setup_signal_handlers().await?;

        info!("🛑 Shutdown signal received, initiating graceful shutdown...");

        monitoring_handle.abort();
        self.server.shutdown().await?;

        info!("⏳ Waiting for connections to close...");
        let _ = tokio::time::timeout(tokio::time::Duration::from_secs(5), server_handle).await;

        info!("✅ Waypoint Relay Server shutdown complete");
        info!("👋 Final session count: {}", self.server.active_sessions());

        Ok(())
    }
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {:?}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Utilities and Helpers
// ============================================================================

/// Display startup banner using proper logging
fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║           🌟 WAYPOINT RELAY 🌟           ║");
    info!("║               v{}                     ║", version);
    info!("║                                          ║");
    info!("║  Game Relay Server                       ║");
    info!("║                                          ║");
    info!("║  🎯 Rooms with Host Authority            ║");
    info!("║  🔁 TCP + Reliable UDP Transports        ║");
    info!("║  🌐 Shared HTTP/WebSocket Port           ║");
    info!("║  ⚡ Multi-Acceptor Networking            ║");
    info!("║                                          ║");
    info!("╚══════════════════════════════════════════╝");
}

// ============================================================================
// Tests
// ============================================================================
