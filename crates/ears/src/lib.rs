//! # EARS - Event Routing Service
//!
//! Loads a TOML configuration and a JSON routing table, then routes events
//! from input adapters to output adapters until a termination signal arrives.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration (writes ears.toml if missing)
//! ears
//!
//! # Load an initial routing table
//! ears --config production.toml --routes routes.json
//!
//! # Load adapter libraries and override the worker count
//! ears --plugins /opt/ears/adapters --workers 8 --log-level debug
//!
//! # JSON logging for production
//! ears --json-logs
//! ```
//!
//! ## Signal Handling
//!
//! SIGINT and SIGTERM start a graceful shutdown: queued events are drained
//! for up to `shutdown.drain_timeout_ms`, every route is removed and every
//! adapter is stopped. A second signal exits immediately.

use tracing::error;

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod routes;
pub mod signals;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

pub use config::{LoggingSettings, PluginSettings, RouteSettings, ShutdownSettings};

/// Runs the router to completion.
///
/// Exits the process with status 1 on startup or runtime failure. Called
/// from an async context, so it does not start its own runtime.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Logging settings come from the file, the level may be overridden
    let mut log_settings = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default()
        .logging;
    if let Some(level) = &args.log_level {
        log_settings.level = level.clone();
    }

    if let Err(e) = logging::setup_logging(&log_settings, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}
