//! Main application logic and lifecycle management.
//!
//! The `Application` owns the routing runtime. It registers adapter types,
//! applies the initial routing table, reports statistics while running and
//! shuts everything down in order when a termination signal arrives.

use crate::{
    cli::CliArgs,
    config::AppConfig,
    logging::display_banner,
    routes::load_routes,
    signals::{wait_for_shutdown_signal, wait_for_shutdown_signal_silent},
};
use ears_core::{AdapterFactoryRegistry, Runtime, RuntimeStats};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

pub struct Application {
    config: AppConfig,
    runtime: Runtime,
    cancel: CancellationToken,
}

impl Application {
    /// Loads configuration, applies CLI overrides and builds the runtime.
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(routes_path) = args.routes_path {
            config.routes.file = Some(routes_path);
        }

        if let Some(plugin_dir) = args.plugin_dir {
            config.plugins.directory = plugin_dir.to_string_lossy().to_string();
            config.plugins.auto_load = true;
        }

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }

        if args.json_logs {
            config.logging.json_format = true;
        }

        if let Some(workers) = args.workers {
            config.runtime.workers.workers = workers;
        }

        display_banner();
        Self::from_config(config)
    }

    /// Builds the application from an already merged configuration.
    pub fn from_config(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        let factories = Arc::new(AdapterFactoryRegistry::new());
        ears_plugins::register_builtin(&factories)?;

        if config.plugins.auto_load {
            let loaded =
                ears_plugins::dynamic::load_directory(&config.plugins.directory, &factories)?;
            info!("🔌 Loaded {} adapter libraries", loaded.len());
        }
        info!("🔌 Adapter types: {}", factories.types().join(", "));

        let runtime = Runtime::new(config.runtime.clone(), factories);

        Ok(Self {
            config,
            runtime,
            cancel: CancellationToken::new(),
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Starts the workers and applies the configured routing table.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.log_configuration_summary();
        self.runtime.start().await;

        if let Some(path) = &self.config.routes.file {
            self.apply_routes(path).await?;
        } else {
            warn!("⚠️ No routes file configured; the routing table is empty");
        }
        Ok(())
    }

    async fn apply_routes(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let entries = load_routes(path).await?;
        let summary = self
            .runtime
            .table()
            .replace_all_routes(entries, &self.cancel)
            .await?;
        info!(
            "🗺️ Routing table applied: {} added, {} removed, {} unchanged (hash {})",
            summary.added,
            summary.removed,
            summary.unchanged,
            self.runtime.table().hash()
        );
        Ok(())
    }

    /// Stops routing, drains queued events and stops every adapter.
    pub async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.cancel.cancel();
        self.runtime
            .shutdown(self.config.shutdown.drain_timeout())
            .await?;
        Ok(())
    }

    /// Runs until a termination signal, then shuts down.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting EARS event router");
        self.start().await?;

        let app = Arc::new(self);

        let monitoring_handle = {
            let app = app.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(STATS_INTERVAL);
                interval.tick().await;
                let mut last_routed = 0u64;

                loop {
                    interval.tick().await;
                    let stats = app.runtime.stats().await;
                    let routed = stats.router.events_routed;
                    info!(
                        "📊 Router Health - {} events/min | {} routes | {} plugins | {} queued",
                        routed.saturating_sub(last_routed),
                        stats.routes,
                        stats.plugins,
                        stats.queued
                    );
                    last_routed = routed;
                }
            })
        };

        info!("✅ EARS is now running");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        wait_for_shutdown_signal().await?;

        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal_silent().await {
                error!("Failed to set up merciless shutdown signal handler: {e}");
                return;
            }

            warn!("Shutdown handler received again! I'll make this quick.");
            std::process::exit(1);
        });

        monitoring_handle.abort();

        info!("🧹 Draining queued events and stopping adapters...");
        let result = app.shutdown().await;
        log_final_statistics(&app.runtime.stats().await);

        match result {
            Ok(()) => {
                info!("✅ EARS shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("❌ Shutdown finished with errors: {}", e);
                Err(e)
            }
        }
    }

    fn log_configuration_summary(&self) {
        let runtime = &self.config.runtime;
        info!("📋 Configuration Summary:");
        info!(
            "  📥 Queue: capacity {} ({:?} on overflow)",
            runtime.queue.capacity, runtime.queue.overflow
        );
        info!("  👷 Workers: {}", runtime.workers.workers);
        info!(
            "  🔁 Delivery: {} attempts, {}ms..{}ms backoff, {}ms attempt timeout",
            runtime.delivery.max_attempts,
            runtime.delivery.initial_backoff_ms,
            runtime.delivery.max_backoff_ms,
            runtime.delivery.attempt_timeout_ms
        );
        match &self.config.routes.file {
            Some(path) => info!("  🗺️ Routes: {}", path.display()),
            None => info!("  🗺️ Routes: none"),
        }
    }
}

fn log_final_statistics(stats: &RuntimeStats) {
    info!("📊 Final Statistics:");
    info!("  - Events routed: {}", stats.router.events_routed);
    info!("  - Unroutable events: {}", stats.router.events_unroutable);
    info!("  - Dispatched: {}", stats.router.dispatched);
    info!("  - Route failures: {}", stats.router.route_failures);
    info!(
        "  - Delivered: {} | failed: {} | dropped: {} | suppressed: {}",
        stats.delivery.delivered,
        stats.delivery.failed,
        stats.delivery.dropped,
        stats.delivery.suppressed
    );
}
