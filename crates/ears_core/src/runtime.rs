//! Runtime facade wiring the routing core together
//!
//! A [`Runtime`] owns one registry, table, queue, router and worker pool. It
//! is constructed explicitly, started once and shut down once.

use crate::adapter::AdapterFactoryRegistry;
use crate::delivery::{DeliveryConfig, DeliveryCoordinator, DeliveryStats};
use crate::error::EarsError;
use crate::queue::{EventQueue, QueueConfig};
use crate::registry::PluginRegistry;
use crate::router::{EventRouter, RouterStats};
use crate::table::RoutingTable;
use crate::worker::{PoolStats, WorkerConfig, WorkerPool};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Configuration for every runtime component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
}

/// Point-in-time view of runtime counters
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub routes: usize,
    pub plugins: usize,
    pub queued: usize,
    pub router: RouterStats,
    pub delivery: DeliveryStats,
    pub pool: PoolStats,
}

pub struct Runtime {
    registry: Arc<PluginRegistry>,
    table: Arc<RoutingTable>,
    queue: Arc<EventQueue>,
    router: Arc<EventRouter>,
    pool: WorkerPool,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, factories: Arc<AdapterFactoryRegistry>) -> Self {
        let queue = Arc::new(EventQueue::new(&config.queue));
        let registry = Arc::new(PluginRegistry::new(factories).with_ingress(queue.clone()));
        let table = Arc::new(RoutingTable::new(registry.clone()));
        let delivery = Arc::new(DeliveryCoordinator::new(config.delivery));
        let router = Arc::new(EventRouter::new(table.clone(), delivery));
        let pool = WorkerPool::new(queue.clone(), router.clone(), config.workers);

        Self {
            registry,
            table,
            queue,
            router,
            pool,
        }
    }

    pub async fn start(&self) {
        self.pool.start().await;
        info!("🚀 Routing runtime started");
    }

    /// Drain the queue, remove every route and stop every plugin
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<(), EarsError> {
        info!("🛑 Shutting down routing runtime");
        self.pool.drain(drain_timeout).await;

        let cleared = self.table.clear(&CancellationToken::new()).await;
        if let Err(e) = &cleared {
            error!("❌ Failed to clear routing table: {}", e);
        }
        self.registry.shutdown().await?;
        cleared?;

        info!("✅ Routing runtime shut down");
        Ok(())
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub async fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            routes: self.table.len(),
            plugins: self.registry.len(),
            queued: self.queue.count().unwrap_or(0),
            router: self.router.stats().await,
            delivery: self.router.delivery().stats().await,
            pool: self.pool.stats().await,
        }
    }
}
