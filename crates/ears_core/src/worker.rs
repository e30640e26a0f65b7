//! Bounded pool of routing workers draining the event queue

use crate::error::{QueueError, RouterError};
use crate::queue::EventQueue;
use crate::router::EventRouter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent routing workers
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    num_cpus::get()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PoolStats {
    pub events_processed: u64,
    pub events_with_failures: u64,
    pub events_unroutable: u64,
    pub active_workers: usize,
}

/// Spawns workers that take events off the queue and route them
pub struct WorkerPool {
    queue: Arc<EventQueue>,
    router: Arc<EventRouter>,
    config: WorkerConfig,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<RwLock<PoolStats>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<EventQueue>, router: Arc<EventRouter>, config: WorkerConfig) -> Self {
        Self {
            queue,
            router,
            config,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            stats: Arc::new(RwLock::new(PoolStats::default())),
        }
    }

    /// Spawn the workers; calling it again while running is a no-op
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }

        let workers = self.config.workers.max(1);
        for id in 0..workers {
            handles.push(tokio::spawn(run_worker(
                id,
                self.queue.clone(),
                self.router.clone(),
                self.cancel.child_token(),
                self.stats.clone(),
            )));
        }
        self.stats.write().await.active_workers = workers;
        info!("👷 Started {} routing worker(s)", workers);
    }

    /// Close the queue and let workers finish what is queued.
    ///
    /// Workers still busy after `timeout` are cancelled; either way every
    /// worker has exited when this returns.
    pub async fn drain(&self, timeout: Duration) {
        self.queue.close();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();

        let joined = join_handles(handles);
        tokio::pin!(joined);
        if tokio::time::timeout(timeout, &mut joined).await.is_err() {
            warn!("⚠️ Workers did not drain within {:?}, cancelling", timeout);
            self.cancel.cancel();
            joined.await;
        }
        self.stats.write().await.active_workers = 0;
        info!("✅ Routing workers stopped");
    }

    /// Cancel workers immediately, including in-flight deliveries
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        join_handles(handles).await;
        self.stats.write().await.active_workers = 0;
        info!("✅ Routing workers stopped");
    }

    pub async fn stats(&self) -> PoolStats {
        self.stats.read().await.clone()
    }
}

async fn join_handles(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!("❌ Routing worker panicked: {}", e);
        }
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<EventQueue>,
    router: Arc<EventRouter>,
    cancel: CancellationToken,
    stats: Arc<RwLock<PoolStats>>,
) {
    debug!("Worker {} started", id);
    loop {
        let event = match queue.next_event(&cancel).await {
            Ok(event) => event,
            Err(QueueError::Closed) | Err(QueueError::Cancelled) => break,
            Err(e) => {
                error!("❌ Worker {} queue error: {}", id, e);
                break;
            }
        };

        let result = router.route_event(event, &cancel).await;
        let mut stats = stats.write().await;
        stats.events_processed += 1;
        match result {
            Ok(_) => {}
            Err(RouterError::Unroutable(e)) => {
                stats.events_unroutable += 1;
                debug!("Worker {}: {}", id, e);
            }
            Err(RouterError::RouteFailures(report)) => {
                stats.events_with_failures += 1;
                for failure in &report.failures {
                    warn!(
                        "⚠️ Route {} failed at {} for event {}: {}",
                        failure.route_hash, failure.stage, report.event_id, failure.error
                    );
                }
            }
        }
    }
    debug!("Worker {} stopped", id);
}
