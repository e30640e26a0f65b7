//! Delivery semantics on top of a destination plugin's send operation
//!
//! * `fire_and_forget`: one attempt, failures are counted and logged only.
//! * `at_least_once`: attempts bounded by a per-attempt timeout, retried with
//!   capped exponential backoff up to `max_attempts`.
//! * `exactly_once`: at-least-once keyed by a dedup id derived from the event
//!   content and the route hash. An acknowledged key suppresses identical
//!   events whose timestamps fall within the dedup window. A duplicate that
//!   arrives while the key is in flight waits for that outcome: it is
//!   suppressed once the first delivery is acknowledged and attempts the
//!   delivery itself if the first one failed.
//!
//! Cancellation aborts the in-flight attempt and any pending backoff; the
//! delivery is then reported as failed.

use crate::adapter::{Delivery, Sender};
use crate::error::DeliveryError;
use crate::event::Event;
use crate::hasher::digest_fields;
use crate::model::{DeliveryMode, RoutingTableEntry};
use crate::registry::{PluginRef, PluginState};
use crate::transform::Transformer;
use crate::utils::{current_timestamp, short_hash};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PRUNE_EVERY: u64 = 1024;

/// Retry, timeout and dedup settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Total attempts for at-least-once and exactly-once, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on one acknowledged send
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Dedup window for exactly-once routes that do not set `event_ts_period_ms`
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_attempt_timeout_ms() -> u64 {
    5_000
}

fn default_dedup_window_ms() -> u64 {
    60_000
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            dedup_window_ms: default_dedup_window_ms(),
        }
    }
}

impl DeliveryConfig {
    /// Delay before retry number `retry` (1-based), capped at `max_backoff_ms`
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let delay_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay_ms.min(self.max_backoff_ms as f64).max(0.0) as u64)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("delivery.max_attempts must be at least 1".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("delivery.backoff_multiplier must be >= 1.0".to_string());
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err("delivery.max_backoff_ms must be >= initial_backoff_ms".to_string());
        }
        if self.attempt_timeout_ms == 0 {
            return Err("delivery.attempt_timeout_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Result of a dispatch that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The destination acknowledged the event
    Delivered { attempts: u32 },
    /// An identical exactly-once delivery was already acknowledged
    Suppressed,
    /// A fire-and-forget send failed; the failure is recorded only
    Dropped { reason: String },
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub retries: u64,
    pub suppressed: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone)]
enum DedupState {
    /// Closes when the owning delivery settles
    Pending(watch::Receiver<()>),
    Acked {
        event_ts: u64,
        acked_at: u64,
        window_ms: u64,
    },
}

enum AttemptResult {
    Acked,
    Failed(String),
    Cancelled,
}

/// Ownership of a pending dedup key.
///
/// Dropping the claim releases an unacknowledged key and wakes every waiting
/// duplicate, including when the owning dispatch future is dropped mid-flight.
struct DedupClaim<'a> {
    dedup: &'a DashMap<String, DedupState>,
    key: String,
    _settled: watch::Sender<()>,
}

impl<'a> DedupClaim<'a> {
    fn new(dedup: &'a DashMap<String, DedupState>, key: &str) -> (Self, watch::Receiver<()>) {
        let (settled_tx, settled_rx) = watch::channel(());
        let claim = Self {
            dedup,
            key: key.to_string(),
            _settled: settled_tx,
        };
        (claim, settled_rx)
    }

    fn acknowledge(&mut self, state: DedupState) {
        self.dedup.insert(self.key.clone(), state);
    }
}

impl Drop for DedupClaim<'_> {
    fn drop(&mut self) {
        // Fields drop after this body, so waiters wake to the settled entry
        self.dedup
            .remove_if(&self.key, |_, state| matches!(state, DedupState::Pending(_)));
    }
}

/// Dispatches work events to destination plugins according to the route's delivery mode
pub struct DeliveryCoordinator {
    config: DeliveryConfig,
    dedup: DashMap<String, DedupState>,
    dispatches: AtomicU64,
    stats: Arc<RwLock<DeliveryStats>>,
}

impl DeliveryCoordinator {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            dedup: DashMap::new(),
            dispatches: AtomicU64::new(0),
            stats: Arc::new(RwLock::new(DeliveryStats::default())),
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Deliver one work event for `entry` to `destination`
    pub async fn dispatch(
        &self,
        destination: &PluginRef,
        event: Event,
        entry: &RoutingTableEntry,
        routing_data: Value,
        cancel: &CancellationToken,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        if self.dispatches.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune_expired();
        }

        let mode = entry.delivery_mode;
        let mut delivery = Delivery {
            event,
            routing_data,
            route_hash: entry.hash.clone(),
            mode,
            dedup_key: None,
            attempt: 0,
        };

        let result = match mode {
            DeliveryMode::FireAndForget => {
                return Ok(self.fire_and_forget(destination, &mut delivery, cancel).await)
            }
            DeliveryMode::AtLeastOnce => self.with_retries(destination, &mut delivery, cancel).await,
            DeliveryMode::ExactlyOnce => self.exactly_once(destination, &mut delivery, entry, cancel).await,
        };

        let mut stats = self.stats.write().await;
        match &result {
            Ok(DeliveryOutcome::Delivered { attempts }) => {
                stats.delivered += 1;
                stats.retries += u64::from(attempts.saturating_sub(1));
            }
            Ok(DeliveryOutcome::Suppressed) => stats.suppressed += 1,
            Ok(DeliveryOutcome::Dropped { .. }) => stats.dropped += 1,
            Err(DeliveryError::Exhausted { attempts, .. })
            | Err(DeliveryError::Cancelled { attempts, .. }) => {
                stats.failed += 1;
                stats.retries += u64::from(attempts.saturating_sub(1));
            }
            Err(_) => stats.failed += 1,
        }
        result
    }

    /// Drop acknowledged dedup records whose window has elapsed
    pub fn prune_expired(&self) -> usize {
        let now = current_timestamp();
        let before = self.dedup.len();
        self.dedup.retain(|_, state| match state {
            DedupState::Pending(_) => true,
            DedupState::Acked {
                acked_at,
                window_ms,
                ..
            } => now.saturating_sub(*acked_at) <= *window_ms,
        });
        before.saturating_sub(self.dedup.len())
    }

    /// Number of tracked exactly-once keys
    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    pub async fn stats(&self) -> DeliveryStats {
        self.stats.read().await.clone()
    }

    async fn fire_and_forget(
        &self,
        destination: &PluginRef,
        delivery: &mut Delivery,
        cancel: &CancellationToken,
    ) -> DeliveryOutcome {
        let outcome = match sender_of(destination) {
            Err(e) => Err(e.to_string()),
            Ok(sender) => {
                delivery.attempt = 1;
                match self.attempt(sender, delivery, None, cancel).await {
                    AttemptResult::Acked => Ok(()),
                    AttemptResult::Failed(reason) => Err(reason),
                    AttemptResult::Cancelled => Err("cancelled".to_string()),
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.stats.write().await.delivered += 1;
                DeliveryOutcome::Delivered { attempts: 1 }
            }
            Err(reason) => {
                self.stats.write().await.dropped += 1;
                warn!(
                    "⚠️ Fire-and-forget delivery to {} dropped: {}",
                    short_hash(destination.hash()),
                    reason
                );
                DeliveryOutcome::Dropped { reason }
            }
        }
    }

    async fn exactly_once(
        &self,
        destination: &PluginRef,
        delivery: &mut Delivery,
        entry: &RoutingTableEntry,
        cancel: &CancellationToken,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let key = dedup_key(&delivery.event, &entry.hash);
        let event_ts = Transformer.event_ts(&delivery.event, &entry.event_ts_path);
        let window_ms = if entry.event_ts_period_ms > 0 {
            entry.event_ts_period_ms
        } else {
            self.config.dedup_window_ms
        };

        let mut claim = loop {
            let mut in_flight = match self.dedup.entry(key.clone()) {
                Entry::Occupied(mut slot) => {
                    let acked_ts = match slot.get() {
                        DedupState::Pending(settled) => Err(settled.clone()),
                        DedupState::Acked { event_ts, .. } => Ok(*event_ts),
                    };
                    match acked_ts {
                        Ok(seen_ts) if seen_ts.abs_diff(event_ts) < window_ms => {
                            debug!("Suppressed acknowledged duplicate {}", short_hash(&key));
                            return Ok(DeliveryOutcome::Suppressed);
                        }
                        Ok(_) => {
                            let (claim, settled) = DedupClaim::new(&self.dedup, &key);
                            slot.insert(DedupState::Pending(settled));
                            break claim;
                        }
                        Err(settled) => settled,
                    }
                }
                Entry::Vacant(slot) => {
                    let (claim, settled) = DedupClaim::new(&self.dedup, &key);
                    slot.insert(DedupState::Pending(settled));
                    break claim;
                }
            };

            debug!("Waiting on in-flight duplicate {}", short_hash(&key));
            tokio::select! {
                _ = in_flight.changed() => {}
                _ = cancel.cancelled() => {
                    return Err(DeliveryError::Cancelled {
                        hash: destination.hash().to_string(),
                        attempts: 0,
                    })
                }
            }
        };

        delivery.dedup_key = Some(key.clone());
        let result = self.with_retries(destination, delivery, cancel).await;

        if result.is_ok() {
            claim.acknowledge(DedupState::Acked {
                event_ts,
                acked_at: current_timestamp(),
                window_ms,
            });
        }
        result
    }

    async fn with_retries(
        &self,
        destination: &PluginRef,
        delivery: &mut Delivery,
        cancel: &CancellationToken,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let sender = sender_of(destination)?;
        let hash = destination.hash();
        let max_attempts = self.config.max_attempts.max(1);
        let timeout = Some(self.config.attempt_timeout());
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            delivery.attempt = attempt;
            match self.attempt(sender, delivery, timeout, cancel).await {
                AttemptResult::Acked => return Ok(DeliveryOutcome::Delivered { attempts: attempt }),
                AttemptResult::Cancelled => {
                    return Err(DeliveryError::Cancelled {
                        hash: hash.to_string(),
                        attempts: attempt,
                    })
                }
                AttemptResult::Failed(reason) => {
                    debug!(
                        "Delivery attempt {}/{} to {} failed: {}",
                        attempt,
                        max_attempts,
                        short_hash(hash),
                        reason
                    );
                    last_error = reason;
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.backoff_for(attempt)) => {}
                    _ = cancel.cancelled() => {
                        return Err(DeliveryError::Cancelled {
                            hash: hash.to_string(),
                            attempts: attempt,
                        })
                    }
                }
            }
        }

        Err(DeliveryError::Exhausted {
            hash: hash.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }

    async fn attempt(
        &self,
        sender: &dyn Sender,
        delivery: &Delivery,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> AttemptResult {
        let send = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, sender.send(delivery)).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => {
                        self.stats.write().await.timeouts += 1;
                        Err(format!("no acknowledgment within {}ms", limit.as_millis()))
                    }
                },
                None => sender.send(delivery).await.map_err(|e| e.to_string()),
            }
        };

        tokio::select! {
            result = send => match result {
                Ok(()) => AttemptResult::Acked,
                Err(reason) => AttemptResult::Failed(reason),
            },
            _ = cancel.cancelled() => AttemptResult::Cancelled,
        }
    }
}

fn sender_of(destination: &PluginRef) -> Result<&dyn Sender, DeliveryError> {
    let state = destination.state();
    if state != PluginState::Active {
        return Err(DeliveryError::PluginNotActive {
            hash: destination.hash().to_string(),
            state: state.to_string(),
        });
    }
    destination
        .sender()
        .ok_or_else(|| DeliveryError::NotASender(destination.hash().to_string()))
}

/// Idempotency key for one work event on one route, stable across retries and re-receipt
pub fn dedup_key(event: &Event, route_hash: &str) -> String {
    digest_fields([
        ("payload", event.payload.clone()),
        (
            "split_index",
            event
                .metadata
                .split_index
                .map(Value::from)
                .unwrap_or(Value::Null),
        ),
        ("route", Value::String(route_hash.to_string())),
    ])
}
