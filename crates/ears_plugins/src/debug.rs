//! Debug adapter
//!
//! As a receiver it emits the payloads listed in its `events` parameter,
//! optionally repeated and spaced out. As a sender it logs every delivery
//! and keeps the most recent ones in a bounded history.

use async_trait::async_trait;
use ears_core::{
    Adapter, AdapterError, Delivery, EventSink, QueueError, Receiver, Sender,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEBUG_ADAPTER_TYPE: &str = "debug";

/// Parameters of a debug adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebugParams {
    /// Free-form label; distinguishes otherwise identical debug plugins
    #[serde(default)]
    pub name: Option<String>,
    /// Payloads emitted when receiving
    #[serde(default)]
    pub events: Vec<Value>,
    /// Times the `events` list is emitted
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    /// Pause between emitted events
    #[serde(default)]
    pub interval_ms: u64,
    /// Number of deliveries kept in the history
    #[serde(default = "default_history")]
    pub history: usize,
    /// Log each delivery at info level
    #[serde(default = "default_log")]
    pub log: bool,
}

fn default_rounds() -> u32 {
    1
}

fn default_history() -> usize {
    100
}

fn default_log() -> bool {
    true
}

impl Default for DebugParams {
    fn default() -> Self {
        Self {
            name: None,
            events: Vec::new(),
            rounds: default_rounds(),
            interval_ms: 0,
            history: default_history(),
            log: default_log(),
        }
    }
}

impl DebugParams {
    /// Parse adapter parameters; `null` means all defaults
    pub fn from_value(params: &Value) -> Result<Self, AdapterError> {
        if params.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(params.clone()).map_err(|e| AdapterError::InvalidParams(e.to_string()))
    }
}

/// Receiver and sender used for wiring checks and demos
pub struct DebugAdapter {
    params: DebugParams,
    history: Mutex<VecDeque<Delivery>>,
    received: AtomicU64,
}

impl DebugAdapter {
    pub fn new(params: DebugParams) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(params.history.min(1024))),
            params,
            received: AtomicU64::new(0),
        }
    }

    pub fn params(&self) -> &DebugParams {
        &self.params
    }

    /// Most recent deliveries, oldest first
    pub async fn history(&self) -> Vec<Delivery> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Total deliveries accepted, including those evicted from the history
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn label(&self) -> &str {
        self.params.name.as_deref().unwrap_or(DEBUG_ADAPTER_TYPE)
    }
}

#[async_trait]
impl Adapter for DebugAdapter {
    fn adapter_type(&self) -> &str {
        DEBUG_ADAPTER_TYPE
    }

    async fn start(&self) -> Result<(), AdapterError> {
        debug!("Debug adapter {} started", self.label());
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        debug!(
            "Debug adapter {} stopped after {} deliveries",
            self.label(),
            self.received()
        );
        Ok(())
    }

    fn as_receiver(&self) -> Option<&dyn Receiver> {
        Some(self)
    }

    fn as_sender(&self) -> Option<&dyn Sender> {
        Some(self)
    }
}

#[async_trait]
impl Receiver for DebugAdapter {
    async fn receive(&self, sink: EventSink, cancel: CancellationToken) -> Result<(), AdapterError> {
        let interval = Duration::from_millis(self.params.interval_ms);

        for _ in 0..self.params.rounds {
            for payload in &self.params.events {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                match sink.emit(payload.clone()).await {
                    Ok(()) => {}
                    Err(QueueError::Closed) | Err(QueueError::Cancelled) => return Ok(()),
                    Err(e) => return Err(AdapterError::Failed(e.to_string())),
                }
                if !interval.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = cancel.cancelled() => return Ok(()),
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Sender for DebugAdapter {
    async fn send(&self, delivery: &Delivery) -> Result<(), AdapterError> {
        self.received.fetch_add(1, Ordering::Relaxed);
        if self.params.log {
            info!(
                target: "ears::debug",
                adapter = %self.label(),
                route = %delivery.route_hash,
                event = %delivery.event.id(),
                attempt = delivery.attempt,
                payload = %delivery.event.payload,
                "event delivered"
            );
        }

        if self.params.history > 0 {
            let mut history = self.history.lock().await;
            while history.len() >= self.params.history {
                history.pop_front();
            }
            history.push_back(delivery.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ears_core::{DeliveryMode, Event, EventQueue, QueueConfig};
    use serde_json::json;
    use std::sync::Arc;

    fn delivery(n: i64) -> Delivery {
        Delivery {
            event: Event::new(json!({"n": n}), "src"),
            routing_data: Value::Null,
            route_hash: "route".to_string(),
            mode: DeliveryMode::FireAndForget,
            dedup_key: None,
            attempt: 1,
        }
    }

    #[test]
    fn test_params() {
        let params = DebugParams::from_value(&json!({"events": [1, 2], "rounds": 3})).unwrap();
        assert_eq!(params.events.len(), 2);
        assert_eq!(params.rounds, 3);
        assert_eq!(params.history, 100);

        assert_eq!(DebugParams::from_value(&Value::Null).unwrap(), DebugParams::default());
        assert!(matches!(
            DebugParams::from_value(&json!({"bogus": true})),
            Err(AdapterError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let adapter = DebugAdapter::new(DebugParams {
            history: 2,
            log: false,
            ..DebugParams::default()
        });

        for n in 0..5 {
            adapter.send(&delivery(n)).await.unwrap();
        }

        let kept: Vec<Value> = adapter
            .history()
            .await
            .into_iter()
            .map(|d| d.event.payload)
            .collect();
        assert_eq!(kept, vec![json!({"n": 3}), json!({"n": 4})]);
        assert_eq!(adapter.received(), 5);
    }

    #[tokio::test]
    async fn test_receiver_emits_rounds() {
        let adapter = DebugAdapter::new(DebugParams {
            events: vec![json!("a"), json!("b")],
            rounds: 2,
            ..DebugParams::default()
        });
        let queue = Arc::new(EventQueue::new(&QueueConfig::default()));
        let cancel = CancellationToken::new();

        adapter
            .receive(EventSink::new(queue.clone(), "me", cancel.clone()), cancel.clone())
            .await
            .unwrap();

        assert_eq!(queue.count().unwrap(), 4);
        let mut payloads = Vec::new();
        for _ in 0..4 {
            payloads.push(queue.next_event(&cancel).await.unwrap().payload);
        }
        assert_eq!(payloads, vec![json!("a"), json!("b"), json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn test_receiver_stops_on_cancel() {
        let adapter = DebugAdapter::new(DebugParams {
            events: vec![json!(1)],
            rounds: 1_000,
            interval_ms: 1_000,
            ..DebugParams::default()
        });
        let queue = Arc::new(EventQueue::new(&QueueConfig::default()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        tokio::time::timeout(
            Duration::from_secs(1),
            adapter.receive(EventSink::new(queue.clone(), "me", cancel.clone()), cancel),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(queue.count().unwrap(), 1);
    }
}
