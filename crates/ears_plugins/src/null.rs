//! Sender that acknowledges and discards every event

use async_trait::async_trait;
use ears_core::{Adapter, AdapterError, Delivery, Sender};
use std::sync::atomic::{AtomicU64, Ordering};

pub const NULL_ADAPTER_TYPE: &str = "null";

#[derive(Debug, Default)]
pub struct NullAdapter {
    discarded: AtomicU64,
}

impl NullAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Adapter for NullAdapter {
    fn adapter_type(&self) -> &str {
        NULL_ADAPTER_TYPE
    }

    async fn start(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn as_sender(&self) -> Option<&dyn Sender> {
        Some(self)
    }
}

#[async_trait]
impl Sender for NullAdapter {
    async fn send(&self, _delivery: &Delivery) -> Result<(), AdapterError> {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ears_core::{Capabilities, DeliveryMode, Event};
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_discards_and_counts() {
        let adapter = NullAdapter::new();
        assert_eq!(Capabilities::of(&adapter), Capabilities::SENDER);

        let delivery = Delivery {
            event: Event::new(json!({}), "src"),
            routing_data: Value::Null,
            route_hash: "r".to_string(),
            mode: DeliveryMode::AtLeastOnce,
            dedup_key: None,
            attempt: 1,
        };
        adapter.send(&delivery).await.unwrap();
        adapter.send(&delivery).await.unwrap();
        assert_eq!(adapter.discarded(), 2);
    }
}
