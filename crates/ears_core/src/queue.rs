//! Bounded event queue between receivers and routing workers

use crate::error::QueueError;
use crate::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What `add_event` does when the queue is at capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for room (or cancellation)
    #[default]
    Block,
    /// Fail immediately with [`QueueError::Full`]
    Reject,
}

/// Event queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of queued events
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_capacity() -> usize {
    10_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Multi-producer, multi-consumer bounded queue of inbound events
pub struct EventQueue {
    sender: mpsc::Sender<Event>,
    receiver: Mutex<mpsc::Receiver<Event>>,
    overflow: OverflowPolicy,
    closed: CancellationToken,
}

impl EventQueue {
    pub fn new(config: &QueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
            overflow: config.overflow,
            closed: CancellationToken::new(),
        }
    }

    /// Enqueue an event according to the overflow policy
    pub async fn add_event(&self, event: Event, cancel: &CancellationToken) -> Result<(), QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }

        match self.overflow {
            OverflowPolicy::Reject => self.sender.try_send(event).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => QueueError::Full(self.max_count()),
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            }),
            OverflowPolicy::Block => tokio::select! {
                sent = self.sender.send(event) => sent.map_err(|_| QueueError::Closed),
                _ = cancel.cancelled() => Err(QueueError::Cancelled),
                _ = self.closed.cancelled() => Err(QueueError::Closed),
            },
        }
    }

    /// Wait for the next event.
    ///
    /// After [`close`](Self::close) the remaining events are still handed out;
    /// once they are drained this returns [`QueueError::Closed`].
    pub async fn next_event(&self, cancel: &CancellationToken) -> Result<Event, QueueError> {
        let mut receiver = tokio::select! {
            guard = self.receiver.lock() => guard,
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
        };

        if self.closed.is_cancelled() {
            return receiver.try_recv().map_err(|_| QueueError::Closed);
        }

        tokio::select! {
            event = receiver.recv() => event.ok_or(QueueError::Closed),
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            _ = self.closed.cancelled() => receiver.try_recv().map_err(|_| QueueError::Closed),
        }
    }

    /// Number of events currently queued
    pub fn count(&self) -> Result<usize, QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }
        Ok(self.max_count() - self.sender.capacity())
    }

    /// Queue capacity
    pub fn max_count(&self) -> usize {
        self.sender.max_capacity()
    }

    /// Stop accepting events; queued events remain available to `next_event`
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!("Event queue closed");
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Handle a receiver uses to push events into the queue, stamped with its plugin hash
#[derive(Clone)]
pub struct EventSink {
    queue: Arc<EventQueue>,
    source: String,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn new(queue: Arc<EventQueue>, source: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            queue,
            source: source.into(),
            cancel,
        }
    }

    /// Hash of the plugin this sink belongs to
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Wrap a payload in a new event from this source and enqueue it
    pub async fn emit(&self, payload: Value) -> Result<(), QueueError> {
        self.queue
            .add_event(Event::new(payload, self.source.clone()), &self.cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn queue(capacity: usize, overflow: OverflowPolicy) -> EventQueue {
        EventQueue::new(&QueueConfig { capacity, overflow })
    }

    #[tokio::test]
    async fn test_fifo_and_count() {
        let q = queue(4, OverflowPolicy::Block);
        let cancel = CancellationToken::new();

        for i in 0..3 {
            q.add_event(Event::new(json!(i), "src"), &cancel).await.unwrap();
        }
        assert_eq!(q.count().unwrap(), 3);
        assert_eq!(q.max_count(), 4);

        for i in 0..3 {
            assert_eq!(q.next_event(&cancel).await.unwrap().payload, json!(i));
        }
        assert_eq!(q.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reject_when_full() {
        let q = queue(1, OverflowPolicy::Reject);
        let cancel = CancellationToken::new();

        q.add_event(Event::new(json!(1), "src"), &cancel).await.unwrap();
        let err = q.add_event(Event::new(json!(2), "src"), &cancel).await;
        assert_eq!(err, Err(QueueError::Full(1)));
    }

    #[tokio::test]
    async fn test_block_until_cancelled() {
        let q = queue(1, OverflowPolicy::Block);
        let cancel = CancellationToken::new();
        q.add_event(Event::new(json!(1), "src"), &cancel).await.unwrap();

        let blocked = CancellationToken::new();
        let trigger = blocked.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = q.add_event(Event::new(json!(2), "src"), &blocked).await;
        assert_eq!(result, Err(QueueError::Cancelled));
    }

    #[tokio::test]
    async fn test_next_event_cancelled() {
        let q = queue(1, OverflowPolicy::Block);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(q.next_event(&cancel).await, Err(QueueError::Cancelled));
    }

    #[tokio::test]
    async fn test_close_drains_then_reports_closed() {
        let q = queue(4, OverflowPolicy::Block);
        let cancel = CancellationToken::new();
        q.add_event(Event::new(json!("last"), "src"), &cancel).await.unwrap();

        q.close();
        assert_eq!(q.count(), Err(QueueError::Closed));
        assert_eq!(
            q.add_event(Event::new(json!("late"), "src"), &cancel).await,
            Err(QueueError::Closed)
        );
        assert_eq!(q.next_event(&cancel).await.unwrap().payload, json!("last"));
        assert_eq!(q.next_event(&cancel).await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_sink_stamps_source() {
        let q = Arc::new(queue(2, OverflowPolicy::Block));
        let sink = EventSink::new(q.clone(), "plugin-hash", CancellationToken::new());

        sink.emit(json!({"a": 1})).await.unwrap();
        let event = q.next_event(&CancellationToken::new()).await.unwrap();
        assert_eq!(event.source, "plugin-hash");
        assert_eq!(sink.source(), "plugin-hash");
    }
}
