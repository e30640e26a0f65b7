//! Events flowing from receivers through the router to senders

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event metadata carried alongside the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event id, shared by every work event split from the same source event
    pub id: String,
    /// Receipt timestamp in milliseconds since the epoch
    pub ts: u64,
    /// Position within the source array when the event was produced by a split
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_index: Option<usize>,
}

impl EventMetadata {
    /// Metadata stamped with a fresh id and the current time
    pub fn now() -> Self {
        Self {
            id: crate::utils::generate_id(),
            ts: crate::utils::current_timestamp(),
            split_index: None,
        }
    }
}

/// One unit of work: a payload, its metadata and the hash of the plugin that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Opaque structured payload
    pub payload: Value,
    /// Event metadata
    pub metadata: EventMetadata,
    /// Identity hash of the source plugin
    pub source: String,
}

impl Event {
    /// Create a new event received now from the given source plugin
    pub fn new(payload: Value, source: impl Into<String>) -> Self {
        Self {
            payload,
            metadata: EventMetadata::now(),
            source: source.into(),
        }
    }

    /// Override the receipt timestamp
    pub fn with_ts(mut self, ts: u64) -> Self {
        self.metadata.ts = ts;
        self
    }

    /// Copy of this event with a different payload, metadata carried forward
    pub fn with_payload(&self, payload: Value) -> Self {
        Self {
            payload,
            metadata: self.metadata.clone(),
            source: self.source.clone(),
        }
    }

    /// Short id for log output
    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}
