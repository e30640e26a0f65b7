//! Error types for the routing core

use crate::router::RouteReport;

/// Errors raised by adapter implementations (start, stop, send, filter)
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// The adapter rejected its configuration parameters
    #[error("Invalid adapter parameters: {0}")]
    InvalidParams(String),

    /// The adapter operation failed
    #[error("Adapter operation failed: {0}")]
    Failed(String),

    /// The adapter is not in a state that allows the operation
    #[error("Adapter unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the plugin registry and the adapter factory registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No factory registered for the adapter type
    #[error("Unknown adapter type: {0}")]
    UnknownAdapterType(String),

    /// A factory for this adapter type already exists
    #[error("Adapter type already registered: {0}")]
    AlreadyRegistered(String),

    /// The factory could not construct the adapter
    #[error("Failed to create adapter {plugin_type}: {source}")]
    AdapterCreateFailed {
        plugin_type: String,
        #[source]
        source: AdapterError,
    },

    /// The adapter's start operation failed
    #[error("Failed to start plugin {hash}: {source}")]
    AdapterStartFailed {
        hash: String,
        #[source]
        source: AdapterError,
    },

    /// The adapter's stop operation failed
    #[error("Failed to stop plugin {hash}: {source}")]
    AdapterStopFailed {
        hash: String,
        #[source]
        source: AdapterError,
    },

    /// Plugin not found
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Lifecycle transition not allowed from the plugin's current state
    #[error("Invalid plugin state for {hash}: {state}")]
    InvalidState { hash: String, state: String },
}

/// Errors raised by routing table mutations and queries
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// Missing required field or invalid parameter
    #[error("Invalid routing entry: {0}")]
    InvalidConfiguration(String),

    /// A client supplied a hash that does not match the entry's configuration
    #[error("Hash mismatch for {field}: supplied {supplied}, computed {computed}")]
    HashMismatch {
        field: &'static str,
        supplied: String,
        computed: String,
    },

    /// The event's source plugin is not registered
    #[error("Source plugin not found: {0}")]
    SourcePluginNotFound(String),

    /// Plugin lifecycle failure while applying the mutation
    #[error("Plugin registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The mutation was cancelled before being applied
    #[error("Routing table operation cancelled")]
    Cancelled,
}

/// Errors raised while evaluating a pattern
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    /// Pattern nesting exceeds the supported depth
    #[error("Pattern nesting exceeds maximum depth of {0}")]
    TooDeep(usize),

    /// Pattern object contains an empty key
    #[error("Pattern contains an empty key")]
    EmptyKey,
}

/// Errors raised while transforming or splitting an event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    /// A payload path could not be parsed
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Errors raised by the delivery coordinator
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The destination plugin cannot send events
    #[error("Plugin {0} is not a sender")]
    NotASender(String),

    /// The destination plugin is not active
    #[error("Plugin {hash} is not active (state: {state})")]
    PluginNotActive { hash: String, state: String },

    /// All attempts failed
    #[error("Delivery to {hash} failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        hash: String,
        attempts: u32,
        last_error: String,
    },

    /// Cancellation arrived while the delivery was in flight
    #[error("Delivery to {hash} cancelled after {attempts} attempt(s)")]
    Cancelled { hash: String, attempts: u32 },
}

/// Errors raised by the event queue
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue is at capacity and configured to reject
    #[error("Event queue is full (capacity {0})")]
    Full(usize),

    /// The queue has been closed
    #[error("Event queue is closed")]
    Closed,

    /// The wait was cancelled
    #[error("Event queue operation cancelled")]
    Cancelled,
}

/// Errors raised by the event router
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// No candidate route could be evaluated for the event
    #[error("Cannot resolve routes for event: {0}")]
    Unroutable(#[from] TableError),

    /// One or more routes failed; the report also carries the successes
    #[error("{} of {} route(s) failed for event {}", .0.failures.len(), .0.candidates, .0.event_id)]
    RouteFailures(RouteReport),
}

/// Top-level error type for the routing core
#[derive(Debug, thiserror::Error)]
pub enum EarsError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Router(#[from] RouterError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EarsError {
    fn from(err: serde_json::Error) -> Self {
        EarsError::Serialization(err.to_string())
    }
}
