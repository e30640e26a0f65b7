//! # EARS Core
//!
//! Event routing core: receives events from input adapters, evaluates them
//! against a routing table and delivers them to output adapters with a
//! per-route delivery guarantee.
//!
//! ## Architecture
//!
//! - **Hasher**: deterministic, key order independent digests used for plugin and route identity
//! - **PluginRegistry**: deduplicated, reference counted adapter instances with a lifecycle
//! - **RoutingTable**: snapshot based route storage with source and destination indexes
//! - **PatternMatcher**: structural containment for match and filter patterns
//! - **Transformer**: template rewrites and array splits of matched events
//! - **EventRouter**: per-event orchestration with per-route failure isolation
//! - **DeliveryCoordinator**: fire-and-forget, at-least-once and exactly-once dispatch
//! - **EventQueue / WorkerPool**: bounded ingress and concurrent routing workers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ears_core::*;
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(factories: Arc<AdapterFactoryRegistry>) -> ears_core::Result<()> {
//! let runtime = Runtime::new(RuntimeConfig::default(), factories);
//! runtime.start().await;
//!
//! let entry = RoutingTableEntry::new(
//!     "partner",
//!     "app",
//!     PluginDescriptor::new("debug", json!({"name": "in"})),
//!     PluginDescriptor::new("debug", json!({"name": "out"})),
//! )
//! .with_match_pattern(json!({"type": "click"}))
//! .with_delivery_mode(DeliveryMode::AtLeastOnce);
//!
//! runtime.table().add_route(entry, &CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod delivery;
pub mod error;
pub mod event;
pub mod hasher;
pub mod matcher;
pub mod model;
pub mod queue;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod table;
pub mod transform;
pub mod utils;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{
    Adapter, AdapterFactory, AdapterFactoryRegistry, Capabilities, Delivery, Filterer,
    FnAdapterFactory, Receiver, Sender,
};
pub use delivery::{DeliveryConfig, DeliveryCoordinator, DeliveryOutcome, DeliveryStats};
pub use error::{
    AdapterError, DeliveryError, EarsError, PatternError, QueueError, RegistryError, RouterError,
    TableError, TransformError,
};
pub use event::{Event, EventMetadata};
pub use hasher::ConfigHash;
pub use matcher::{Matcher, PatternMatcher};
pub use model::{DeliveryMode, PluginDescriptor, RoutingTableEntry};
pub use queue::{EventQueue, EventSink, OverflowPolicy, QueueConfig};
pub use registry::{Plugin, PluginInfo, PluginRef, PluginRegistry, PluginState};
pub use router::{EventRouter, RouteFailure, RouteReport, RouteStage, RouterStats};
pub use runtime::{Runtime, RuntimeConfig, RuntimeStats};
pub use table::{ReplaceSummary, RoutingTable, TableSnapshot};
pub use transform::Transformer;
pub use worker::{PoolStats, WorkerConfig, WorkerPool};

/// Crate version, reported at startup
pub const EARS_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type used throughout the routing core
pub type Result<T> = std::result::Result<T, EarsError>;
