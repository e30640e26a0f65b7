//! Adapter contract and factory registry
//!
//! Concrete input/output connectors implement [`Adapter`] and expose the
//! roles they support through [`Adapter::as_receiver`], [`Adapter::as_filterer`]
//! and [`Adapter::as_sender`]. The registry turns those accessors into a
//! [`Capabilities`] bit set once, when a plugin instance is constructed.
//!
//! Adapter constructors are registered by type name in an
//! [`AdapterFactoryRegistry`] at startup.

use crate::error::{AdapterError, RegistryError};
use crate::event::Event;
use crate::model::{DeliveryMode, PluginDescriptor};
use crate::queue::EventSink;
use async_trait::async_trait;
use bitflags::bitflags;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

bitflags! {
    /// Roles an adapter implementation supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// Produces events
        const RECEIVER = 0b001;
        /// Rewrites or drops events before they are sent
        const FILTERER = 0b010;
        /// Accepts routed events
        const SENDER = 0b100;
    }
}

impl Capabilities {
    /// Capabilities advertised by an adapter
    pub fn of(adapter: &dyn Adapter) -> Self {
        let mut caps = Capabilities::empty();
        caps.set(Capabilities::RECEIVER, adapter.as_receiver().is_some());
        caps.set(Capabilities::FILTERER, adapter.as_filterer().is_some());
        caps.set(Capabilities::SENDER, adapter.as_sender().is_some());
        caps
    }
}

/// One routed event handed to a sender
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The work event
    pub event: Event,
    /// Routing data rendered against the work event
    pub routing_data: Value,
    /// Hash of the route that produced this delivery
    pub route_hash: String,
    /// Delivery mode of the route
    pub mode: DeliveryMode,
    /// Stable idempotency key for exactly-once deliveries, identical across retries
    pub dedup_key: Option<String>,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Base contract every adapter implements
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Adapter type tag
    fn adapter_type(&self) -> &str;

    /// Acquire resources; called once before the plugin becomes active
    async fn start(&self) -> Result<(), AdapterError>;

    /// Release resources; called once when the last route lets go of the plugin
    async fn stop(&self) -> Result<(), AdapterError>;

    fn as_receiver(&self) -> Option<&dyn Receiver> {
        None
    }

    fn as_filterer(&self) -> Option<&dyn Filterer> {
        None
    }

    fn as_sender(&self) -> Option<&dyn Sender> {
        None
    }
}

/// Receiver capability: produces events into the router's entry point
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Produce events into `sink` until `cancel` fires or the source is exhausted
    async fn receive(&self, sink: EventSink, cancel: CancellationToken) -> Result<(), AdapterError>;
}

/// Filter capability: may drop, rewrite or expand an event before it is sent
pub trait Filterer: Send + Sync {
    fn filter(&self, event: Event) -> Result<Vec<Event>, AdapterError>;
}

/// Sender capability: accepts a routed event
#[async_trait]
pub trait Sender: Send + Sync {
    /// Returns once the destination acknowledged the event
    async fn send(&self, delivery: &Delivery) -> Result<(), AdapterError>;
}

/// Constructs adapters of one type from their parameters
pub trait AdapterFactory: Send + Sync {
    /// The adapter type this factory builds
    fn adapter_type(&self) -> &str;

    /// Create a new adapter instance
    fn create(&self, params: &Value) -> Result<Arc<dyn Adapter>, AdapterError>;
}

/// Factory wrapping a constructor function
pub struct FnAdapterFactory<F>
where
    F: Fn(&Value) -> Result<Arc<dyn Adapter>, AdapterError> + Send + Sync,
{
    adapter_type: String,
    constructor: F,
}

impl<F> FnAdapterFactory<F>
where
    F: Fn(&Value) -> Result<Arc<dyn Adapter>, AdapterError> + Send + Sync,
{
    pub fn new(adapter_type: impl Into<String>, constructor: F) -> Self {
        Self {
            adapter_type: adapter_type.into(),
            constructor,
        }
    }
}

impl<F> AdapterFactory for FnAdapterFactory<F>
where
    F: Fn(&Value) -> Result<Arc<dyn Adapter>, AdapterError> + Send + Sync,
{
    fn adapter_type(&self) -> &str {
        &self.adapter_type
    }

    fn create(&self, params: &Value) -> Result<Arc<dyn Adapter>, AdapterError> {
        (self.constructor)(params)
    }
}

/// Adapter constructors keyed by type name
#[derive(Default)]
pub struct AdapterFactoryRegistry {
    factories: DashMap<String, Arc<dyn AdapterFactory>>,
}

impl AdapterFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; an existing registration for the same type is kept
    pub fn register(&self, factory: Arc<dyn AdapterFactory>) -> Result<(), RegistryError> {
        let adapter_type = factory.adapter_type().to_string();
        match self.factories.entry(adapter_type.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::AlreadyRegistered(adapter_type))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(factory);
                info!("🔌 Registered adapter type: {}", adapter_type);
                Ok(())
            }
        }
    }

    /// Register a constructor function for an adapter type
    pub fn register_fn<F>(&self, adapter_type: &str, constructor: F) -> Result<(), RegistryError>
    where
        F: Fn(&Value) -> Result<Arc<dyn Adapter>, AdapterError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnAdapterFactory::new(adapter_type, constructor)))
    }

    /// Remove a registration; returns whether one existed
    pub fn unregister(&self, adapter_type: &str) -> bool {
        self.factories.remove(adapter_type).is_some()
    }

    /// Look up the factory for an adapter type
    pub fn get(&self, adapter_type: &str) -> Result<Arc<dyn AdapterFactory>, RegistryError> {
        self.factories
            .get(adapter_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::UnknownAdapterType(adapter_type.to_string()))
    }

    /// Construct an adapter for a descriptor
    pub fn create(&self, descriptor: &PluginDescriptor) -> Result<Arc<dyn Adapter>, RegistryError> {
        let factory = self.get(&descriptor.plugin_type)?;
        factory
            .create(&descriptor.params)
            .map_err(|source| RegistryError::AdapterCreateFailed {
                plugin_type: descriptor.plugin_type.clone(),
                source,
            })
    }

    /// Registered adapter type names, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub fn contains(&self, adapter_type: &str) -> bool {
        self.factories.contains_key(adapter_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAdapter;
    use serde_json::json;

    #[test]
    fn test_capabilities_from_accessors() {
        let sender = MockAdapter::sender();
        let receiver = MockAdapter::receiver();
        let both = MockAdapter::new(Capabilities::RECEIVER | Capabilities::SENDER);

        assert_eq!(Capabilities::of(&sender), Capabilities::SENDER);
        assert_eq!(Capabilities::of(&receiver), Capabilities::RECEIVER);
        assert!(Capabilities::of(&both).contains(Capabilities::RECEIVER | Capabilities::SENDER));
        assert!(!Capabilities::of(&both).contains(Capabilities::FILTERER));
    }

    #[test]
    fn test_duplicate_registration_keeps_existing() {
        let factories = AdapterFactoryRegistry::new();
        factories
            .register_fn("mock", |_| Ok(Arc::new(MockAdapter::sender()) as Arc<dyn Adapter>))
            .unwrap();

        let second = factories.register_fn("mock", |_| {
            Ok(Arc::new(MockAdapter::receiver()) as Arc<dyn Adapter>)
        });
        assert!(matches!(second, Err(RegistryError::AlreadyRegistered(t)) if t == "mock"));

        let adapter = factories
            .create(&PluginDescriptor::new("mock", json!({})))
            .unwrap();
        assert_eq!(Capabilities::of(adapter.as_ref()), Capabilities::SENDER);
    }

    #[test]
    fn test_unknown_type() {
        let factories = AdapterFactoryRegistry::new();
        let result = factories.create(&PluginDescriptor::new("kafka", json!({})));
        assert!(matches!(result, Err(RegistryError::UnknownAdapterType(t)) if t == "kafka"));
    }

    #[test]
    fn test_factory_errors_are_wrapped() {
        let factories = AdapterFactoryRegistry::new();
        factories
            .register_fn("picky", |_| Err(AdapterError::InvalidParams("no".into())))
            .unwrap();

        let result = factories.create(&PluginDescriptor::new("picky", json!({})));
        assert!(matches!(result, Err(RegistryError::AdapterCreateFailed { .. })));
        assert_eq!(factories.types(), vec!["picky".to_string()]);
        assert!(factories.unregister("picky"));
        assert!(!factories.contains("picky"));
    }
}
