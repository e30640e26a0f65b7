//! Plugin registry
//!
//! Owns every live adapter instance, keyed by the identity hash of its
//! descriptor. Identical descriptors share one instance whose reference
//! count equals the number of route references held on it. All mutations run
//! under a single async writer lock so that a count change and the lifecycle
//! transition it triggers are one atomic unit; lookups read the concurrent
//! map directly.
//!
//! The registry stores identity and state only. Which routes use a plugin is
//! answered by the routing table's reverse index.

use crate::adapter::{Adapter, AdapterFactoryRegistry, Capabilities, Filterer, Sender};
use crate::error::RegistryError;
use crate::hasher::ConfigHash;
use crate::model::PluginDescriptor;
use crate::queue::{EventQueue, EventSink};
use crate::utils::{current_timestamp, short_hash};
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a plugin instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PluginState {
    Created = 0,
    Starting = 1,
    Active = 2,
    Stopping = 3,
    Stopped = 4,
    Error = 5,
}

impl PluginState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PluginState::Created,
            1 => PluginState::Starting,
            2 => PluginState::Active,
            3 => PluginState::Stopping,
            4 => PluginState::Stopped,
            _ => PluginState::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Created => "created",
            PluginState::Starting => "starting",
            PluginState::Active => "active",
            PluginState::Stopping => "stopping",
            PluginState::Stopped => "stopped",
            PluginState::Error => "error",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deduplicated, reference counted adapter instance
pub struct Plugin {
    hash: String,
    plugin_type: String,
    params: Value,
    capabilities: Capabilities,
    adapter: Arc<dyn Adapter>,
    state: AtomicU8,
    ref_count: AtomicUsize,
    receiving: ArcSwapOption<CancellationToken>,
    receiver_started: AtomicBool,
    created_at: u64,
}

/// Shared handle to a registered plugin
pub type PluginRef = Arc<Plugin>;

impl Plugin {
    fn new(hash: String, descriptor: &PluginDescriptor, adapter: Arc<dyn Adapter>) -> Self {
        let capabilities = Capabilities::of(adapter.as_ref());
        Self {
            hash,
            plugin_type: descriptor.plugin_type.clone(),
            params: descriptor.params.clone(),
            capabilities,
            adapter,
            state: AtomicU8::new(PluginState::Created as u8),
            ref_count: AtomicUsize::new(0),
            receiving: ArcSwapOption::empty(),
            receiver_started: AtomicBool::new(false),
            created_at: current_timestamp(),
        }
    }

    /// Identity hash of the plugin's configuration
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn plugin_type(&self) -> &str {
        &self.plugin_type
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn has(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn state(&self) -> PluginState {
        PluginState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of route references currently held on this plugin
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn sender(&self) -> Option<&dyn Sender> {
        self.adapter.as_sender()
    }

    pub fn filterer(&self) -> Option<&dyn Filterer> {
        self.adapter.as_filterer()
    }

    /// Serializable snapshot for control-plane listings
    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            hash: self.hash.clone(),
            plugin_type: self.plugin_type.clone(),
            params: self.params.clone(),
            state: self.state(),
            ref_count: self.ref_count(),
            is_input: self.has(Capabilities::RECEIVER),
            is_filter: self.has(Capabilities::FILTERER),
            is_output: self.has(Capabilities::SENDER),
            created_at: self.created_at,
        }
    }

    fn set_state(&self, state: PluginState) {
        self.state.store(state as u8, Ordering::Release);
    }

    // Marks the plugin failed unless it has already moved on
    fn fail_if(&self, expected: PluginState) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                PluginState::Error as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("hash", &self.hash)
            .field("plugin_type", &self.plugin_type)
            .field("capabilities", &self.capabilities)
            .field("state", &self.state())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Plugin listing entry
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub hash: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub params: Value,
    pub state: PluginState,
    pub ref_count: usize,
    pub is_input: bool,
    pub is_filter: bool,
    pub is_output: bool,
    pub created_at: u64,
}

/// Registry of live plugin instances
pub struct PluginRegistry {
    plugins: DashMap<String, PluginRef>,
    write_lock: Mutex<()>,
    factories: Arc<AdapterFactoryRegistry>,
    ingress: Option<Arc<EventQueue>>,
    shutdown: CancellationToken,
}

impl PluginRegistry {
    /// Create a registry without an ingress queue; receivers are started but never driven
    pub fn new(factories: Arc<AdapterFactoryRegistry>) -> Self {
        Self {
            plugins: DashMap::new(),
            write_lock: Mutex::new(()),
            factories,
            ingress: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Drive receiver plugins into the given queue once they are active
    pub fn with_ingress(mut self, queue: Arc<EventQueue>) -> Self {
        self.ingress = Some(queue);
        self
    }

    pub fn factories(&self) -> &Arc<AdapterFactoryRegistry> {
        &self.factories
    }

    /// Acquire a reference on the plugin for a descriptor, creating and starting it if needed
    pub async fn add_plugin(&self, descriptor: &PluginDescriptor) -> Result<PluginRef, RegistryError> {
        let hash = descriptor.config_hash();
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.plugins.get(&hash).map(|p| p.value().clone()) {
            if existing.state() == PluginState::Error {
                warn!(
                    "⚠️ Joining plugin {} ({}) which is in error state",
                    short_hash(&hash),
                    existing.plugin_type
                );
            }
            let count = existing.ref_count.fetch_add(1, Ordering::AcqRel) + 1;
            debug!("Plugin {} reference count -> {}", short_hash(&hash), count);
            return Ok(existing);
        }

        let adapter = self.factories.create(descriptor)?;
        let plugin = Arc::new(Plugin::new(hash.clone(), descriptor, adapter));
        self.start_plugin(&plugin).await?;

        plugin.ref_count.store(1, Ordering::Release);
        self.plugins.insert(hash.clone(), plugin.clone());
        info!(
            "✅ Plugin started: {} ({}) {:?}",
            plugin.plugin_type,
            short_hash(&hash),
            plugin.capabilities
        );
        Ok(plugin)
    }

    /// Release one reference; the last release stops and removes the plugin.
    ///
    /// Releasing a hash that is not registered is a no-op.
    pub async fn remove_plugin(&self, hash: &str) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;

        let Some(plugin) = self.plugins.get(hash).map(|p| p.value().clone()) else {
            return Ok(());
        };

        let count = plugin.ref_count();
        if count > 1 {
            plugin.ref_count.store(count - 1, Ordering::Release);
            debug!("Plugin {} reference count -> {}", short_hash(hash), count - 1);
            return Ok(());
        }

        plugin.ref_count.store(0, Ordering::Release);
        self.plugins.remove(hash);
        self.stop_plugin(&plugin).await
    }

    /// Restart a plugin that is in the error state
    pub async fn restart(&self, hash: &str) -> Result<PluginRef, RegistryError> {
        let _guard = self.write_lock.lock().await;

        let plugin = self
            .plugins
            .get(hash)
            .map(|p| p.value().clone())
            .ok_or_else(|| RegistryError::PluginNotFound(hash.to_string()))?;

        let state = plugin.state();
        if state != PluginState::Error {
            return Err(RegistryError::InvalidState {
                hash: hash.to_string(),
                state: state.to_string(),
            });
        }

        info!("🔄 Restarting plugin {} ({})", plugin.plugin_type, short_hash(hash));
        self.start_plugin(&plugin).await?;
        self.start_receiving(&plugin);
        Ok(plugin)
    }

    pub fn lookup(&self, hash: &str) -> Option<PluginRef> {
        self.plugins.get(hash).map(|p| p.value().clone())
    }

    /// Plugins supporting every capability in `capability`
    pub fn by_capability(&self, capability: Capabilities) -> Vec<PluginRef> {
        self.collect(|p| p.has(capability))
    }

    pub fn by_type(&self, plugin_type: &str) -> Vec<PluginRef> {
        self.collect(|p| p.plugin_type == plugin_type)
    }

    pub fn by_state(&self, state: PluginState) -> Vec<PluginRef> {
        self.collect(|p| p.state() == state)
    }

    pub fn all(&self) -> Vec<PluginRef> {
        self.collect(|_| true)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Stop every plugin regardless of reference count
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().await;
        self.shutdown.cancel();

        let plugins: Vec<PluginRef> = self.plugins.iter().map(|p| p.value().clone()).collect();
        self.plugins.clear();

        let mut first_error = None;
        for plugin in plugins {
            plugin.ref_count.store(0, Ordering::Release);
            if let Err(e) = self.stop_plugin(&plugin).await {
                error!("❌ {}", e);
                first_error.get_or_insert(e);
            }
        }

        info!("🧹 Plugin registry shut down");
        first_error.map_or(Ok(()), Err)
    }

    /// Begin driving an active receiver plugin into the ingress queue.
    ///
    /// Does nothing without an ingress queue, for plugins that cannot
    /// receive, or when the plugin is already being driven. The task stops
    /// when the plugin is stopped or the registry shuts down.
    pub fn start_receiving(&self, plugin: &PluginRef) {
        let Some(queue) = self.ingress.clone() else {
            return;
        };
        if !plugin.has(Capabilities::RECEIVER) || plugin.state() != PluginState::Active {
            return;
        }
        if plugin.receiver_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let token = self.shutdown.child_token();
        plugin.receiving.store(Some(Arc::new(token.clone())));
        let plugin = plugin.clone();

        tokio::spawn(async move {
            let Some(receiver) = plugin.adapter.as_receiver() else {
                return;
            };
            let sink = EventSink::new(queue, plugin.hash.clone(), token.clone());
            match receiver.receive(sink, token).await {
                Ok(()) => debug!("Receiver {} finished", short_hash(&plugin.hash)),
                Err(e) => {
                    if plugin.fail_if(PluginState::Active) {
                        plugin.receiver_started.store(false, Ordering::Release);
                        error!(
                            "❌ Receiver {} ({}) failed: {}",
                            plugin.plugin_type,
                            short_hash(&plugin.hash),
                            e
                        );
                    }
                }
            }
        });
    }

    fn collect(&self, predicate: impl Fn(&Plugin) -> bool) -> Vec<PluginRef> {
        let mut plugins: Vec<PluginRef> = self
            .plugins
            .iter()
            .filter(|p| predicate(p.value()))
            .map(|p| p.value().clone())
            .collect();
        plugins.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.hash.cmp(&b.hash))
        });
        plugins
    }

    async fn start_plugin(&self, plugin: &PluginRef) -> Result<(), RegistryError> {
        plugin.set_state(PluginState::Starting);

        if let Err(source) = plugin.adapter.start().await {
            plugin.set_state(PluginState::Error);
            error!(
                "❌ Failed to start plugin {} ({}): {}",
                plugin.plugin_type,
                short_hash(&plugin.hash),
                source
            );
            return Err(RegistryError::AdapterStartFailed {
                hash: plugin.hash.clone(),
                source,
            });
        }

        plugin.set_state(PluginState::Active);
        Ok(())
    }

    async fn stop_plugin(&self, plugin: &PluginRef) -> Result<(), RegistryError> {
        if let Some(token) = plugin.receiving.swap(None) {
            token.cancel();
        }
        plugin.receiver_started.store(false, Ordering::Release);

        if plugin.state() == PluginState::Stopped {
            return Ok(());
        }

        plugin.set_state(PluginState::Stopping);
        match plugin.adapter.stop().await {
            Ok(()) => {
                plugin.set_state(PluginState::Stopped);
                info!(
                    "🛑 Plugin stopped: {} ({})",
                    plugin.plugin_type,
                    short_hash(&plugin.hash)
                );
                Ok(())
            }
            Err(source) => {
                plugin.set_state(PluginState::Error);
                Err(RegistryError::AdapterStopFailed {
                    hash: plugin.hash.clone(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use crate::testing::{mock_descriptor, MockFactory};
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> (PluginRegistry, Arc<MockFactory>) {
        let (factories, mocks) = MockFactory::registry();
        (PluginRegistry::new(factories), mocks)
    }

    #[tokio::test]
    async fn test_dedup_and_refcount() {
        let (registry, mocks) = registry();
        let descriptor = mock_descriptor("out", &["sender"]);

        let a = registry.add_plugin(&descriptor).await.unwrap();
        let b = registry.add_plugin(&descriptor).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.ref_count(), 2);
        assert_eq!(a.state(), PluginState::Active);
        assert_eq!(registry.len(), 1);
        assert_eq!(mocks.instance("out").unwrap().starts(), 1);

        registry.remove_plugin(a.hash()).await.unwrap();
        assert_eq!(a.ref_count(), 1);
        assert_eq!(a.state(), PluginState::Active);

        registry.remove_plugin(a.hash()).await.unwrap();
        assert_eq!(a.state(), PluginState::Stopped);
        assert!(registry.lookup(a.hash()).is_none());
        assert_eq!(mocks.instance("out").unwrap().stops(), 1);

        // already gone
        registry.remove_plugin(a.hash()).await.unwrap();
        assert_eq!(mocks.instance("out").unwrap().stops(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_adds_construct_once() {
        let (registry, mocks) = registry();
        let registry = Arc::new(registry);
        let descriptor = mock_descriptor("shared", &["sender"]);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let descriptor = descriptor.clone();
                tokio::spawn(async move { registry.add_plugin(&descriptor).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(mocks.created("shared"), 1);
        assert_eq!(registry.all()[0].ref_count(), 8);
    }

    #[tokio::test]
    async fn test_start_failure_is_not_registered() {
        let (registry, _mocks) = registry();
        let mut descriptor = mock_descriptor("broken", &["sender"]);
        descriptor.params["fail_start"] = json!(true);

        let result = registry.add_plugin(&descriptor).await;
        assert!(matches!(result, Err(RegistryError::AdapterStartFailed { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let (registry, _mocks) = registry();
        let result = registry
            .add_plugin(&PluginDescriptor::new("kafka", json!({})))
            .await;
        assert!(matches!(result, Err(RegistryError::UnknownAdapterType(_))));
    }

    #[tokio::test]
    async fn test_queries() {
        let (registry, _mocks) = registry();
        registry.add_plugin(&mock_descriptor("in", &["receiver"])).await.unwrap();
        registry.add_plugin(&mock_descriptor("out", &["sender"])).await.unwrap();
        registry
            .add_plugin(&mock_descriptor("both", &["receiver", "sender", "filterer"]))
            .await
            .unwrap();

        assert_eq!(registry.by_capability(Capabilities::SENDER).len(), 2);
        assert_eq!(registry.by_capability(Capabilities::RECEIVER).len(), 2);
        assert_eq!(
            registry
                .by_capability(Capabilities::RECEIVER | Capabilities::FILTERER)
                .len(),
            1
        );
        assert_eq!(registry.by_type("mock").len(), 3);
        assert_eq!(registry.by_state(PluginState::Active).len(), 3);

        let info = registry.by_capability(Capabilities::FILTERER)[0].info();
        assert!(info.is_input && info.is_output && info.is_filter);
        assert_eq!(serde_json::to_value(&info).unwrap()["state"], json!("active"));
    }

    #[tokio::test]
    async fn test_restart_requires_error_state() {
        let (registry, _mocks) = registry();
        let plugin = registry
            .add_plugin(&mock_descriptor("out", &["sender"]))
            .await
            .unwrap();

        assert!(matches!(
            registry.restart(plugin.hash()).await,
            Err(RegistryError::InvalidState { .. })
        ));
        assert!(matches!(
            registry.restart("missing").await,
            Err(RegistryError::PluginNotFound(_))
        ));

        plugin.set_state(PluginState::Error);
        registry.restart(plugin.hash()).await.unwrap();
        assert_eq!(plugin.state(), PluginState::Active);
    }

    #[tokio::test]
    async fn test_receiver_failure_marks_error_and_restarts() {
        let (factories, mocks) = MockFactory::registry();
        let queue = Arc::new(crate::queue::EventQueue::new(&QueueConfig::default()));
        let registry = PluginRegistry::new(factories).with_ingress(queue);

        let mut descriptor = mock_descriptor("in", &["receiver"]);
        descriptor.params["fail_receive"] = json!(true);
        let plugin = registry.add_plugin(&descriptor).await.unwrap();
        registry.start_receiving(&plugin);

        tokio::time::timeout(Duration::from_secs(1), async {
            while plugin.state() != PluginState::Error {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(registry.by_state(PluginState::Error).len(), 1);

        let restarted = registry.restart(plugin.hash()).await.unwrap();
        assert!(Arc::ptr_eq(&restarted, &plugin));
        assert_eq!(plugin.state(), PluginState::Active);
        assert_eq!(mocks.instance("in").unwrap().starts(), 2);

        registry.shutdown().await.unwrap();
        assert_eq!(plugin.state(), PluginState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_failure_is_reported_and_plugin_removed() {
        let (registry, mocks) = registry();
        let mut descriptor = mock_descriptor("stubborn", &["sender"]);
        descriptor.params["fail_stop"] = json!(true);
        let plugin = registry.add_plugin(&descriptor).await.unwrap();

        let result = registry.remove_plugin(plugin.hash()).await;

        assert!(matches!(
            result,
            Err(RegistryError::AdapterStopFailed { ref hash, .. }) if hash == plugin.hash()
        ));
        assert_eq!(plugin.state(), PluginState::Error);
        assert!(registry.lookup(plugin.hash()).is_none());
        assert!(registry.is_empty());
        assert_eq!(mocks.instance("stubborn").unwrap().stops(), 1);
    }

    #[tokio::test]
    async fn test_receivers_feed_ingress() {
        let (factories, _mocks) = MockFactory::registry();
        let queue = Arc::new(crate::queue::EventQueue::new(&QueueConfig::default()));
        let registry = PluginRegistry::new(factories).with_ingress(queue.clone());

        let mut descriptor = mock_descriptor("in", &["receiver"]);
        descriptor.params["emit"] = json!([{"n": 1}, {"n": 2}]);
        let plugin = registry.add_plugin(&descriptor).await.unwrap();
        registry.start_receiving(&plugin);
        registry.start_receiving(&plugin);

        let cancel = CancellationToken::new();
        for n in 1..=2 {
            let event = tokio::time::timeout(Duration::from_secs(1), queue.next_event(&cancel))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.payload, json!({"n": n}));
            assert_eq!(event.source, plugin.hash());
        }

        registry.shutdown().await.unwrap();
        assert_eq!(plugin.state(), PluginState::Stopped);
        assert!(registry.is_empty());
    }
}
