//! Mock adapters shared by the unit tests

use crate::adapter::{
    Adapter, AdapterFactoryRegistry, Capabilities, Delivery, Filterer, Receiver, Sender,
};
use crate::error::AdapterError;
use crate::event::Event;
use crate::model::PluginDescriptor;
use crate::queue::EventSink;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configurable adapter that records what happens to it.
///
/// Params understood by [`MockFactory`]:
/// `caps` (list of `receiver`/`filterer`/`sender`), `fail_start`, `fail_stop`,
/// `fail_sends` (number of sends to fail before succeeding, `-1` for always),
/// `send_delay_ms`, `emit` (payloads a receiver produces), `fail_receive`
/// (the first receive run errors after emitting).
/// As a filterer the mock drops events whose payload has `"drop": true`.
pub struct MockAdapter {
    caps: Capabilities,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    fail_receive: AtomicBool,
    fail_sends: Mutex<i64>,
    send_delay: Option<Duration>,
    emit: Vec<Value>,
    starts: AtomicU32,
    stops: AtomicU32,
    attempts: AtomicU32,
    delivered: Mutex<Vec<Delivery>>,
}

impl MockAdapter {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_receive: AtomicBool::new(false),
            fail_sends: Mutex::new(0),
            send_delay: None,
            emit: Vec::new(),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn sender() -> Self {
        Self::new(Capabilities::SENDER)
    }

    pub fn receiver() -> Self {
        Self::new(Capabilities::RECEIVER)
    }

    pub fn from_params(params: &Value) -> Self {
        let mut caps = Capabilities::empty();
        if let Some(list) = params.get("caps").and_then(Value::as_array) {
            for cap in list.iter().filter_map(Value::as_str) {
                match cap {
                    "receiver" => caps |= Capabilities::RECEIVER,
                    "filterer" => caps |= Capabilities::FILTERER,
                    "sender" => caps |= Capabilities::SENDER,
                    _ => {}
                }
            }
        }

        let mut mock = Self::new(caps);
        mock.fail_start = AtomicBool::new(params["fail_start"].as_bool().unwrap_or(false));
        mock.fail_stop = AtomicBool::new(params["fail_stop"].as_bool().unwrap_or(false));
        mock.fail_receive = AtomicBool::new(params["fail_receive"].as_bool().unwrap_or(false));
        mock.fail_sends = Mutex::new(params["fail_sends"].as_i64().unwrap_or(0));
        mock.send_delay = params["send_delay_ms"].as_u64().map(Duration::from_millis);
        mock.emit = params["emit"].as_array().cloned().unwrap_or_default();
        mock
    }

    pub fn fail_sends(&self, count: i64) {
        *self.fail_sends.lock().unwrap() = count;
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    /// Every send call, successful or not
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful deliveries in arrival order
    pub fn delivered(&self) -> Vec<Delivery> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_payloads(&self) -> Vec<Value> {
        self.delivered().into_iter().map(|d| d.event.payload).collect()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn adapter_type(&self) -> &str {
        "mock"
    }

    async fn start(&self) -> Result<(), AdapterError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(AdapterError::Failed("start refused".into()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(AdapterError::Failed("stop refused".into()));
        }
        Ok(())
    }

    fn as_receiver(&self) -> Option<&dyn Receiver> {
        self.caps.contains(Capabilities::RECEIVER).then_some(self as &dyn Receiver)
    }

    fn as_filterer(&self) -> Option<&dyn Filterer> {
        self.caps.contains(Capabilities::FILTERER).then_some(self as &dyn Filterer)
    }

    fn as_sender(&self) -> Option<&dyn Sender> {
        self.caps.contains(Capabilities::SENDER).then_some(self as &dyn Sender)
    }
}

#[async_trait]
impl Receiver for MockAdapter {
    async fn receive(&self, sink: EventSink, _cancel: CancellationToken) -> Result<(), AdapterError> {
        for payload in &self.emit {
            sink.emit(payload.clone())
                .await
                .map_err(|e| AdapterError::Failed(e.to_string()))?;
        }
        if self.fail_receive.swap(false, Ordering::SeqCst) {
            return Err(AdapterError::Failed("connection lost".into()));
        }
        Ok(())
    }
}

impl Filterer for MockAdapter {
    fn filter(&self, event: Event) -> Result<Vec<Event>, AdapterError> {
        if event.payload.get("drop") == Some(&Value::Bool(true)) {
            Ok(Vec::new())
        } else {
            Ok(vec![event])
        }
    }
}

#[async_trait]
impl Sender for MockAdapter {
    async fn send(&self, delivery: &Delivery) -> Result<(), AdapterError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut remaining = self.fail_sends.lock().unwrap();
            if *remaining != 0 {
                if *remaining > 0 {
                    *remaining -= 1;
                }
                return Err(AdapterError::Failed("send refused".into()));
            }
        }

        self.delivered.lock().unwrap().push(delivery.clone());
        Ok(())
    }
}

/// Factory for `mock` adapters that keeps a handle on every instance by `name`
#[derive(Default)]
pub struct MockFactory {
    instances: Mutex<HashMap<String, Arc<MockAdapter>>>,
    created: Mutex<HashMap<String, usize>>,
}

impl MockFactory {
    /// A factory registry with `mock` registered
    pub fn registry() -> (Arc<AdapterFactoryRegistry>, Arc<MockFactory>) {
        let mocks = Arc::new(MockFactory::default());
        let factories = Arc::new(AdapterFactoryRegistry::new());
        let handle = mocks.clone();
        factories
            .register_fn("mock", move |params| {
                let adapter: Arc<dyn Adapter> = handle.create(params);
                Ok(adapter)
            })
            .unwrap();
        (factories, mocks)
    }

    fn create(&self, params: &Value) -> Arc<MockAdapter> {
        let name = params["name"].as_str().unwrap_or("").to_string();
        let adapter = Arc::new(MockAdapter::from_params(params));
        self.instances
            .lock()
            .unwrap()
            .insert(name.clone(), adapter.clone());
        *self.created.lock().unwrap().entry(name).or_default() += 1;
        adapter
    }

    /// Most recently created instance with this name
    pub fn instance(&self, name: &str) -> Option<Arc<MockAdapter>> {
        self.instances.lock().unwrap().get(name).cloned()
    }

    /// How many instances were constructed with this name
    pub fn created(&self, name: &str) -> usize {
        self.created.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

/// Descriptor for a named mock with the given capabilities
pub fn mock_descriptor(name: &str, caps: &[&str]) -> PluginDescriptor {
    PluginDescriptor::new("mock", json!({"name": name, "caps": caps}))
}
