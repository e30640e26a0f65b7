//! Routing table data model
//!
//! A [`RoutingTableEntry`] binds one source adapter to one destination
//! adapter under a match/filter pattern and a delivery mode. The entry and
//! both plugin descriptors carry identity hashes that are always recomputed
//! from configuration; a supplied hash is only accepted when it agrees.

use crate::error::TableError;
use crate::hasher::{digest_fields, ConfigHash};
use crate::{matcher, transform};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Acknowledgment and retry contract for dispatching to a destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Send once; failures are recorded but neither retried nor propagated
    #[default]
    FireAndForget,
    /// Retry with bounded backoff until acknowledged or the attempt ceiling is hit
    AtLeastOnce,
    /// Like at-least-once, keyed by a dedup id and suppressed within the dedup window
    ExactlyOnce,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::FireAndForget => "fire_and_forget",
            DeliveryMode::AtLeastOnce => "at_least_once",
            DeliveryMode::ExactlyOnce => "exactly_once",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter type plus parameters; the unit of plugin deduplication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Adapter type tag, e.g. `kafka`, `sqs`, `debug`
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Adapter specific configuration
    #[serde(default)]
    pub params: Value,
}

impl PluginDescriptor {
    pub fn new(plugin_type: impl Into<String>, params: Value) -> Self {
        Self {
            plugin_type: plugin_type.into(),
            params,
        }
    }
}

impl ConfigHash for PluginDescriptor {
    fn config_hash(&self) -> String {
        digest_fields([
            ("type", Value::String(self.plugin_type.clone())),
            ("params", self.params.clone()),
        ])
    }
}

/// One routing rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingTableEntry {
    /// Partner id for quota and rate limiting
    pub partner_id: String,
    /// App id for quota and rate limiting
    pub app_id: String,
    /// Source adapter type
    pub src_type: String,
    /// Source adapter parameters
    #[serde(default)]
    pub src_params: Value,
    /// Identity hash of the source plugin (computed)
    #[serde(default)]
    pub src_hash: String,
    /// Destination adapter type
    pub dst_type: String,
    /// Destination adapter parameters
    #[serde(default)]
    pub dst_params: Value,
    /// Identity hash of the destination plugin (computed)
    #[serde(default)]
    pub dst_hash: String,
    /// Destination specific routing parameters; `"{.path}"` strings pull values from the event
    #[serde(default)]
    pub routing_data: Value,
    /// Pattern that must be contained in the payload for the route to fire
    #[serde(default)]
    pub match_pattern: Value,
    /// Pattern that must not be contained in the payload
    #[serde(default)]
    pub filter_pattern: Option<Value>,
    /// Optional structural rewrite applied before splitting
    #[serde(default)]
    pub transformation: Option<Value>,
    /// Path to the event timestamp used for windowing
    #[serde(default)]
    pub event_ts_path: String,
    /// Window length for timestamp based deduplication
    #[serde(default)]
    pub event_ts_period_ms: u64,
    /// Path to an array to split the payload along
    #[serde(default)]
    pub event_split_path: String,
    /// Delivery guarantee
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    /// Emit debug records for events evaluated against this route
    #[serde(default)]
    pub debug: bool,
    /// Identity hash over all user supplied fields (computed)
    #[serde(default)]
    pub hash: String,
    /// Creation or update time in milliseconds
    #[serde(default)]
    pub ts: u64,
}

impl RoutingTableEntry {
    /// A minimal entry from a source and destination descriptor
    pub fn new(
        partner_id: impl Into<String>,
        app_id: impl Into<String>,
        source: PluginDescriptor,
        destination: PluginDescriptor,
    ) -> Self {
        Self {
            partner_id: partner_id.into(),
            app_id: app_id.into(),
            src_type: source.plugin_type,
            src_params: source.params,
            src_hash: String::new(),
            dst_type: destination.plugin_type,
            dst_params: destination.params,
            dst_hash: String::new(),
            routing_data: Value::Null,
            match_pattern: Value::Null,
            filter_pattern: None,
            transformation: None,
            event_ts_path: String::new(),
            event_ts_period_ms: 0,
            event_split_path: String::new(),
            delivery_mode: DeliveryMode::default(),
            debug: false,
            hash: String::new(),
            ts: 0,
        }
    }

    pub fn with_match_pattern(mut self, pattern: Value) -> Self {
        self.match_pattern = pattern;
        self
    }

    pub fn with_filter_pattern(mut self, pattern: Value) -> Self {
        self.filter_pattern = Some(pattern);
        self
    }

    pub fn with_transformation(mut self, transformation: Value) -> Self {
        self.transformation = Some(transformation);
        self
    }

    pub fn with_routing_data(mut self, routing_data: Value) -> Self {
        self.routing_data = routing_data;
        self
    }

    pub fn with_split_path(mut self, path: impl Into<String>) -> Self {
        self.event_split_path = path.into();
        self
    }

    pub fn with_ts_window(mut self, path: impl Into<String>, period_ms: u64) -> Self {
        self.event_ts_path = path.into();
        self.event_ts_period_ms = period_ms;
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn source_descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(self.src_type.clone(), self.src_params.clone())
    }

    pub fn destination_descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new(self.dst_type.clone(), self.dst_params.clone())
    }

    /// Checks required fields and the syntax of patterns and paths
    pub fn validate(&self) -> Result<(), TableError> {
        let required = [
            ("partner_id", &self.partner_id),
            ("app_id", &self.app_id),
            ("src_type", &self.src_type),
            ("dst_type", &self.dst_type),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(TableError::InvalidConfiguration(format!(
                    "{field} is required"
                )));
            }
        }

        matcher::validate_pattern(&self.match_pattern)
            .map_err(|e| TableError::InvalidConfiguration(format!("match_pattern: {e}")))?;
        if let Some(filter) = &self.filter_pattern {
            matcher::validate_pattern(filter)
                .map_err(|e| TableError::InvalidConfiguration(format!("filter_pattern: {e}")))?;
        }
        if let Some(template) = &self.transformation {
            transform::validate_template(template)
                .map_err(|e| TableError::InvalidConfiguration(format!("transformation: {e}")))?;
        }
        transform::validate_template(&self.routing_data)
            .map_err(|e| TableError::InvalidConfiguration(format!("routing_data: {e}")))?;

        for (field, path) in [
            ("event_split_path", &self.event_split_path),
            ("event_ts_path", &self.event_ts_path),
        ] {
            if !path.is_empty() {
                transform::parse_path(path)
                    .map_err(|e| TableError::InvalidConfiguration(format!("{field}: {e}")))?;
            }
        }

        Ok(())
    }

    /// Validates the entry, verifies any supplied hashes and fills in the computed ones
    ///
    /// An explicit `null` filter pattern or transformation is treated as absent.
    pub fn finalize(mut self) -> Result<Self, TableError> {
        if matches!(self.filter_pattern, Some(Value::Null)) {
            self.filter_pattern = None;
        }
        if matches!(self.transformation, Some(Value::Null)) {
            self.transformation = None;
        }
        self.validate()?;

        let src_hash = self.source_descriptor().config_hash();
        let dst_hash = self.destination_descriptor().config_hash();
        let hash = self.config_hash();

        verify_hash("src_hash", &self.src_hash, &src_hash)?;
        verify_hash("dst_hash", &self.dst_hash, &dst_hash)?;
        verify_hash("hash", &self.hash, &hash)?;

        self.src_hash = src_hash;
        self.dst_hash = dst_hash;
        self.hash = hash;
        Ok(self)
    }
}

impl ConfigHash for RoutingTableEntry {
    /// Digest over every user supplied field; timestamps and computed hashes are excluded
    fn config_hash(&self) -> String {
        digest_fields([
            ("partner_id", Value::String(self.partner_id.clone())),
            ("app_id", Value::String(self.app_id.clone())),
            ("src_type", Value::String(self.src_type.clone())),
            ("src_params", self.src_params.clone()),
            ("dst_type", Value::String(self.dst_type.clone())),
            ("dst_params", self.dst_params.clone()),
            ("routing_data", self.routing_data.clone()),
            ("match_pattern", self.match_pattern.clone()),
            (
                "filter_pattern",
                self.filter_pattern.clone().unwrap_or(Value::Null),
            ),
            (
                "transformation",
                self.transformation.clone().unwrap_or(Value::Null),
            ),
            ("event_ts_path", Value::String(self.event_ts_path.clone())),
            ("event_ts_period_ms", Value::from(self.event_ts_period_ms)),
            ("event_split_path", Value::String(self.event_split_path.clone())),
            (
                "delivery_mode",
                Value::String(self.delivery_mode.as_str().to_string()),
            ),
            ("debug", Value::Bool(self.debug)),
        ])
    }
}

fn verify_hash(field: &'static str, supplied: &str, computed: &str) -> Result<(), TableError> {
    if supplied.is_empty() || supplied == computed {
        Ok(())
    } else {
        Err(TableError::HashMismatch {
            field,
            supplied: supplied.to_string(),
            computed: computed.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> RoutingTableEntry {
        RoutingTableEntry::new(
            "partner",
            "app",
            PluginDescriptor::new("debug", json!({"name": "in"})),
            PluginDescriptor::new("null", json!({})),
        )
        .with_match_pattern(json!({"type": "click"}))
    }

    #[test]
    fn test_hash_ignores_timestamps_and_computed_fields() {
        let a = entry().finalize().unwrap();
        let mut b = entry();
        b.ts = 12345;
        let b = b.finalize().unwrap();

        assert_eq!(a.hash, b.hash);
        assert_eq!(a.src_hash, PluginDescriptor::new("debug", json!({"name": "in"})).config_hash());
    }

    #[test]
    fn test_hash_covers_user_fields() {
        let a = entry().finalize().unwrap();
        let b = entry().with_debug(true).finalize().unwrap();
        let c = entry()
            .with_delivery_mode(DeliveryMode::AtLeastOnce)
            .finalize()
            .unwrap();

        assert_ne!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
        assert_ne!(b.hash, c.hash);
    }

    #[test]
    fn test_null_filter_and_transformation_read_as_absent() {
        let absent = entry().finalize().unwrap();
        let null = entry()
            .with_filter_pattern(Value::Null)
            .with_transformation(Value::Null)
            .finalize()
            .unwrap();

        assert_eq!(absent.hash, null.hash);
        assert!(null.filter_pattern.is_none());
        assert!(null.transformation.is_none());

        let payload = json!({"type": "click"});
        let matcher = crate::matcher::PatternMatcher::new();
        assert!(matcher.fires(&payload, &absent).unwrap());
        assert!(matcher.fires(&payload, &null).unwrap());
    }

    #[test]
    fn test_supplied_hash_is_verified() {
        let good = entry().finalize().unwrap();
        assert!(good.clone().finalize().is_ok());

        let mut forged = entry();
        forged.hash = "deadbeef".to_string();
        assert!(matches!(
            forged.finalize(),
            Err(TableError::HashMismatch { field: "hash", .. })
        ));

        let mut forged = entry();
        forged.dst_hash = "deadbeef".to_string();
        assert!(matches!(
            forged.finalize(),
            Err(TableError::HashMismatch { field: "dst_hash", .. })
        ));
    }

    #[test]
    fn test_missing_required_fields() {
        let mut e = entry();
        e.src_type.clear();
        assert!(matches!(e.validate(), Err(TableError::InvalidConfiguration(_))));

        let mut e = entry();
        e.app_id = "  ".to_string();
        assert!(matches!(e.validate(), Err(TableError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_invalid_paths_rejected() {
        let e = entry().with_split_path("items..x");
        assert!(matches!(e.validate(), Err(TableError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_wire_round_trip_fields() {
        let wire = json!({
            "partner_id": "p",
            "app_id": "a",
            "src_type": "debug",
            "src_params": {"name": "in"},
            "dst_type": "null",
            "delivery_mode": "exactly_once",
            "event_ts_period_ms": 1000,
            "debug": true
        });
        let e: RoutingTableEntry = serde_json::from_value(wire).unwrap();

        assert_eq!(e.delivery_mode, DeliveryMode::ExactlyOnce);
        assert_eq!(e.event_ts_period_ms, 1000);
        assert!(e.filter_pattern.is_none());
        assert!(e.debug);

        let out = serde_json::to_value(e.finalize().unwrap()).unwrap();
        for field in [
            "partner_id", "app_id", "src_type", "src_params", "src_hash", "dst_type",
            "dst_params", "dst_hash", "routing_data", "match_pattern", "filter_pattern",
            "transformation", "event_ts_path", "event_ts_period_ms", "event_split_path",
            "delivery_mode", "debug", "hash", "ts",
        ] {
            assert!(out.get(field).is_some(), "missing wire field {field}");
        }
    }
}
