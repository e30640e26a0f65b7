//! Routing table
//!
//! Readers load an immutable [`TableSnapshot`] through an [`ArcSwap`], so a
//! query always sees one complete version of the table. Writers serialize on
//! an async mutex, acquire or release plugin references through the
//! [`PluginRegistry`], build the next snapshot and publish it with a single
//! store. Indexes are rebuilt with every snapshot and never drift from the
//! entry list.

use crate::adapter::Capabilities;
use crate::error::TableError;
use crate::event::Event;
use crate::hasher::{self, ConfigHash};
use crate::model::RoutingTableEntry;
use crate::registry::{Plugin, PluginRegistry};
use crate::utils::{current_timestamp, short_hash};
use arc_swap::ArcSwap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One immutable version of the routing table
#[derive(Debug, Default)]
pub struct TableSnapshot {
    entries: Vec<Arc<RoutingTableEntry>>,
    by_hash: HashMap<String, usize>,
    by_source: HashMap<String, Vec<usize>>,
    by_destination: HashMap<String, Vec<usize>>,
}

impl TableSnapshot {
    fn build(entries: Vec<Arc<RoutingTableEntry>>) -> Self {
        let mut by_hash = HashMap::with_capacity(entries.len());
        let mut by_source: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_destination: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, entry) in entries.iter().enumerate() {
            by_hash.insert(entry.hash.clone(), idx);
            by_source.entry(entry.src_hash.clone()).or_default().push(idx);
            by_destination
                .entry(entry.dst_hash.clone())
                .or_default()
                .push(idx);
        }

        Self {
            entries,
            by_hash,
            by_source,
            by_destination,
        }
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[Arc<RoutingTableEntry>] {
        &self.entries
    }

    pub fn get(&self, hash: &str) -> Option<&Arc<RoutingTableEntry>> {
        self.by_hash.get(hash).map(|&idx| &self.entries[idx])
    }

    pub fn by_source(&self, plugin_hash: &str) -> Vec<Arc<RoutingTableEntry>> {
        self.select(self.by_source.get(plugin_hash))
    }

    pub fn by_destination(&self, plugin_hash: &str) -> Vec<Arc<RoutingTableEntry>> {
        self.select(self.by_destination.get(plugin_hash))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn select(&self, indexes: Option<&Vec<usize>>) -> Vec<Arc<RoutingTableEntry>> {
        indexes
            .map(|idx| idx.iter().map(|&i| self.entries[i].clone()).collect())
            .unwrap_or_default()
    }
}

/// Summary of a `replace_all_routes` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
}

/// The routing table and its control-plane operations
pub struct RoutingTable {
    snapshot: ArcSwap<TableSnapshot>,
    write_lock: Mutex<()>,
    registry: Arc<PluginRegistry>,
}

impl RoutingTable {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(TableSnapshot::default()),
            write_lock: Mutex::new(()),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Current table version
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.snapshot.load_full()
    }

    /// Add a route, acquiring its source and destination plugins.
    ///
    /// Adding an entry whose hash is already present is a no-op that returns
    /// the stored entry. If either plugin cannot be acquired the route is not
    /// added and any reference already taken is released.
    pub async fn add_route(
        &self,
        entry: RoutingTableEntry,
        cancel: &CancellationToken,
    ) -> Result<Arc<RoutingTableEntry>, TableError> {
        let entry = entry.finalize()?;
        let _guard = self.lock(cancel).await?;

        let current = self.snapshot.load_full();
        if let Some(existing) = current.get(&entry.hash) {
            debug!("Route {} already present", short_hash(&entry.hash));
            return Ok(existing.clone());
        }

        let entry = Arc::new(self.acquire_plugins(stamp(entry)).await?);

        let mut entries = current.entries.clone();
        entries.push(entry.clone());
        self.snapshot.store(Arc::new(TableSnapshot::build(entries)));
        self.open_ingress(&entry);

        info!(
            "➕ Route added: {} ({} -> {}, {})",
            short_hash(&entry.hash),
            entry.src_type,
            entry.dst_type,
            entry.delivery_mode
        );
        Ok(entry)
    }

    /// Remove the route with this entry's hash; returns whether it was present
    pub async fn remove_route(
        &self,
        entry: &RoutingTableEntry,
        cancel: &CancellationToken,
    ) -> Result<bool, TableError> {
        self.remove_route_by_hash(&entry.config_hash(), cancel).await
    }

    /// Remove a route by hash; absent routes are a no-op
    pub async fn remove_route_by_hash(
        &self,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, TableError> {
        let _guard = self.lock(cancel).await?;

        let current = self.snapshot.load_full();
        let Some(removed) = current.get(hash).cloned() else {
            return Ok(false);
        };

        let entries = current
            .entries
            .iter()
            .filter(|e| e.hash != hash)
            .cloned()
            .collect();
        self.snapshot.store(Arc::new(TableSnapshot::build(entries)));
        info!("➖ Route removed: {}", short_hash(hash));

        self.release_plugins(std::slice::from_ref(&removed)).await?;
        Ok(true)
    }

    /// Replace the whole table with `entries`.
    ///
    /// Every entry is validated before anything is applied. Only the
    /// difference against the current table touches plugin reference counts,
    /// and the new table is published in one swap.
    pub async fn replace_all_routes(
        &self,
        entries: Vec<RoutingTableEntry>,
        cancel: &CancellationToken,
    ) -> Result<ReplaceSummary, TableError> {
        let mut wanted = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        for entry in entries {
            let entry = entry.finalize()?;
            if seen.insert(entry.hash.clone()) {
                wanted.push(entry);
            }
        }

        let _guard = self.lock(cancel).await?;
        let current = self.snapshot.load_full();

        // Surviving entries keep their current order; additions follow in input order
        let mut next: Vec<Arc<RoutingTableEntry>> = current
            .entries
            .iter()
            .filter(|e| seen.contains(&e.hash))
            .cloned()
            .collect();
        let unchanged = next.len();
        let mut acquired: Vec<Arc<RoutingTableEntry>> = Vec::new();
        for entry in wanted {
            if current.get(&entry.hash).is_some() {
                continue;
            }
            match self.acquire_plugins(stamp(entry)).await {
                Ok(entry) => {
                    let entry = Arc::new(entry);
                    acquired.push(entry.clone());
                    next.push(entry);
                }
                Err(e) => {
                    if let Err(rollback) = self.release_plugins(&acquired).await {
                        error!("❌ Rollback after failed table replace: {}", rollback);
                    }
                    return Err(e);
                }
            }
        }

        let removed: Vec<Arc<RoutingTableEntry>> = current
            .entries
            .iter()
            .filter(|e| !seen.contains(&e.hash))
            .cloned()
            .collect();

        self.snapshot.store(Arc::new(TableSnapshot::build(next)));
        for entry in &acquired {
            self.open_ingress(entry);
        }

        let summary = ReplaceSummary {
            added: acquired.len(),
            removed: removed.len(),
            unchanged,
        };
        info!(
            "🔁 Routing table replaced: +{} -{} ={}",
            summary.added, summary.removed, summary.unchanged
        );

        self.release_plugins(&removed).await?;
        Ok(summary)
    }

    /// Remove every route, releasing all plugin references
    pub async fn clear(&self, cancel: &CancellationToken) -> Result<ReplaceSummary, TableError> {
        self.replace_all_routes(Vec::new(), cancel).await
    }

    pub fn get_all_routes(&self) -> Vec<Arc<RoutingTableEntry>> {
        self.snapshot.load().entries.clone()
    }

    pub fn get_route(&self, hash: &str) -> Option<Arc<RoutingTableEntry>> {
        self.snapshot.load().get(hash).cloned()
    }

    pub fn get_routes_by_source_plugin(&self, plugin: &Plugin) -> Vec<Arc<RoutingTableEntry>> {
        self.snapshot.load().by_source(plugin.hash())
    }

    pub fn get_routes_by_destination_plugin(&self, plugin: &Plugin) -> Vec<Arc<RoutingTableEntry>> {
        self.snapshot.load().by_destination(plugin.hash())
    }

    /// Routes whose source is the plugin that produced the event, in insertion order
    pub fn get_routes_for_event(&self, event: &Event) -> Result<Vec<Arc<RoutingTableEntry>>, TableError> {
        let plugin = self
            .registry
            .lookup(&event.source)
            .ok_or_else(|| TableError::SourcePluginNotFound(event.source.clone()))?;
        Ok(self.get_routes_by_source_plugin(&plugin))
    }

    /// Order independent digest over every entry hash
    pub fn hash(&self) -> String {
        let snapshot = self.snapshot.load();
        let mut hashes: Vec<&str> = snapshot.entries.iter().map(|e| e.hash.as_str()).collect();
        hashes.sort_unstable();
        hasher::digest(&Value::from(hashes))
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    async fn lock(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, ()>, TableError> {
        tokio::select! {
            guard = self.write_lock.lock() => Ok(guard),
            _ = cancel.cancelled() => Err(TableError::Cancelled),
        }
    }

    async fn acquire_plugins(&self, entry: RoutingTableEntry) -> Result<RoutingTableEntry, TableError> {
        let source = self.registry.add_plugin(&entry.source_descriptor()).await?;
        if !source.has(Capabilities::RECEIVER) {
            self.release(source.hash()).await;
            return Err(TableError::InvalidConfiguration(format!(
                "source adapter type {} cannot receive events",
                entry.src_type
            )));
        }

        let destination = match self.registry.add_plugin(&entry.destination_descriptor()).await {
            Ok(plugin) => plugin,
            Err(e) => {
                self.release(source.hash()).await;
                return Err(e.into());
            }
        };
        if !destination.has(Capabilities::SENDER) {
            self.release(destination.hash()).await;
            self.release(source.hash()).await;
            return Err(TableError::InvalidConfiguration(format!(
                "destination adapter type {} cannot send events",
                entry.dst_type
            )));
        }

        Ok(entry)
    }

    // Receivers start producing only once a route that consumes them is visible
    fn open_ingress(&self, entry: &RoutingTableEntry) {
        if let Some(source) = self.registry.lookup(&entry.src_hash) {
            self.registry.start_receiving(&source);
        }
    }

    async fn release_plugins(&self, entries: &[Arc<RoutingTableEntry>]) -> Result<(), TableError> {
        let mut first_error = None;
        for entry in entries {
            for hash in [&entry.src_hash, &entry.dst_hash] {
                if let Err(e) = self.registry.remove_plugin(hash).await {
                    error!("❌ {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    async fn release(&self, hash: &str) {
        if let Err(e) = self.registry.remove_plugin(hash).await {
            error!("❌ Failed to release plugin {}: {}", short_hash(hash), e);
        }
    }
}

fn stamp(mut entry: RoutingTableEntry) -> RoutingTableEntry {
    if entry.ts == 0 {
        entry.ts = current_timestamp();
    }
    entry
}
