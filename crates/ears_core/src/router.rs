//! Event router
//!
//! For each inbound event: resolve the candidate routes for its source
//! plugin, then evaluate every candidate concurrently. A route that fires is
//! transformed, split and passed through the destination's filter before its
//! work events are dispatched in order. Failures are scoped to the route
//! that produced them and collected into a [`RouteReport`].

use crate::delivery::{DeliveryCoordinator, DeliveryOutcome};
use crate::error::RouterError;
use crate::event::Event;
use crate::matcher::PatternMatcher;
use crate::model::RoutingTableEntry;
use crate::table::RoutingTable;
use crate::transform::{self, Transformer};
use crate::utils::short_hash;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where in the per-route pipeline a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStage {
    Match,
    Transform,
    Split,
    Resolve,
    Filter,
    RoutingData,
    Dispatch,
}

impl fmt::Display for RouteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteStage::Match => "match",
            RouteStage::Transform => "transform",
            RouteStage::Split => "split",
            RouteStage::Resolve => "resolve",
            RouteStage::Filter => "filter",
            RouteStage::RoutingData => "routing_data",
            RouteStage::Dispatch => "dispatch",
        };
        f.write_str(name)
    }
}

/// One route's failure for one event
#[derive(Debug, Clone, Serialize)]
pub struct RouteFailure {
    pub route_hash: String,
    pub stage: RouteStage,
    pub error: String,
}

/// Outcome of routing one event across all of its candidate routes
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteReport {
    pub event_id: String,
    /// Routes whose source is the event's plugin
    pub candidates: usize,
    /// Routes whose firing rule held
    pub fired: usize,
    /// Work events produced by transform, split and filter
    pub work_events: usize,
    /// Work events the destination acknowledged
    pub dispatched: usize,
    /// Exactly-once work events suppressed as duplicates
    pub suppressed: usize,
    /// Fire-and-forget work events whose send failed
    pub dropped: usize,
    pub failures: Vec<RouteFailure>,
}

impl RouteReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok` when no route failed, otherwise the report wrapped in an error
    pub fn into_result(self) -> Result<RouteReport, RouterError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RouterError::RouteFailures(self))
        }
    }

    fn absorb(&mut self, route: RouteResult) {
        self.fired += usize::from(route.fired);
        self.work_events += route.work_events;
        self.dispatched += route.dispatched;
        self.suppressed += route.suppressed;
        self.dropped += route.dropped;
        self.failures.extend(route.failures);
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RouterStats {
    pub events_routed: u64,
    pub events_unroutable: u64,
    pub routes_evaluated: u64,
    pub routes_fired: u64,
    pub work_events: u64,
    pub dispatched: u64,
    pub route_failures: u64,
    pub debug_evaluations: u64,
}

#[derive(Default)]
struct RouteResult {
    fired: bool,
    work_events: usize,
    dispatched: usize,
    suppressed: usize,
    dropped: usize,
    failures: Vec<RouteFailure>,
}

impl RouteResult {
    fn fail(&mut self, entry: &RoutingTableEntry, stage: RouteStage, error: impl ToString) {
        self.failures.push(RouteFailure {
            route_hash: entry.hash.clone(),
            stage,
            error: error.to_string(),
        });
    }
}

/// Routes events from source plugins to destination plugins
pub struct EventRouter {
    table: Arc<RoutingTable>,
    delivery: Arc<DeliveryCoordinator>,
    matcher: PatternMatcher,
    transformer: Transformer,
    stats: Arc<RwLock<RouterStats>>,
}

impl EventRouter {
    pub fn new(table: Arc<RoutingTable>, delivery: Arc<DeliveryCoordinator>) -> Self {
        Self {
            table,
            delivery,
            matcher: PatternMatcher::new(),
            transformer: Transformer::new(),
            stats: Arc::new(RwLock::new(RouterStats::default())),
        }
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn delivery(&self) -> &Arc<DeliveryCoordinator> {
        &self.delivery
    }

    pub async fn stats(&self) -> RouterStats {
        self.stats.read().await.clone()
    }

    /// Route one event through every candidate route.
    ///
    /// Fails with [`RouterError::Unroutable`] only when the candidates cannot
    /// be resolved at all. Otherwise every candidate is evaluated and any
    /// per-route failures come back as [`RouterError::RouteFailures`]
    /// alongside the counts for the routes that succeeded.
    pub async fn route_event(
        &self,
        event: Event,
        cancel: &CancellationToken,
    ) -> Result<RouteReport, RouterError> {
        let candidates = match self.table.get_routes_for_event(&event) {
            Ok(candidates) => candidates,
            Err(e) => {
                self.stats.write().await.events_unroutable += 1;
                return Err(e.into());
            }
        };

        let mut report = RouteReport {
            event_id: event.id().to_string(),
            candidates: candidates.len(),
            ..RouteReport::default()
        };

        let results = join_all(
            candidates
                .iter()
                .map(|entry| self.route_one(entry, &event, cancel)),
        )
        .await;

        let mut debug_evaluations = 0;
        for (entry, result) in candidates.iter().zip(results) {
            if entry.debug {
                debug_evaluations += 1;
            }
            report.absorb(result);
        }

        {
            let mut stats = self.stats.write().await;
            stats.events_routed += 1;
            stats.routes_evaluated += report.candidates as u64;
            stats.routes_fired += report.fired as u64;
            stats.work_events += report.work_events as u64;
            stats.dispatched += report.dispatched as u64;
            stats.route_failures += report.failures.len() as u64;
            stats.debug_evaluations += debug_evaluations;
        }

        if !report.is_success() {
            warn!(
                "⚠️ Event {}: {} of {} route(s) failed",
                report.event_id,
                report.failures.len(),
                report.candidates
            );
        }
        report.into_result()
    }

    async fn route_one(
        &self,
        entry: &RoutingTableEntry,
        event: &Event,
        cancel: &CancellationToken,
    ) -> RouteResult {
        let mut result = RouteResult::default();
        self.evaluate(entry, event, cancel, &mut result).await;

        if entry.debug {
            info!(
                target: "ears::debug",
                route = %short_hash(&entry.hash),
                event = %event.id(),
                fired = result.fired,
                work_events = result.work_events,
                dispatched = result.dispatched,
                failures = result.failures.len(),
                "route evaluated"
            );
        }
        result
    }

    async fn evaluate(
        &self,
        entry: &RoutingTableEntry,
        event: &Event,
        cancel: &CancellationToken,
        result: &mut RouteResult,
    ) {
        match self.matcher.fires(&event.payload, entry) {
            Ok(fired) => result.fired = fired,
            Err(e) => return result.fail(entry, RouteStage::Match, e),
        }
        if !result.fired {
            return;
        }

        let transformed = match self
            .transformer
            .transform(event.clone(), entry.transformation.as_ref())
        {
            Ok(event) => event,
            Err(e) => return result.fail(entry, RouteStage::Transform, e),
        };

        let mut work = match self.transformer.split(transformed, &entry.event_split_path) {
            Ok(work) => work,
            Err(e) => return result.fail(entry, RouteStage::Split, e),
        };

        let Some(destination) = self.table.registry().lookup(&entry.dst_hash) else {
            return result.fail(
                entry,
                RouteStage::Resolve,
                format!("destination plugin {} not registered", short_hash(&entry.dst_hash)),
            );
        };

        if let Some(filterer) = destination.filterer() {
            let mut filtered = Vec::with_capacity(work.len());
            for item in work {
                match filterer.filter(item) {
                    Ok(events) => filtered.extend(events),
                    Err(e) => result.fail(entry, RouteStage::Filter, e),
                }
            }
            work = filtered;
        }
        result.work_events = work.len();

        for item in work {
            let routing_data = if entry.routing_data.is_null() {
                Value::Null
            } else {
                match transform::render(&entry.routing_data, &item.payload) {
                    Ok(data) => data,
                    Err(e) => {
                        result.fail(entry, RouteStage::RoutingData, e);
                        continue;
                    }
                }
            };

            match self
                .delivery
                .dispatch(&destination, item, entry, routing_data, cancel)
                .await
            {
                Ok(DeliveryOutcome::Delivered { .. }) => result.dispatched += 1,
                Ok(DeliveryOutcome::Suppressed) => result.suppressed += 1,
                Ok(DeliveryOutcome::Dropped { .. }) => result.dropped += 1,
                Err(e) => {
                    debug!("Route {} dispatch failed: {}", short_hash(&entry.hash), e);
                    result.fail(entry, RouteStage::Dispatch, e);
                }
            }
        }
    }
}
