//! Immutable routing table and its atomic-swap handle.
//!
//! A table maps each routable model id to its member lineages, and each
//! lineage to the version slots currently taking traffic. Readers clone an
//! `Arc` and never observe a half-applied traffic change; writers build a
//! complete new table and swap it in.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ensemble::EnsembleStrategy;

/// One serving version of a lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSlot {
    /// Version tag.
    pub version: String,
    /// Registry key of the backend serving this version.
    pub backend: String,
    /// Share of the lineage's requests, `0..=100`.
    pub traffic_pct: u8,
}

/// How a model id is served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Member lineages whose predictions are combined.
    pub members: Vec<String>,
    /// Backend answering when every member fails.
    pub fallback: Option<String>,
    /// Strategy override for this route.
    pub strategy: Option<EnsembleStrategy>,
}

impl RouteSpec {
    /// Route over `members` with no fallback or override.
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
            fallback: None,
            strategy: None,
        }
    }

    /// Set the fallback backend.
    pub fn with_fallback(mut self, backend: impl Into<String>) -> Self {
        self.fallback = Some(backend.into());
        self
    }

    /// Set the strategy override.
    pub fn with_strategy(mut self, strategy: EnsembleStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Snapshot of all routes and traffic splits.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingTable {
    routes: BTreeMap<String, RouteSpec>,
    lineages: BTreeMap<String, Vec<TrafficSlot>>,
    generation: u64,
}

impl RoutingTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a route.
    pub fn with_route(mut self, model_id: impl Into<String>, spec: RouteSpec) -> Self {
        self.routes.insert(model_id.into(), spec);
        self
    }

    /// Replace the slots of a lineage. Slots with zero traffic are kept for
    /// visibility but never selected.
    pub fn with_lineage(mut self, lineage: impl Into<String>, slots: Vec<TrafficSlot>) -> Self {
        self.lineages.insert(lineage.into(), slots);
        self
    }

    /// Route for `model_id`.
    pub fn route(&self, model_id: &str) -> Option<&RouteSpec> {
        self.routes.get(model_id)
    }

    /// Routable model ids, sorted.
    pub fn model_ids(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    /// All routes.
    pub fn routes(&self) -> &BTreeMap<String, RouteSpec> {
        &self.routes
    }

    /// Slots of `lineage`.
    pub fn slots(&self, lineage: &str) -> &[TrafficSlot] {
        self.lineages.get(lineage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All lineages and their slots.
    pub fn lineages(&self) -> &BTreeMap<String, Vec<TrafficSlot>> {
        &self.lineages
    }

    /// Swap counter; bumped by [`RoutingTableHandle`] on every store.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Pick the slot of `lineage` serving `request_id`.
    ///
    /// The same `(lineage, request_id)` always maps to the same bucket, so a
    /// request id sees a stable version for a given traffic split.
    pub fn resolve(&self, lineage: &str, request_id: &str) -> Option<&TrafficSlot> {
        let live: Vec<&TrafficSlot> = self
            .slots(lineage)
            .iter()
            .filter(|s| s.traffic_pct > 0)
            .collect();
        let bucket = u32::from(traffic_bucket(lineage, request_id));
        let mut upper = 0u32;
        for slot in &live {
            upper += u32::from(slot.traffic_pct);
            if bucket < upper {
                return Some(slot);
            }
        }
        live.last().copied()
    }

    /// Structural problems: unknown member lineages and traffic that does not
    /// sum to 100.
    pub fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (model_id, spec) in &self.routes {
            if spec.members.is_empty() && spec.fallback.is_none() {
                out.push(format!("route '{model_id}' has no members and no fallback"));
            }
            for member in &spec.members {
                if !self.lineages.contains_key(member) {
                    out.push(format!("route '{model_id}' references unknown lineage '{member}'"));
                }
            }
        }
        for (lineage, slots) in &self.lineages {
            let total: u32 = slots.iter().map(|s| u32::from(s.traffic_pct)).sum();
            if total != 100 {
                out.push(format!("lineage '{lineage}' traffic sums to {total}, expected 100"));
            }
        }
        out
    }
}

/// Bucket in `[0, 100)` for a request within a lineage.
pub fn traffic_bucket(lineage: &str, request_id: &str) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(lineage.as_bytes());
    hasher.update(b":");
    hasher.update(request_id.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 100) as u8
}

/// Shared pointer to the current table.
#[derive(Debug, Default)]
pub struct RoutingTableHandle {
    current: RwLock<Arc<RoutingTable>>,
}

impl RoutingTableHandle {
    /// Handle serving `table`.
    pub fn new(table: RoutingTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// Current table.
    pub fn load(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.current.read())
    }

    /// Replace the table wholesale.
    pub fn store(&self, mut table: RoutingTable) -> Arc<RoutingTable> {
        let mut current = self.current.write();
        table.generation = current.generation + 1;
        let table = Arc::new(table);
        *current = Arc::clone(&table);
        table
    }

    /// Derive a new table from the current one and swap it in, atomically
    /// with respect to other writers.
    pub fn update<F>(&self, f: F) -> Arc<RoutingTable>
    where
        F: FnOnce(&RoutingTable) -> RoutingTable,
    {
        let mut current = self.current.write();
        let mut next = f(&current);
        next.generation = current.generation + 1;
        let next = Arc::new(next);
        *current = Arc::clone(&next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(version: &str, pct: u8) -> TrafficSlot {
        TrafficSlot {
            version: version.into(),
            backend: format!("alpha@{version}"),
            traffic_pct: pct,
        }
    }

    #[test]
    fn test_resolve_respects_split() {
        let table = RoutingTable::new().with_lineage("alpha", vec![slot("v1", 90), slot("v2", 10)]);
        let mut v2 = 0;
        for i in 0..2000 {
            let s = table.resolve("alpha", &format!("req-{i}")).unwrap();
            if s.version == "v2" {
                v2 += 1;
            }
        }
        assert!(v2 > 120 && v2 < 300, "v2 got {v2}/2000");
    }

    #[test]
    fn test_resolve_is_stable_and_skips_zero_slots() {
        let table = RoutingTable::new().with_lineage("alpha", vec![slot("v1", 0), slot("v2", 100)]);
        for i in 0..50 {
            assert_eq!(table.resolve("alpha", &i.to_string()).unwrap().version, "v2");
        }
        assert!(table.resolve("missing", "x").is_none());
    }

    #[test]
    fn test_problems_reports_bad_traffic_and_members() {
        let table = RoutingTable::new()
            .with_route("quality", RouteSpec::new(["alpha", "beta"]))
            .with_lineage("alpha", vec![slot("v1", 60)]);
        let problems = table.problems();
        assert_eq!(problems.len(), 2, "{problems:?}");
    }

    #[test]
    fn test_handle_swaps_and_bumps_generation() {
        let handle = RoutingTableHandle::new(RoutingTable::new());
        let before = handle.load();
        let after = handle.update(|t| t.clone().with_lineage("alpha", vec![slot("v1", 100)]));
        assert_eq!(after.generation(), before.generation() + 1);
        assert!(before.slots("alpha").is_empty());
        assert_eq!(handle.load().slots("alpha").len(), 1);
    }
}
