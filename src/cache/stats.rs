// Per-schema access statistics: hit/miss counters plus a windowed
// history of hits per interval. GC consumes the hit ratio to decide
// which schemas to evict from first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::schema::SchemaId;

pub const DEFAULT_STATS_INTERVAL: u64 = 200_000;

#[derive(Debug)]
pub struct AccessStats {
    interval: u64,
    accesses: AtomicU64,
    hits: AtomicU64,
    window: Mutex<WindowState>,
}

#[derive(Debug, Default)]
struct WindowState {
    last_hits: u64,
    history: Vec<u64>,
}

impl AccessStats {
    fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            accesses: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            window: Mutex::new(WindowState::default()),
        }
    }

    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bump_access();
    }

    pub fn miss(&self) {
        self.bump_access();
    }

    fn bump_access(&self) {
        let count = self.accesses.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.interval == 0 {
            let hits = self.hits.load(Ordering::Relaxed);
            let mut window = self.window.lock();
            let delta = hits.saturating_sub(window.last_hits);
            window.history.push(delta);
            window.last_hits = window.last_hits.max(hits);
        }
    }

    pub fn accesses(&self) -> u64 {
        self.accesses.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// `hits / accesses`, undefined before the first access.
    pub fn hit_ratio(&self) -> Option<f64> {
        let accesses = self.accesses();
        (accesses > 0).then(|| self.hits() as f64 / accesses as f64)
    }

    pub fn snapshot(&self, schema_id: SchemaId) -> StatsSnapshot {
        StatsSnapshot {
            schema_id,
            accesses: self.accesses(),
            hits: self.hits(),
            hit_ratio: self.hit_ratio(),
            interval: self.interval,
            window_hits: self.window.lock().history.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub schema_id: SchemaId,
    pub accesses: u64,
    pub hits: u64,
    pub hit_ratio: Option<f64>,
    pub interval: u64,
    pub window_hits: Vec<u64>,
}

/// Statistics registry, one entry per schema, created on first access.
#[derive(Debug)]
pub struct SchemaStats {
    interval: u64,
    by_schema: DashMap<SchemaId, Arc<AccessStats>>,
}

impl SchemaStats {
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            by_schema: DashMap::new(),
        }
    }

    fn entry(&self, schema_id: SchemaId) -> Arc<AccessStats> {
        self.by_schema
            .entry(schema_id)
            .or_insert_with(|| Arc::new(AccessStats::new(self.interval)))
            .clone()
    }

    pub fn register(&self, schema_id: SchemaId) {
        self.entry(schema_id);
    }

    pub fn hit(&self, schema_id: SchemaId) {
        self.entry(schema_id).hit();
    }

    pub fn miss(&self, schema_id: SchemaId) {
        self.entry(schema_id).miss();
    }

    /// `None` for a schema never accessed.
    pub fn hit_ratio(&self, schema_id: SchemaId) -> Option<f64> {
        self.by_schema.get(&schema_id)?.hit_ratio()
    }

    pub fn snapshot_all(&self) -> Vec<StatsSnapshot> {
        let mut all: Vec<_> = self
            .by_schema
            .iter()
            .map(|entry| entry.value().snapshot(*entry.key()))
            .collect();
        all.sort_by_key(|s| s.schema_id);
        all
    }

    /// Emit the shutdown summary: totals, ratios, and per-interval
    /// windows for every schema.
    pub fn log_summary(&self) {
        for snap in self.snapshot_all() {
            let ratio = snap
                .hit_ratio
                .map_or_else(|| "n/a".to_string(), |r| format!("{r:.3}"));
            let windows =
                serde_json::to_string(&snap.window_hits).unwrap_or_else(|_| "[]".to_string());
            info!(
                "schema {}: {} / {} hits (ratio {}), hits per {} accesses: {}",
                snap.schema_id, snap.hits, snap.accesses, ratio, snap.interval, windows
            );
        }
    }
}
