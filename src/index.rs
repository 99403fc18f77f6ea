// Primary index: one ordered map per schema from a 64-bit primary key to
// a shared value pointer. The value pointer is the meeting point between
// the index and the row cache; its packed (timestamp, hot) word is the
// linearization point for every hot/cold transition.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::clock::Timestamp;
use crate::schema::SchemaId;
use crate::vlog::LogAddress;

pub type PrimaryKey = u64;

const HOT_BIT: u64 = 1;

fn pack(ts: Timestamp, hot: bool) -> u64 {
    (ts.ticks() << 1) | (hot as u64)
}

fn unpack_ts(state: u64) -> Timestamp {
    Timestamp::from_ticks(state >> 1)
}

/// Index-resident record describing where the authoritative value lives:
/// the log address when cold, a cache row when hot.
///
/// The `(timestamp, hot)` pair lives in one atomic word so that hot/cold
/// flips are single CAS transitions with the timestamp as witness. The
/// cache row address is published before the state word flips hot, so a
/// reader that observes the hot bit always sees a fully initialized row.
#[derive(Debug)]
pub struct ValuePtr {
    state: AtomicU64,
    log_addr: AtomicU64,
    row_addr: AtomicU64,
}

impl ValuePtr {
    /// A fresh cold record pointing at a log address.
    pub fn cold(log_addr: LogAddress, ts: Timestamp) -> Self {
        Self {
            state: AtomicU64::new(pack(ts, false)),
            log_addr: AtomicU64::new(log_addr),
            row_addr: AtomicU64::new(0),
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        unpack_ts(self.state.load(Ordering::Acquire))
    }

    pub fn is_hot(&self) -> bool {
        self.state.load(Ordering::Acquire) & HOT_BIT != 0
    }

    /// One coherent (timestamp, hot) snapshot.
    pub fn load(&self) -> (Timestamp, bool) {
        let state = self.state.load(Ordering::Acquire);
        (unpack_ts(state), state & HOT_BIT != 0)
    }

    pub fn log_addr(&self) -> LogAddress {
        self.log_addr.load(Ordering::Acquire)
    }

    /// Cache row address; only meaningful while the record is hot.
    pub fn row_addr(&self) -> usize {
        self.row_addr.load(Ordering::Acquire) as usize
    }

    /// Re-point a record at a freshly appended log value, dropping any
    /// hot state. Used when a key is overwritten.
    pub(crate) fn retarget_cold(&self, log_addr: LogAddress, ts: Timestamp) {
        self.log_addr.store(log_addr, Ordering::Release);
        self.state.store(pack(ts, false), Ordering::Release);
    }

    /// Commit a promotion: flip to `(row_addr, new_ts, hot)` iff the
    /// current timestamp still equals `old_ts`. The hot bit may hold
    /// either value at the time of the CAS.
    pub(crate) fn try_promote(&self, old_ts: Timestamp, new_ts: Timestamp, row_addr: usize) -> bool {
        self.row_addr.store(row_addr as u64, Ordering::Release);
        let target = pack(new_ts, true);
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if unpack_ts(cur) != old_ts {
                return false;
            }
            match self.state.compare_exchange_weak(
                cur,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Flip hot -> cold, leaving the timestamp untouched. The log address
    /// becomes authoritative again.
    pub(crate) fn demote(&self) {
        self.state.fetch_and(!HOT_BIT, Ordering::AcqRel);
    }

    /// Refresh the timestamp of a still-hot record after a cache read.
    /// No-op once the record has been demoted.
    pub(crate) fn refresh(&self, new_ts: Timestamp) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state & HOT_BIT != 0).then(|| pack(new_ts, true))
            });
    }
}

/// Ordered key -> value-pointer map for one schema.
///
/// Value pointers are held by `Arc`, so their identity survives
/// concurrent insertion and removal; cursors capture that identity and
/// stay valid as stable reference points between read-modify-write steps.
#[derive(Debug, Default)]
pub struct Indexer {
    map: RwLock<BTreeMap<PrimaryKey, Arc<ValuePtr>>>,
}

impl Indexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh record, or return the existing one untouched. The
    /// boolean is true when the insert took place.
    pub fn insert(&self, key: PrimaryKey, vptr: ValuePtr) -> (Arc<ValuePtr>, bool) {
        let mut map = self.map.write();
        match map.entry(key) {
            std::collections::btree_map::Entry::Vacant(e) => {
                let arc = Arc::new(vptr);
                e.insert(arc.clone());
                (arc, true)
            }
            std::collections::btree_map::Entry::Occupied(e) => (e.get().clone(), false),
        }
    }

    pub fn get(&self, key: PrimaryKey) -> Option<Arc<ValuePtr>> {
        self.map.read().get(&key).cloned()
    }

    pub fn remove(&self, key: PrimaryKey) -> Option<Arc<ValuePtr>> {
        self.map.write().remove(&key)
    }

    pub fn cursor(self: &Arc<Self>, key: PrimaryKey) -> Option<IndexCursor> {
        let vptr = self.get(key)?;
        Some(IndexCursor {
            indexer: self.clone(),
            key,
            vptr,
        })
    }

    /// Up to `n` cursors with keys strictly greater than `after`.
    pub fn cursors_after(self: &Arc<Self>, after: Bound<PrimaryKey>, n: usize) -> Vec<IndexCursor> {
        let map = self.map.read();
        map.range((after, Bound::Unbounded))
            .take(n)
            .map(|(&key, vptr)| IndexCursor {
                indexer: self.clone(),
                key,
                vptr: vptr.clone(),
            })
            .collect()
    }

    /// Visit a snapshot of every entry. The callback runs under the read
    /// lock; callers collect and act afterwards.
    pub fn for_each(&self, mut f: impl FnMut(PrimaryKey, &Arc<ValuePtr>)) {
        for (key, vptr) in self.map.read().iter() {
            f(*key, vptr);
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

/// A stable reference point into one indexer: the key plus the value
/// pointer's identity. Cloning is cheap (two `Arc`s and a key).
#[derive(Debug, Clone)]
pub struct IndexCursor {
    indexer: Arc<Indexer>,
    key: PrimaryKey,
    vptr: Arc<ValuePtr>,
}

impl IndexCursor {
    pub(crate) fn new(indexer: Arc<Indexer>, key: PrimaryKey, vptr: Arc<ValuePtr>) -> Self {
        Self { indexer, key, vptr }
    }

    pub fn key(&self) -> PrimaryKey {
        self.key
    }

    pub fn value_ptr(&self) -> &Arc<ValuePtr> {
        &self.vptr
    }

    /// Peek at up to `n` successors of this cursor's key. Used by the
    /// slot allocator's neighbor-hint search.
    pub fn peek_next(&self, n: usize) -> Vec<(PrimaryKey, Arc<ValuePtr>)> {
        let map = self.indexer.map.read();
        map.range((Bound::Excluded(self.key), Bound::Unbounded))
            .take(n)
            .map(|(&key, vptr)| (key, vptr.clone()))
            .collect()
    }
}

/// One indexer per schema.
#[derive(Debug, Default)]
pub struct IndexerList {
    indexers: DashMap<SchemaId, Arc<Indexer>>,
}

impl IndexerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, schema_id: SchemaId) -> Arc<Indexer> {
        self.indexers
            .entry(schema_id)
            .or_insert_with(|| Arc::new(Indexer::new()))
            .clone()
    }

    pub fn get(&self, schema_id: SchemaId) -> Option<Arc<Indexer>> {
        self.indexers.get(&schema_id).map(|i| i.clone())
    }
}
