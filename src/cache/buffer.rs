// The row buffer engine: slot allocation, the sync/async promotion
// protocol, the timestamp-guarded read path, and the watermark-driven
// evictor.
//
// Locking discipline: the write lock covers slot commit (row bytes,
// bitmap, chain counters, free list) and the value-pointer CAS, so two
// promotions of the same key are serialized and a losing writer always
// rolls its slot back before anyone can reuse it. Readers never take the
// lock; they validate optimistically against the row timestamp. The GC
// lock serializes eviction cycles.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::utils::Backoff;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::cache::chain::PageChain;
use crate::cache::page::{
    self, PageRef, RowAddr, RowOffset, BITMAP_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE, ROW_HEADER_SIZE,
};
use crate::cache::pool::PagePool;
use crate::cache::queue::{PromotionQueue, DEFAULT_QUEUE_CAPACITY};
use crate::cache::stats::{SchemaStats, StatsSnapshot, DEFAULT_STATS_INTERVAL};
use crate::clock::Timestamp;
use crate::error::{Error, Result};
use crate::index::{IndexCursor, IndexerList, ValuePtr};
use crate::schema::{SchemaId, SchemaRegistry};

/// How many index successors the neighbor-hint search inspects.
const NEIGHBOR_SEARCH_DEPTH: usize = 3;

#[derive(Debug, Clone)]
pub struct RowBufferOptions {
    pub max_pages: usize,
    /// Starting point for the retention watermark, before the first GC
    /// cycle computes its own.
    pub initial_watermark: Timestamp,
    /// Maximum age of a hot row before it becomes a GC candidate.
    pub retention: Duration,
    /// Bound on the linear page scan during slot allocation.
    pub max_page_search: u32,
    /// Route promotions through the per-schema rings and a background
    /// drain thread.
    pub async_write: bool,
    /// Run the GC cycle on a dedicated thread.
    pub async_gc: bool,
    /// Occupancy the evictor drives the pool back down to.
    pub target_occupancy: f64,
    /// Occupancy at which the async GC starts cycling.
    pub gc_start_occupancy: f64,
    pub gc_interval: Duration,
    pub queue_capacity: u32,
    pub stats_interval: u64,
}

impl Default for RowBufferOptions {
    fn default() -> Self {
        Self {
            max_pages: 1024,
            initial_watermark: Timestamp::from_ticks(0),
            retention: Duration::from_secs(60),
            max_page_search: 5,
            async_write: false,
            async_gc: false,
            target_occupancy: 0.70,
            gc_start_occupancy: 0.75,
            gc_interval: Duration::from_micros(100_000),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

/// What happened to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Synchronously committed into a cache slot.
    Committed,
    /// Handed to the background worker.
    Enqueued,
    /// The promotion ring was full; the write was silently dropped and
    /// the log remains authoritative.
    Dropped,
}

pub struct RowBuffer {
    opts: RowBufferOptions,
    pool: PagePool,
    chains: DashMap<SchemaId, Arc<PageChain>>,
    queues: DashMap<SchemaId, Arc<PromotionQueue>>,
    stats: SchemaStats,
    indexers: Arc<IndexerList>,
    registry: Arc<SchemaRegistry>,
    write_lock: Mutex<()>,
    gc_lock: Mutex<()>,
    gc_failed_rounds: AtomicU32,
    evictions: AtomicU64,
    watermark: AtomicU64,
    shutdown: Arc<AtomicBool>,
    promote_worker: Mutex<Option<JoinHandle<()>>>,
    gc_worker: Mutex<Option<JoinHandle<()>>>,
}

impl RowBuffer {
    pub fn new(
        opts: RowBufferOptions,
        indexers: Arc<IndexerList>,
        registry: Arc<SchemaRegistry>,
    ) -> Result<Arc<Self>> {
        let pool = PagePool::new(opts.max_pages)?;
        let stats = SchemaStats::new(opts.stats_interval);
        let watermark = AtomicU64::new(opts.initial_watermark.ticks());

        let buffer = Arc::new(Self {
            pool,
            chains: DashMap::new(),
            queues: DashMap::new(),
            stats,
            indexers,
            registry,
            write_lock: Mutex::new(()),
            gc_lock: Mutex::new(()),
            gc_failed_rounds: AtomicU32::new(0),
            evictions: AtomicU64::new(0),
            watermark,
            shutdown: Arc::new(AtomicBool::new(false)),
            promote_worker: Mutex::new(None),
            gc_worker: Mutex::new(None),
            opts,
        });

        if buffer.opts.async_write {
            let weak = Arc::downgrade(&buffer);
            let shutdown = buffer.shutdown.clone();
            let handle = thread::Builder::new()
                .name("rowbuf-promote".into())
                .spawn(move || Self::promotion_loop(weak, shutdown))?;
            *buffer.promote_worker.lock() = Some(handle);
        }
        if buffer.opts.async_gc {
            let weak = Arc::downgrade(&buffer);
            let shutdown = buffer.shutdown.clone();
            let interval = buffer.opts.gc_interval;
            let start = buffer.opts.gc_start_occupancy;
            let handle = thread::Builder::new()
                .name("rowbuf-gc".into())
                .spawn(move || Self::gc_loop(weak, shutdown, interval, start))?;
            *buffer.gc_worker.lock() = Some(handle);
        }

        Ok(buffer)
    }

    // Chain management.

    fn chain(&self, schema_id: SchemaId) -> Result<Arc<PageChain>> {
        if let Some(chain) = self.chains.get(&schema_id) {
            return Ok(chain.clone());
        }
        self.create_chain(schema_id)
    }

    /// Lazily build the cache for a schema: derive the slot geometry,
    /// seed the chain with one page, and (in async mode) set up the
    /// promotion ring.
    fn create_chain(&self, schema_id: SchemaId) -> Result<Arc<PageChain>> {
        let schema = self
            .registry
            .find(schema_id)
            .ok_or(Error::SchemaUnknown(schema_id))?;

        let _guard = self.write_lock.lock();
        if let Some(chain) = self.chains.get(&schema_id) {
            return Ok(chain.clone());
        }

        let chain = Arc::new(PageChain::new(schema.clone()));
        if chain.max_rows() == 0 {
            return Err(Error::RecordTooLarge {
                size: chain.value_size(),
                max: PAGE_SIZE - PAGE_HEADER_SIZE - BITMAP_SIZE - ROW_HEADER_SIZE,
            });
        }
        let head = self.pool.allocate().ok_or(Error::NoSpace)?;
        head.init();
        head.set_schema(schema_id, schema.version);
        chain.init_head(head);

        info!(
            "created cache for schema {} ({}): {} rows per page, {} free pages left",
            schema_id,
            schema.name,
            chain.max_rows(),
            self.pool.free_pages()
        );

        self.stats.register(schema_id);
        if self.opts.async_write {
            self.queues.insert(
                schema_id,
                Arc::new(PromotionQueue::new(
                    schema_id,
                    chain.value_size(),
                    self.opts.queue_capacity,
                )),
            );
        }
        self.chains.insert(schema_id, chain.clone());
        Ok(chain)
    }

    // Slot allocation.

    /// Lock-free neighbor hint: step forward in the index and try the
    /// page holding the nearest hot neighbor, preferring slots at or
    /// after the neighbor's.
    fn probe_neighbor_slot(
        &self,
        chain: &PageChain,
        cursor: &IndexCursor,
    ) -> Option<(PageRef, RowOffset)> {
        for (_, vptr) in cursor.peek_next(NEIGHBOR_SEARCH_DEPTH) {
            if !vptr.is_hot() {
                continue;
            }
            let row = vptr.row_addr();
            if !self.pool.owns(row) {
                continue;
            }
            let hinted = self.pool.page_of(row);
            if hinted.schema_id() != chain.schema().id {
                continue;
            }
            if hinted.hot_rows() as u32 >= chain.max_rows() {
                return None;
            }
            let offset = chain.slot_of(hinted, row);
            let slot = hinted
                .first_zero_bit(chain.max_rows(), offset, None)
                .or_else(|| hinted.first_zero_bit(chain.max_rows(), 0, Some(offset)));
            return slot.map(|s| (hinted, s));
        }
        None
    }

    /// Bounded first-fit scan over the chain, growing it by one page
    /// when every probed page is full. Caller holds the write lock.
    fn locate_slot_locked(&self, chain: &PageChain) -> Result<(PageRef, RowOffset)> {
        let mut visited = 0u32;
        let mut cursor = chain.head();
        let mut last_probed = None;
        while let Some(probe) = cursor {
            if visited >= self.opts.max_page_search.max(1) {
                break;
            }
            visited += 1;
            last_probed = Some(probe);
            // A full page is skipped without touching its bitmap.
            if (probe.hot_rows() as u32) < chain.max_rows() {
                if let Some(offset) = probe.first_zero_bit(chain.max_rows(), 0, None) {
                    return Ok((probe, offset));
                }
            }
            cursor = probe.next_page();
        }

        let fresh = self.pool.allocate().ok_or(Error::NoSpace)?;
        fresh.init();
        fresh.set_schema(chain.schema().id, chain.schema().version);
        match last_probed {
            Some(after) => chain.insert_after(after, fresh),
            None => chain.append_tail(fresh),
        }
        trace!(
            "schema {}: grew chain to {} pages",
            chain.schema().id,
            chain.page_count()
        );
        Ok((fresh, 0))
    }

    // Write path.

    /// Promote a row. Sync mode commits inline; async mode enqueues for
    /// the background worker and reports `Dropped` when the ring is
    /// full.
    pub fn write(
        &self,
        old_ts: Timestamp,
        new_ts: Timestamp,
        schema_id: SchemaId,
        value: &[u8],
        cursor: &IndexCursor,
    ) -> Result<WriteOutcome> {
        let chain = match self.chain(schema_id) {
            Err(Error::NoSpace) => {
                self.run_gc();
                self.chain(schema_id)?
            }
            other => other?,
        };
        if value.len() != chain.value_size() {
            return Err(Error::SizeMismatch {
                got: value.len(),
                want: chain.value_size(),
            });
        }

        if self.opts.async_write {
            let queue = self
                .queues
                .get(&schema_id)
                .map(|q| q.clone())
                .expect("async chain always has a promotion queue");
            if queue.enqueue(old_ts, new_ts, cursor, value) {
                Ok(WriteOutcome::Enqueued)
            } else {
                debug!("promotion ring full for schema {schema_id}, write dropped");
                Ok(WriteOutcome::Dropped)
            }
        } else {
            self.sync_write(old_ts, new_ts, &chain, value, cursor)?;
            Ok(WriteOutcome::Committed)
        }
    }

    /// Inline promotion with one opportunistic GC retry on `NoSpace`.
    fn sync_write(
        &self,
        old_ts: Timestamp,
        new_ts: Timestamp,
        chain: &Arc<PageChain>,
        value: &[u8],
        cursor: &IndexCursor,
    ) -> Result<()> {
        match self.commit_row(old_ts, new_ts, chain, value, cursor) {
            Err(Error::NoSpace) => {
                debug!(
                    "schema {}: no free slot, running opportunistic gc",
                    chain.schema().id
                );
                self.run_gc();
                self.commit_row(old_ts, new_ts, chain, value, cursor)
            }
            other => other,
        }
    }

    fn commit_row(
        &self,
        old_ts: Timestamp,
        new_ts: Timestamp,
        chain: &Arc<PageChain>,
        value: &[u8],
        cursor: &IndexCursor,
    ) -> Result<()> {
        let vptr = cursor.value_ptr();
        let hint = self.probe_neighbor_slot(chain, cursor);

        let guard = self.write_lock.lock();
        // The hint was probed without the lock; the page may have been
        // reclaimed (or handed to another schema) in the meantime.
        let (target, offset) = match hint {
            Some((page, offset))
                if page.schema_id() == chain.schema().id && !page.slot_set(offset) =>
            {
                (page, offset)
            }
            _ => self.locate_slot_locked(chain)?,
        };
        let row = chain.row_addr(target, offset);

        // Publication order: row bytes, then the bitmap bit, then the
        // value-pointer CAS. A reader that sees the hot flag therefore
        // sees a fully initialized row.
        page::set_row_timestamp(row, new_ts);
        page::set_row_log_addr(row, vptr.log_addr());
        page::set_row_value_ptr(row, Arc::as_ptr(vptr) as u64);
        page::set_row_crc(row, crc32fast::hash(value));
        page::write_row_value(row, value);
        let set = target.set_slot(offset);
        assert!(set, "slot {offset} double-allocated under the write lock");
        chain.add_live_row();

        // Consistency check: a concurrent update may have overtaken this
        // promotion between the index lookup and now.
        if vptr.timestamp() != old_ts || !vptr.try_promote(old_ts, new_ts, row) {
            target.clear_slot(offset);
            chain.sub_live_row();
            drop(guard);
            trace!(
                "schema {}: promotion of key {} lost its timestamp race",
                chain.schema().id,
                cursor.key()
            );
            return Err(Error::Conflict { expected: old_ts });
        }
        drop(guard);

        trace!(
            "schema {}: promoted key {} into row {row:#x} at {new_ts}",
            chain.schema().id,
            cursor.key()
        );
        Ok(())
    }

    // Read path.

    /// Copy a hot row out and refresh its timestamp. Never allocates and
    /// never blocks a writer; a concurrent update surfaces as `Stale`
    /// and the caller re-resolves through the index.
    pub fn read(
        &self,
        old_ts: Timestamp,
        new_ts: Timestamp,
        row: RowAddr,
        schema_id: SchemaId,
        out: &mut Vec<u8>,
        vptr: &ValuePtr,
    ) -> Result<()> {
        let chain = self
            .chains
            .get(&schema_id)
            .map(|c| c.clone())
            .ok_or(Error::SchemaUnknown(schema_id))?;
        // Validates the address is inside the arena.
        let _page = self.pool.page_of(row);

        out.resize(chain.value_size(), 0);
        page::read_row_value(row, out);

        let found = page::row_timestamp(row);
        if found != old_ts {
            return Err(Error::Stale {
                expected: old_ts,
                found,
            });
        }
        page::set_row_timestamp(row, new_ts);
        vptr.refresh(new_ts);
        Ok(())
    }

    // Eviction.

    /// Clear the slot behind a row address and reclaim its page when it
    /// empties. The value pointer is untouched; callers flip it first.
    pub fn drop_row(&self, row: RowAddr) -> Result<()> {
        let _guard = self.write_lock.lock();
        let target = self.pool.page_of(row);
        let schema_id = target.schema_id();
        let chain = self
            .chains
            .get(&schema_id)
            .map(|c| c.clone())
            .unwrap_or_else(|| {
                panic!("row {row:#x} belongs to schema {schema_id} with no chain")
            });
        let offset = chain.slot_of(target, row);
        if !target.clear_slot(offset) {
            return Err(Error::NotFound);
        }
        chain.sub_live_row();
        if target.hot_rows() == 0 {
            chain.reclaim_page(&self.pool, target);
        }
        Ok(())
    }

    /// Flip a hot entry cold and free its slot.
    pub fn evict_row(&self, cursor: &IndexCursor) -> Result<()> {
        let vptr = cursor.value_ptr();
        if !vptr.is_hot() {
            return Err(Error::NotFound);
        }
        let row = vptr.row_addr();
        vptr.demote();
        self.drop_row(row)?;
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Reclaim every empty page of a schema, preserving the chain head.
    pub fn reclaim_empty_pages(&self, schema_id: SchemaId) -> Result<usize> {
        let chain = self
            .chains
            .get(&schema_id)
            .map(|c| c.clone())
            .ok_or(Error::SchemaUnknown(schema_id))?;
        let _guard = self.write_lock.lock();
        Ok(chain.reclaim_empty_pages(&self.pool))
    }

    // GC.

    /// One eviction cycle: sort schemas coldest-first by hit ratio and
    /// evict rows past the retention watermark until the pool is back
    /// under the target occupancy. Returns true when the target holds at
    /// the end of the cycle.
    pub fn run_gc(&self) -> bool {
        let _guard = self.gc_lock.lock();
        let occupancy = self.pool.occupancy_ratio();
        debug!(
            "gc cycle: {} / {} pages free, occupancy {:.3}",
            self.pool.free_pages(),
            self.pool.max_pages(),
            occupancy
        );
        if occupancy < self.opts.target_occupancy {
            return true;
        }

        let mut candidates: Vec<(SchemaId, Arc<PageChain>)> = self
            .chains
            .iter()
            .filter(|entry| entry.value().live_rows() > 0)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        candidates.sort_by(|a, b| {
            let ra = self.stats.hit_ratio(a.0).unwrap_or(f64::INFINITY);
            let rb = self.stats.hit_ratio(b.0).unwrap_or(f64::INFINITY);
            ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut achieved = false;
        for (schema_id, chain) in candidates {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if self.gc_schema(schema_id, &chain) {
                achieved = true;
                break;
            }
        }
        debug!(
            "gc cycle done: occupancy now {:.3}",
            self.pool.occupancy_ratio()
        );
        achieved
    }

    /// Evict one schema's stale rows. The retention window tightens
    /// exponentially with consecutive failed rounds so eviction keeps
    /// making progress under memory pressure.
    fn gc_schema(&self, schema_id: SchemaId, chain: &Arc<PageChain>) -> bool {
        let chain_occupancy = chain.occupancy_ratio();
        if chain_occupancy == 0.0 {
            return false;
        }
        let failed = self.gc_failed_rounds.load(Ordering::Relaxed);
        let window_ns = self.opts.retention.as_nanos() as f64
            * (-(failed as f64)).exp2()
            * (1.0 - chain_occupancy)
            / (1.0 - self.opts.target_occupancy);
        let watermark = Timestamp::now().move_backward(window_ns as u64);
        self.watermark.store(watermark.ticks(), Ordering::Relaxed);

        let Some(indexer) = self.indexers.get(schema_id) else {
            return false;
        };
        let mut cold = Vec::new();
        indexer.for_each(|key, vptr| {
            let (ts, hot) = vptr.load();
            if hot && ts <= watermark {
                cold.push((key, vptr.clone()));
            }
        });

        let mut evicted = 0u64;
        let mut achieved = false;
        for (key, vptr) in cold {
            let cursor = IndexCursor::new(indexer.clone(), key, vptr);
            if self.evict_row(&cursor).is_ok() {
                evicted += 1;
                if self.pool.occupancy_ratio() < self.opts.target_occupancy {
                    achieved = true;
                    break;
                }
            }
        }

        if achieved {
            self.gc_failed_rounds.store(0, Ordering::Relaxed);
        } else {
            self.gc_failed_rounds.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            "gc schema {schema_id}: evicted {evicted} rows below watermark {watermark}, \
             chain occupancy {:.4}",
            chain.occupancy_ratio()
        );
        achieved
    }

    // Statistics.

    pub fn schema_hit(&self, schema_id: SchemaId) {
        self.stats.hit(schema_id);
    }

    pub fn schema_miss(&self, schema_id: SchemaId) {
        self.stats.miss(schema_id);
    }

    /// `None` for a schema never accessed.
    pub fn hit_ratio(&self, schema_id: SchemaId) -> Option<f64> {
        self.stats.hit_ratio(schema_id)
    }

    pub fn stats_snapshot(&self) -> Vec<StatsSnapshot> {
        self.stats.snapshot_all()
    }

    // Introspection.

    pub fn free_pages(&self) -> usize {
        self.pool.free_pages()
    }

    pub fn max_pages(&self) -> usize {
        self.pool.max_pages()
    }

    pub fn occupancy_ratio(&self) -> f64 {
        self.pool.occupancy_ratio()
    }

    /// Whether an address points into the buffer's arena.
    pub fn owns(&self, addr: usize) -> bool {
        self.pool.owns(addr)
    }

    pub fn chain_pages(&self, schema_id: SchemaId) -> Option<u32> {
        self.chains.get(&schema_id).map(|c| c.page_count())
    }

    pub fn chain_live_rows(&self, schema_id: SchemaId) -> Option<u32> {
        self.chains.get(&schema_id).map(|c| c.live_rows())
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn watermark(&self) -> Timestamp {
        Timestamp::from_ticks(self.watermark.load(Ordering::Relaxed))
    }

    /// True once every promotion ring has been drained.
    pub fn queues_empty(&self) -> bool {
        self.queues.iter().all(|entry| entry.value().is_empty())
    }

    // Background workers.

    fn promotion_loop(this: Weak<RowBuffer>, shutdown: Arc<AtomicBool>) {
        let backoff = Backoff::new();
        let mut scratch = Vec::new();
        while !shutdown.load(Ordering::Acquire) {
            let Some(buffer) = this.upgrade() else {
                break;
            };
            let queues: Vec<Arc<PromotionQueue>> = buffer
                .queues
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            let mut drained = false;
            for queue in queues {
                while let Some((old_ts, new_ts, cursor)) = queue.dequeue(&mut scratch) {
                    drained = true;
                    let Some(chain) = buffer.chains.get(&queue.schema_id()).map(|c| c.clone())
                    else {
                        continue;
                    };
                    if let Err(e) = buffer.sync_write(old_ts, new_ts, &chain, &scratch, &cursor) {
                        debug!(
                            "async promotion skipped for schema {}: {e}",
                            queue.schema_id()
                        );
                    }
                }
            }
            drop(buffer);
            if drained {
                backoff.reset();
            } else if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    fn gc_loop(
        this: Weak<RowBuffer>,
        shutdown: Arc<AtomicBool>,
        interval: Duration,
        start_occupancy: f64,
    ) {
        while !shutdown.load(Ordering::Acquire) {
            let Some(buffer) = this.upgrade() else {
                break;
            };
            if buffer.pool.occupancy_ratio() >= start_occupancy {
                buffer.run_gc();
            }
            drop(buffer);
            thread::sleep(interval);
        }
    }

    /// Stop the background workers and emit the shutdown counters.
    /// Idempotent; also invoked by Drop.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in [&self.promote_worker, &self.gc_worker] {
            let Some(handle) = worker.lock().take() else {
                continue;
            };
            // The last handle to the buffer may be dropped on a worker
            // thread itself; a worker never joins itself.
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                warn!("row buffer worker exited with a panic");
            }
        }
        info!(
            "row buffer shutdown: {} page allocations, {} releases, {} evictions, {} free pages",
            self.pool.allocate_count(),
            self.pool.release_count(),
            self.eviction_count(),
            self.pool.free_pages()
        );
        self.stats.log_summary();
    }
}

impl Drop for RowBuffer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
