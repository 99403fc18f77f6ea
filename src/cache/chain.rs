// Per-schema page chain: a doubly linked list of pages holding rows of
// one schema, plus the slot geometry derived from the schema's fixed
// value size. Links and counters are stored atomically so the lock-free
// neighbor-hint search sees a consistent snapshot, but all mutation
// happens under the owning buffer's write lock.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::cache::page::{
    PageRef, RowAddr, RowOffset, BITMAP_SIZE, MAX_SLOTS, PAGE_HEADER_SIZE, PAGE_SIZE,
    ROW_HEADER_SIZE,
};
use crate::cache::pool::PagePool;
use crate::schema::Schema;

pub struct PageChain {
    schema: Arc<Schema>,
    value_size: usize,
    row_stride: usize,
    /// Rows start this many bytes after the page header (the bitmap
    /// extent).
    first_row_offset: usize,
    max_rows: u32,
    head: AtomicUsize,
    tail: AtomicUsize,
    pages: AtomicU32,
    live_rows: AtomicU32,
}

impl PageChain {
    pub fn new(schema: Arc<Schema>) -> Self {
        let value_size = schema.value_size();
        let row_stride = (ROW_HEADER_SIZE + value_size).div_ceil(8) * 8;
        let usable = PAGE_SIZE - PAGE_HEADER_SIZE - BITMAP_SIZE;
        let max_rows = ((usable / row_stride) as u32).min(MAX_SLOTS);
        debug!(
            "chain for schema {} ({}): value {} B, stride {} B, {} rows/page",
            schema.id, schema.name, value_size, row_stride, max_rows
        );
        Self {
            schema,
            value_size,
            row_stride,
            first_row_offset: BITMAP_SIZE,
            max_rows,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            pages: AtomicU32::new(0),
            live_rows: AtomicU32::new(0),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    pub fn max_rows(&self) -> u32 {
        self.max_rows
    }

    pub fn head(&self) -> Option<PageRef> {
        let raw = self.head.load(Ordering::Acquire);
        (raw != 0).then(|| unsafe { PageRef::from_raw(raw as *mut u8) })
    }

    pub fn tail(&self) -> Option<PageRef> {
        let raw = self.tail.load(Ordering::Acquire);
        (raw != 0).then(|| unsafe { PageRef::from_raw(raw as *mut u8) })
    }

    pub fn page_count(&self) -> u32 {
        self.pages.load(Ordering::Acquire)
    }

    pub fn live_rows(&self) -> u32 {
        self.live_rows.load(Ordering::Acquire)
    }

    pub(crate) fn add_live_row(&self) {
        self.live_rows.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub_live_row(&self) {
        let before = self.live_rows.fetch_sub(1, Ordering::AcqRel);
        assert!(
            before > 0,
            "live-row count underflow on schema {}",
            self.schema.id
        );
    }

    /// Fraction of slots in use across the chain's pages.
    pub fn occupancy_ratio(&self) -> f64 {
        let rows = self.live_rows() as f64;
        let capacity = self.page_count() as u64 * self.max_rows as u64;
        if rows == 0.0 || capacity == 0 {
            return 0.0;
        }
        rows / capacity as f64
    }

    /// Install the first page. Caller has initialized it and holds the
    /// write lock.
    pub(crate) fn init_head(&self, page: PageRef) {
        debug_assert!(self.head().is_none());
        page.set_prev_page(None);
        page.set_next_page(None);
        self.head.store(page.addr(), Ordering::Release);
        self.tail.store(page.addr(), Ordering::Release);
        self.pages.fetch_add(1, Ordering::AcqRel);
    }

    /// Link a fresh page directly after `after`, or at the tail when
    /// `after` already has no successor.
    pub(crate) fn insert_after(&self, after: PageRef, page: PageRef) {
        match after.next_page() {
            Some(next) => {
                page.set_next_page(Some(next));
                page.set_prev_page(Some(after));
                after.set_next_page(Some(page));
                next.set_prev_page(Some(page));
            }
            None => {
                page.set_next_page(None);
                page.set_prev_page(Some(after));
                after.set_next_page(Some(page));
                self.tail.store(page.addr(), Ordering::Release);
            }
        }
        self.pages.fetch_add(1, Ordering::AcqRel);
    }

    /// Append a fresh page at the tail in O(1).
    pub(crate) fn append_tail(&self, page: PageRef) {
        match self.tail() {
            Some(tail) => self.insert_after(tail, page),
            None => self.init_head(page),
        }
    }

    /// Unlink `page`, reset its header and bitmap, and hand it back to
    /// the free list.
    pub(crate) fn reclaim_page(&self, pool: &PagePool, page: PageRef) {
        let prev = page.prev_page();
        let next = page.next_page();
        match prev {
            Some(prev) => prev.set_next_page(next),
            None => self
                .head
                .store(next.map_or(0, |p| p.addr()), Ordering::Release),
        }
        match next {
            Some(next) => next.set_prev_page(prev),
            None => self
                .tail
                .store(prev.map_or(0, |p| p.addr()), Ordering::Release),
        }
        let before = self.pages.fetch_sub(1, Ordering::AcqRel);
        assert!(
            before > 0,
            "page count underflow on schema {}",
            self.schema.id
        );
        page.init();
        pool.release(page);
    }

    /// Walk the chain and reclaim every page with no hot rows, always
    /// preserving at least the head. Returns the number reclaimed.
    pub(crate) fn reclaim_empty_pages(&self, pool: &PagePool) -> usize {
        let mut reclaimed = 0;
        let Some(head) = self.head() else {
            return 0;
        };
        let mut cursor = head.next_page();
        while let Some(page) = cursor {
            cursor = page.next_page();
            if page.hot_rows() == 0 {
                self.reclaim_page(pool, page);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            debug!(
                "schema {}: reclaimed {} empty pages",
                self.schema.id, reclaimed
            );
        }
        reclaimed
    }

    /// Address of slot `offset` within `page`.
    pub fn row_addr(&self, page: PageRef, offset: RowOffset) -> RowAddr {
        debug_assert!(offset < self.max_rows);
        page.addr() + PAGE_HEADER_SIZE + self.first_row_offset + offset as usize * self.row_stride
    }

    /// Slot offset of a row address within `page`.
    ///
    /// Panics when the address does not land on a row stride boundary:
    /// a malformed address means a corrupted value pointer.
    pub fn slot_of(&self, page: PageRef, row: RowAddr) -> RowOffset {
        let rel = row
            .checked_sub(page.addr() + PAGE_HEADER_SIZE + self.first_row_offset)
            .unwrap_or_else(|| panic!("row address {row:#x} precedes the row area"));
        assert!(
            rel % self.row_stride == 0,
            "malformed row address {row:#x}: not on a {}-byte stride",
            self.row_stride
        );
        let offset = (rel / self.row_stride) as RowOffset;
        assert!(
            offset < self.max_rows,
            "malformed row address {row:#x}: slot {offset} out of range"
        );
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, SchemaField, SchemaRegistry};

    fn chain_with_value_size(size: usize) -> (PageChain, Arc<Schema>) {
        let registry = SchemaRegistry::new();
        let schema = registry.create(
            "t",
            0,
            vec![SchemaField::with_size(FieldType::String, "v", size)],
        );
        (PageChain::new(schema.clone()), schema)
    }

    #[test]
    fn test_geometry_derivation() {
        // 12-byte value: stride rounds 32 + 12 up to 48.
        let (chain, _) = chain_with_value_size(12);
        assert_eq!(chain.row_stride(), 48);
        assert_eq!(chain.max_rows(), ((4096 - 64 - 16) / 48) as u32);

        // A wide value still fits at least one row per page.
        let (chain, _) = chain_with_value_size(3900);
        assert_eq!(chain.max_rows(), 1);

        // Too wide to cache at all.
        let (chain, _) = chain_with_value_size(4080);
        assert_eq!(chain.max_rows(), 0);
    }

    #[test]
    fn test_max_rows_never_exceeds_bitmap() {
        // Even the smallest possible stride stays within the 128 slots
        // the bitmap can track.
        let (chain, _) = chain_with_value_size(0);
        assert_eq!(chain.row_stride(), ROW_HEADER_SIZE);
        assert!(chain.max_rows() <= MAX_SLOTS);
    }

    #[test]
    fn test_link_and_reclaim() {
        let (chain, _) = chain_with_value_size(12);
        let pool = PagePool::new(4).unwrap();

        let a = pool.allocate().unwrap();
        a.init();
        chain.init_head(a);
        let b = pool.allocate().unwrap();
        b.init();
        chain.append_tail(b);
        let c = pool.allocate().unwrap();
        c.init();
        chain.insert_after(a, c);

        // Order is now a -> c -> b.
        assert_eq!(chain.head(), Some(a));
        assert_eq!(a.next_page(), Some(c));
        assert_eq!(c.next_page(), Some(b));
        assert_eq!(chain.tail(), Some(b));
        assert_eq!(chain.page_count(), 3);

        chain.reclaim_page(&pool, c);
        assert_eq!(a.next_page(), Some(b));
        assert_eq!(b.prev_page(), Some(a));
        assert_eq!(chain.page_count(), 2);
        assert_eq!(pool.free_pages(), 2);
    }

    #[test]
    fn test_reclaim_empty_preserves_head() {
        let (chain, _) = chain_with_value_size(12);
        let pool = PagePool::new(4).unwrap();
        for _ in 0..3 {
            let page = pool.allocate().unwrap();
            page.init();
            chain.append_tail(page);
        }
        let head = chain.head().unwrap();
        let second = head.next_page().unwrap();
        second.set_slot(0);

        let reclaimed = chain.reclaim_empty_pages(&pool);
        assert_eq!(reclaimed, 1);
        assert_eq!(chain.head(), Some(head));
        assert_eq!(head.next_page(), Some(second));
        assert_eq!(chain.page_count(), 2);
    }

    #[test]
    fn test_row_addr_slot_roundtrip() {
        let (chain, _) = chain_with_value_size(12);
        let pool = PagePool::new(1).unwrap();
        let page = pool.allocate().unwrap();
        page.init();
        chain.init_head(page);

        for offset in [0u32, 1, 5, chain.max_rows() - 1] {
            let addr = chain.row_addr(page, offset);
            assert_eq!(chain.slot_of(page, addr), offset);
        }
    }

    #[test]
    #[should_panic(expected = "malformed row address")]
    fn test_slot_of_rejects_misaligned_address() {
        let (chain, _) = chain_with_value_size(12);
        let pool = PagePool::new(1).unwrap();
        let page = pool.allocate().unwrap();
        page.init();
        chain.init_head(page);
        chain.slot_of(page, chain.row_addr(page, 0) + 3);
    }
}
