// Page pool: one contiguous 4 KiB-aligned arena carved into pages, plus
// the free list. Because the arena is aligned to the page size, masking a
// row address with `!(PAGE_SIZE - 1)` yields the owning page in O(1).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::page::{PageRef, RowAddr, PAGE_SIZE};
use crate::error::{Error, Result};

pub struct PagePool {
    arena: NonNull<u8>,
    layout: Layout,
    max_pages: usize,
    free: Mutex<VecDeque<PageRef>>,
    allocated: AtomicU64,
    released: AtomicU64,
}

// The arena is owned for the pool's lifetime; page handles only travel
// between the free list and schema chains under the buffer write lock.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    pub fn new(max_pages: usize) -> Result<Self> {
        assert!(max_pages > 0, "page pool needs at least one page");
        let layout = Layout::from_size_align(max_pages * PAGE_SIZE, PAGE_SIZE)
            .expect("page pool layout is valid");
        let raw = unsafe { alloc_zeroed(layout) };
        let arena = NonNull::new(raw).ok_or(Error::NoSpace)?;

        let mut free = VecDeque::with_capacity(max_pages);
        for idx in 0..max_pages {
            free.push_back(unsafe { PageRef::from_raw(raw.add(idx * PAGE_SIZE)) });
        }
        debug!("page pool ready: {} pages of {} bytes", max_pages, PAGE_SIZE);

        Ok(Self {
            arena,
            layout,
            max_pages,
            free: Mutex::new(free),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
        })
    }

    /// Pop a page off the free-list front, or `None` when exhausted.
    pub fn allocate(&self) -> Option<PageRef> {
        let page = self.free.lock().pop_front()?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(page)
    }

    /// Push a reclaimed page back on the free-list front.
    pub fn release(&self, page: PageRef) {
        debug_assert!(self.owns(page.addr()));
        self.released.fetch_add(1, Ordering::Relaxed);
        self.free.lock().push_front(page);
    }

    /// Owning page of a row address in O(1).
    ///
    /// Panics on addresses outside the arena: those only arise from
    /// corrupted value pointers and are not recoverable.
    pub fn page_of(&self, row: RowAddr) -> PageRef {
        assert!(
            self.owns(row),
            "row address {row:#x} is outside the page pool arena"
        );
        unsafe { PageRef::from_raw((row & !(PAGE_SIZE - 1)) as *mut u8) }
    }

    pub fn owns(&self, addr: usize) -> bool {
        let base = self.arena.as_ptr() as usize;
        addr >= base && addr < base + self.max_pages * PAGE_SIZE
    }

    pub fn free_pages(&self) -> usize {
        self.free.lock().len()
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// `1 - free / max`: the fraction of pages assigned to some chain.
    pub fn occupancy_ratio(&self) -> f64 {
        1.0 - self.free_pages() as f64 / self.max_pages as f64
    }

    pub fn allocate_count(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn release_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        unsafe { dealloc(self.arena.as_ptr(), self.layout) }
    }
}
