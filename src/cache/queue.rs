// Bounded promotion ring, one per schema. Producers claim a slot with a
// fetch-add on the head counter and back out with a fetch-sub when the
// ring is full; a single background worker drains entries in order. Each
// slot carries a preallocated value buffer sized to the schema's row and
// a ready flag that publishes the producer's copy to the worker.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::clock::Timestamp;
use crate::index::IndexCursor;
use crate::schema::SchemaId;

pub const DEFAULT_QUEUE_CAPACITY: u32 = 16;

struct Slot {
    ready: AtomicBool,
    entry: UnsafeCell<Entry>,
}

struct Entry {
    old_ts: Timestamp,
    new_ts: Timestamp,
    cursor: Option<IndexCursor>,
    value: Box<[u8]>,
}

pub struct PromotionQueue {
    schema_id: SchemaId,
    value_size: usize,
    capacity: u32,
    slots: Box<[Slot]>,
    head: AtomicU32,
    tail: AtomicU32,
}

// A producer owns its claimed slot until it raises `ready`; the single
// consumer owns a slot from the `ready` observation until it bumps the
// tail. The capacity check keeps claims from lapping unconsumed slots.
unsafe impl Send for PromotionQueue {}
unsafe impl Sync for PromotionQueue {}

impl PromotionQueue {
    pub fn new(schema_id: SchemaId, value_size: usize, capacity: u32) -> Self {
        assert!(capacity > 0, "promotion queue capacity must be positive");
        let slots = (0..capacity)
            .map(|_| Slot {
                ready: AtomicBool::new(false),
                entry: UnsafeCell::new(Entry {
                    old_ts: Timestamp::default(),
                    new_ts: Timestamp::default(),
                    cursor: None,
                    value: vec![0u8; value_size].into_boxed_slice(),
                }),
            })
            .collect();
        Self {
            schema_id,
            value_size,
            capacity,
            slots,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    pub fn schema_id(&self) -> SchemaId {
        self.schema_id
    }

    /// Copy one promotion into the ring. Returns false when the ring is
    /// full; the caller then proceeds as if no promotion happened.
    pub fn enqueue(
        &self,
        old_ts: Timestamp,
        new_ts: Timestamp,
        cursor: &IndexCursor,
        value: &[u8],
    ) -> bool {
        debug_assert_eq!(value.len(), self.value_size);
        let claimed = self.head.fetch_add(1, Ordering::AcqRel);
        if claimed.wrapping_sub(self.tail.load(Ordering::Acquire)) >= self.capacity {
            self.head.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        let slot = &self.slots[(claimed % self.capacity) as usize];
        unsafe {
            let entry = &mut *slot.entry.get();
            entry.old_ts = old_ts;
            entry.new_ts = new_ts;
            entry.cursor = Some(cursor.clone());
            entry.value.copy_from_slice(value);
        }
        slot.ready.store(true, Ordering::Release);
        true
    }

    /// Pop the next ready entry, copying its value into `scratch`.
    /// Single-consumer only. Returns `None` when the ring is empty or
    /// the next producer has not finished its copy yet.
    pub fn dequeue(&self, scratch: &mut Vec<u8>) -> Option<(Timestamp, Timestamp, IndexCursor)> {
        let tail = self.tail.load(Ordering::Acquire);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let slot = &self.slots[(tail % self.capacity) as usize];
        if !slot.ready.load(Ordering::Acquire) {
            return None;
        }

        let popped = unsafe {
            let entry = &mut *slot.entry.get();
            scratch.clear();
            scratch.extend_from_slice(&entry.value);
            (
                entry.old_ts,
                entry.new_ts,
                entry.cursor.take().expect("ready slot carries a cursor"),
            )
        };
        slot.ready.store(false, Ordering::Release);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(popped)
    }

    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire) == self.head.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Indexer, ValuePtr};
    use std::sync::Arc;

    fn cursor_for(key: u64) -> IndexCursor {
        let idx = Arc::new(Indexer::new());
        idx.insert(key, ValuePtr::cold(key, Timestamp::from_ticks(1)));
        idx.cursor(key).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let queue = PromotionQueue::new(1, 4, 8);
        for i in 0..5u64 {
            let ok = queue.enqueue(
                Timestamp::from_ticks(i),
                Timestamp::from_ticks(i + 100),
                &cursor_for(i),
                &[i as u8; 4],
            );
            assert!(ok);
        }

        let mut scratch = Vec::new();
        for i in 0..5u64 {
            let (old_ts, new_ts, cursor) = queue.dequeue(&mut scratch).unwrap();
            assert_eq!(old_ts, Timestamp::from_ticks(i));
            assert_eq!(new_ts, Timestamp::from_ticks(i + 100));
            assert_eq!(cursor.key(), i);
            assert_eq!(scratch, vec![i as u8; 4]);
        }
        assert!(queue.dequeue(&mut scratch).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_ring_rejects() {
        let queue = PromotionQueue::new(1, 4, 4);
        let cursor = cursor_for(9);
        for _ in 0..4 {
            assert!(queue.enqueue(
                Timestamp::from_ticks(1),
                Timestamp::from_ticks(2),
                &cursor,
                &[0u8; 4]
            ));
        }
        // Fifth producer backs out.
        assert!(!queue.enqueue(
            Timestamp::from_ticks(1),
            Timestamp::from_ticks(2),
            &cursor,
            &[0u8; 4]
        ));

        // Draining one entry frees one slot.
        let mut scratch = Vec::new();
        assert!(queue.dequeue(&mut scratch).is_some());
        assert!(queue.enqueue(
            Timestamp::from_ticks(3),
            Timestamp::from_ticks(4),
            &cursor,
            &[1u8; 4]
        ));
    }

    #[test]
    fn test_slot_reuse_across_wrap() {
        let queue = PromotionQueue::new(1, 4, 2);
        let cursor = cursor_for(3);
        let mut scratch = Vec::new();
        for round in 0..10u64 {
            assert!(queue.enqueue(
                Timestamp::from_ticks(round),
                Timestamp::from_ticks(round + 1),
                &cursor,
                &[round as u8; 4]
            ));
            let (old_ts, _, _) = queue.dequeue(&mut scratch).unwrap();
            assert_eq!(old_ts, Timestamp::from_ticks(round));
            assert_eq!(scratch, vec![round as u8; 4]);
        }
    }
}
