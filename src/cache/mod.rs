// Page-based row buffer: a schema-aware slab cache that keeps hot rows
// of the value log in DRAM pages, promotes on miss, and evicts by
// retention watermark when the pool fills up.

pub mod buffer;
pub mod chain;
pub mod page;
pub mod pool;
pub mod queue;
pub mod stats;

pub use buffer::{RowBuffer, RowBufferOptions, WriteOutcome};
pub use chain::PageChain;
pub use page::{RowAddr, RowOffset, MAX_SLOTS, PAGE_HEADER_SIZE, PAGE_SIZE, ROW_HEADER_SIZE};
pub use pool::PagePool;
pub use queue::{PromotionQueue, DEFAULT_QUEUE_CAPACITY};
pub use stats::{AccessStats, SchemaStats, StatsSnapshot, DEFAULT_STATS_INTERVAL};
