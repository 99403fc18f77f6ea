// HotKV - key-value store with a page-based DRAM row cache over an
// append-only value log
// Core library module

pub mod cache;
pub mod clock;
pub mod error;
pub mod index;
pub mod schema;
pub mod store;
pub mod vlog;

pub use cache::{RowBuffer, RowBufferOptions, WriteOutcome};
pub use clock::Timestamp;
pub use error::{Error, Result};
pub use index::{IndexCursor, Indexer, IndexerList, PrimaryKey, ValuePtr};
pub use schema::{FieldType, Schema, SchemaField, SchemaId, SchemaRegistry};
pub use store::{Store, StoreOptions};
pub use vlog::{LogAddress, ValueLog, ValueLogOptions};

/// Install a stderr `tracing` subscriber honoring `RUST_LOG`. Safe to
/// call more than once; only the first call installs.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
