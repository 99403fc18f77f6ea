// Top-level KV facade wiring the primary index, the value log, and the
// row cache together. Reads promote on miss; overwrites drop the stale
// cached row before retargeting the value pointer at the fresh log
// record. Cache trouble never fails a read, because the log stays
// authoritative.

use std::ops::Bound;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cache::{RowBuffer, RowBufferOptions, StatsSnapshot};
use crate::clock::Timestamp;
use crate::error::{Error, Result};
use crate::index::{IndexCursor, Indexer, IndexerList, PrimaryKey, ValuePtr};
use crate::schema::{SchemaField, SchemaId, SchemaRegistry};
use crate::vlog::{ValueLog, ValueLogOptions};

#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub log: ValueLogOptions,
    /// `None` disables the row cache entirely; every read goes to the
    /// log.
    pub cache: Option<RowBufferOptions>,
}

impl StoreOptions {
    pub fn cached() -> Self {
        Self {
            log: ValueLogOptions::default(),
            cache: Some(RowBufferOptions::default()),
        }
    }
}

pub struct Store {
    registry: Arc<SchemaRegistry>,
    indexers: Arc<IndexerList>,
    log: Arc<ValueLog>,
    cache: Option<Arc<RowBuffer>>,
}

impl Store {
    pub fn open(opts: StoreOptions) -> Result<Self> {
        let registry = Arc::new(SchemaRegistry::new());
        let indexers = Arc::new(IndexerList::new());
        let log = Arc::new(ValueLog::open(opts.log)?);
        let cache = opts
            .cache
            .map(|cache_opts| RowBuffer::new(cache_opts, indexers.clone(), registry.clone()))
            .transpose()?;
        Ok(Self {
            registry,
            indexers,
            log,
            cache,
        })
    }

    pub fn create_schema(
        &self,
        name: impl Into<String>,
        primary_key_field: usize,
        fields: Vec<SchemaField>,
    ) -> SchemaId {
        let schema = self.registry.create(name, primary_key_field, fields);
        self.indexers.create(schema.id);
        schema.id
    }

    fn indexer(&self, schema_id: SchemaId) -> Result<Arc<Indexer>> {
        self.indexers
            .get(schema_id)
            .ok_or(Error::SchemaUnknown(schema_id))
    }

    /// Append the value to the log and point the index at it. An
    /// existing key is overwritten: its cached row (if any) is dropped
    /// and the value pointer retargeted cold.
    pub fn put(&self, schema_id: SchemaId, key: PrimaryKey, value: &[u8]) -> Result<()> {
        let schema = self
            .registry
            .find(schema_id)
            .ok_or(Error::SchemaUnknown(schema_id))?;
        if value.len() != schema.value_size() {
            return Err(Error::SizeMismatch {
                got: value.len(),
                want: schema.value_size(),
            });
        }

        let addr = self.log.append(value)?;
        let ts = Timestamp::now();
        let indexer = self.indexer(schema_id)?;
        let (vptr, inserted) = indexer.insert(key, ValuePtr::cold(addr, ts));
        if !inserted {
            if vptr.is_hot() {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.drop_row(vptr.row_addr()) {
                        debug!("overwrite of key {key} found no cached row: {e}");
                    }
                }
            }
            vptr.retarget_cold(addr, ts);
        }
        Ok(())
    }

    pub fn get(&self, schema_id: SchemaId, key: PrimaryKey) -> Result<Vec<u8>> {
        let indexer = self.indexer(schema_id)?;
        let cursor = indexer.cursor(key).ok_or(Error::NotFound)?;
        self.get_via_cursor(schema_id, &cursor)
    }

    /// Hot entries read from the cache and refresh their timestamp; a
    /// stale fast path falls back to the log. Cold entries read from the
    /// log and promote (sync or async per the cache configuration);
    /// promotion failure is not an error.
    fn get_via_cursor(&self, schema_id: SchemaId, cursor: &IndexCursor) -> Result<Vec<u8>> {
        let vptr = cursor.value_ptr();
        let (ts, hot) = vptr.load();

        if hot {
            if let Some(cache) = &self.cache {
                cache.schema_hit(schema_id);
                let mut out = Vec::new();
                match cache.read(ts, Timestamp::now(), vptr.row_addr(), schema_id, &mut out, vptr)
                {
                    Ok(()) => return Ok(out),
                    Err(Error::Stale { .. }) => {
                        trace!("stale cached row for key {}, rereading log", cursor.key());
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let value = self.log.read(vptr.log_addr())?;
        if !hot {
            if let Some(cache) = &self.cache {
                cache.schema_miss(schema_id);
                if let Err(e) = cache.write(ts, Timestamp::now(), schema_id, &value, cursor) {
                    debug!("promotion of key {} skipped: {e}", cursor.key());
                }
            }
        }
        Ok(value)
    }

    /// In-place field updates against the log record. The cached copy no
    /// longer matches afterwards, so a hot row is demoted and dropped.
    pub fn update(
        &self,
        schema_id: SchemaId,
        key: PrimaryKey,
        updates: &[(usize, &[u8])],
    ) -> Result<()> {
        let schema = self
            .registry
            .find(schema_id)
            .ok_or(Error::SchemaUnknown(schema_id))?;
        let indexer = self.indexer(schema_id)?;
        let vptr = indexer.get(key).ok_or(Error::NotFound)?;

        for (field, bytes) in updates {
            let offset = schema.field_offset(*field).ok_or(Error::NotFound)?;
            let size = schema.field_size(*field).expect("offset implies size");
            if bytes.len() != size {
                return Err(Error::SizeMismatch {
                    got: bytes.len(),
                    want: size,
                });
            }
            self.log.write_at(vptr.log_addr(), offset, bytes)?;
        }

        if vptr.is_hot() {
            let row = vptr.row_addr();
            vptr.demote();
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.drop_row(row) {
                    debug!("updated key {key} had no cached row: {e}");
                }
            }
        }
        Ok(())
    }

    pub fn remove(&self, schema_id: SchemaId, key: PrimaryKey) -> Result<()> {
        let indexer = self.indexer(schema_id)?;
        let vptr = indexer.remove(key).ok_or(Error::NotFound)?;
        if vptr.is_hot() {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.drop_row(vptr.row_addr()) {
                    debug!("removed key {key} had no cached row: {e}");
                }
            }
        }
        Ok(())
    }

    /// Up to `limit` entries with keys strictly greater than `after`,
    /// each read through the same hot/cold path as `get`.
    pub fn scan(
        &self,
        schema_id: SchemaId,
        after: PrimaryKey,
        limit: usize,
    ) -> Result<Vec<(PrimaryKey, Vec<u8>)>> {
        let indexer = self.indexer(schema_id)?;
        let cursors = indexer.cursors_after(Bound::Excluded(after), limit);
        let mut out = Vec::with_capacity(cursors.len());
        for cursor in cursors {
            let value = self.get_via_cursor(schema_id, &cursor)?;
            out.push((cursor.key(), value));
        }
        Ok(out)
    }

    pub fn hit_ratio(&self, schema_id: SchemaId) -> Option<f64> {
        self.cache.as_ref()?.hit_ratio(schema_id)
    }

    pub fn stats_snapshot(&self) -> Vec<StatsSnapshot> {
        self.cache
            .as_ref()
            .map(|c| c.stats_snapshot())
            .unwrap_or_default()
    }

    /// Run one synchronous GC cycle; true when occupancy is at or below
    /// target afterwards. Trivially true without a cache.
    pub fn run_gc(&self) -> bool {
        self.cache.as_ref().map_or(true, |c| c.run_gc())
    }

    pub fn flush(&self) -> Result<()> {
        self.log.flush()
    }

    pub fn cache(&self) -> Option<&Arc<RowBuffer>> {
        self.cache.as_ref()
    }

    pub fn log(&self) -> &Arc<ValueLog> {
        &self.log
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn indexers(&self) -> &Arc<IndexerList> {
        &self.indexers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;

    fn pair_store() -> (Store, SchemaId) {
        let store = Store::open(StoreOptions {
            log: ValueLogOptions {
                chunk_size: 4096,
                capacity: 1 << 20,
                dir: None,
            },
            cache: Some(RowBufferOptions {
                max_pages: 16,
                ..Default::default()
            }),
        })
        .unwrap();
        let schema_id = store.create_schema(
            "pair",
            0,
            vec![
                SchemaField::with_size(FieldType::String, "field1", 6),
                SchemaField::with_size(FieldType::String, "field2", 6),
            ],
        );
        (store, schema_id)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (store, sid) = pair_store();
        store.put(sid, 1, b"abc123xyz789").unwrap();
        assert_eq!(store.get(sid, 1).unwrap(), b"abc123xyz789");
        assert!(matches!(store.get(sid, 2), Err(Error::NotFound)));
    }

    #[test]
    fn test_put_validates_size() {
        let (store, sid) = pair_store();
        assert!(matches!(
            store.put(sid, 1, b"short"),
            Err(Error::SizeMismatch { got: 5, want: 12 })
        ));
    }

    #[test]
    fn test_unknown_schema() {
        let (store, _) = pair_store();
        assert!(matches!(
            store.put(77, 1, b"abc123xyz789"),
            Err(Error::SchemaUnknown(77))
        ));
    }
}
