//! SQL-keyed table cache
//!
//! Materialised tables are keyed by a SHA-256 over the template name, the SQL
//! text and the fingerprints of the upstream tables. Each key owns a slot
//! behind its own mutex, so concurrent requests for the same table wait for
//! one materialisation instead of running it twice.

use crate::executor::{QueryExecutor, Row, SqlBackend, TableRef};
use ahash::AHashMap;
use parking_lot::Mutex;
use reclink_core::Result;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Hex characters of the cache key used in physical table names
const TABLE_SUFFIX_LEN: usize = 12;

type Slot = Arc<Mutex<Option<TableRef>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct CachingExecutor<B: SqlBackend> {
    backend: B,
    slots: Mutex<AHashMap<String, Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<B: SqlBackend> CachingExecutor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            slots: Mutex::new(AHashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Hex SHA-256 identifying a materialisation request
    pub fn cache_key(template_name: &str, sql: &str, upstream: &[TableRef]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(template_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(sql.as_bytes());
        for table in upstream {
            hasher.update([0u8]);
            hasher.update(table.fingerprint.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.slots.lock().len(),
        }
    }

    /// Drop every cached table and forget the keys
    pub fn clear(&self) -> Result<()> {
        let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        let mut first_error = None;
        for slot in slots {
            if let Some(table) = slot.lock().take() {
                debug!("Dropping cached table {}", table.name);
                if let Err(e) = self.backend.drop_table(&table.name) {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<B: SqlBackend> QueryExecutor for CachingExecutor<B> {
    fn input_tables(&self) -> Vec<TableRef> {
        self.backend.input_tables()
    }

    fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        self.backend.table_columns(table)
    }

    fn execute(&self, sql: &str) -> Result<Vec<Row>> {
        debug!("Executing SQL:\n{}", sql);
        self.backend.query(sql)
    }

    fn materialize(
        &self,
        sql: &str,
        template_name: &str,
        upstream: &[TableRef],
    ) -> Result<TableRef> {
        let key = Self::cache_key(template_name, sql, upstream);
        let slot = {
            let mut slots = self.slots.lock();
            slots.entry(key.clone()).or_default().clone()
        };

        let mut entry = slot.lock();
        if let Some(table) = entry.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit for {} ({})", template_name, table.name);
            return Ok(table.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}_{}", template_name, &key[..TABLE_SUFFIX_LEN]);
        debug!("Materialising {} as {}:\n{}", template_name, name, sql);
        self.backend.drop_table(&name)?;
        self.backend.create_table_as(&name, sql)?;

        let table = TableRef::new(name, key);
        *entry = Some(table.clone());
        Ok(table)
    }
}
