//! Context-owned registry of table handles.
//!
//! Deduplicates [`DeltaLog`] handles per canonical table path so concurrent
//! callers within one process share the cached snapshot. The registry is a
//! value owned by the embedding context — never a process-global — and the
//! owner decides when entries are evicted.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::storage::TableLocation;
use crate::table::{DeltaLog, TableError};

/// Registry of open table handles, keyed by canonical path.
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: Mutex<HashMap<String, Arc<DeltaLog>>>,
}

impl TableRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle for `location`, opening the table on first use.
    pub async fn get(&self, location: &TableLocation) -> Result<Arc<DeltaLog>, TableError> {
        let key = location.canonical_key();

        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.get(&key) {
            return Ok(existing.clone());
        }

        let log = DeltaLog::open(location.clone()).await?;
        tables.insert(key, log.clone());
        Ok(log)
    }

    /// Drop the cached handle for `location`, returning it if present.
    ///
    /// Existing clones of the handle stay valid; they simply no longer
    /// share refreshes with future `get` calls.
    pub async fn evict(&self, location: &TableLocation) -> Option<Arc<DeltaLog>> {
        self.tables.lock().await.remove(&location.canonical_key())
    }

    /// Drop every cached handle.
    pub async fn clear(&self) {
        self.tables.lock().await.clear();
    }

    /// Number of cached handles.
    pub async fn len(&self) -> usize {
        self.tables.lock().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.tables.lock().await.is_empty()
    }
}
