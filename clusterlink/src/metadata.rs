//! Table metadata needed to encode key and attribute signals.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};

/// Layout of one table, as far as signal encoding is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Server-side table id.
    pub id: u32,
    /// Table name.
    pub name: String,
    /// Schema version, sent with every key request.
    pub version: u32,
    /// Number of 32-bit words in the primary key.
    pub key_words: usize,
    /// Number of columns.
    pub attribute_count: usize,
    /// Number of partitions; bounds scan parallelism.
    pub fragment_count: u32,
}

impl TableMetadata {
    /// Check that `key` matches the primary key width.
    pub fn check_key(&self, key: &[u32]) -> ClusterResult<()> {
        if key.len() != self.key_words {
            return Err(ClusterError::Definition {
                message: format!(
                    "table {} expects a {}-word key, got {}",
                    self.name,
                    self.key_words,
                    key.len()
                ),
            });
        }
        Ok(())
    }
}

/// Name-to-layout resolution.
pub trait MetadataResolver: Send + Sync {
    /// Look up a table by name.
    fn resolve(&self, name: &str) -> ClusterResult<Arc<TableMetadata>>;
}

/// In-memory [`MetadataResolver`].
#[derive(Default)]
pub struct Catalog {
    tables: RwLock<HashMap<String, Arc<TableMetadata>>>,
}

impl Catalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a table.
    pub fn insert(&self, table: TableMetadata) -> Arc<TableMetadata> {
        let table = Arc::new(table);
        self.tables
            .write()
            .insert(table.name.clone(), Arc::clone(&table));
        table
    }

    /// Remove a table.
    pub fn remove(&self, name: &str) -> Option<Arc<TableMetadata>> {
        self.tables.write().remove(name)
    }
}

impl MetadataResolver for Catalog {
    fn resolve(&self, name: &str) -> ClusterResult<Arc<TableMetadata>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownTable {
                name: name.to_string(),
            })
    }
}
