//! Prepared statement metadata and caching.
//!
//! This module provides:
//! - `PreparedStatement`: what Parse + Describe told us about a server-side statement
//! - `StatementCache`: O(1) LRU cache of unnamed-by-caller statements per connection

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::protocol::{FieldDescription, Format};
use super::types::Oid;

/// Shared column descriptions, cloned into every result without copying.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// Prefix of every statement name this crate allocates.
pub const STATEMENT_PREFIX: &str = "__pk_";

// ============================================================================
// Prepared Statement
// ============================================================================

/// A prepared statement that has been parsed by PostgreSQL.
///
/// Prepared statements are created via the Parse message and can be
/// executed multiple times with different parameters via Bind + Execute.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-side name for this statement (e.g., "__pk_1")
    pub name: String,
    /// The SQL query text
    pub query: String,
    /// Parameter type OIDs (from ParameterDescription)
    pub param_types: Vec<Oid>,
    /// Result column descriptions (from RowDescription)
    pub columns: SharedColumns,
    /// Per-column result format requested in Bind
    pub result_formats: Vec<Format>,
}

impl PreparedStatement {
    /// Create a new prepared statement.
    pub fn new(name: String, query: String) -> Self {
        Self {
            name,
            query,
            param_types: Vec::new(),
            columns: Arc::new(Vec::new()),
            result_formats: Vec::new(),
        }
    }

    /// Set the parameter types after receiving ParameterDescription.
    pub fn set_param_types(&mut self, types: Vec<Oid>) {
        self.param_types = types;
    }

    /// Set the column descriptions after receiving RowDescription.
    ///
    /// Columns of types we can decode are requested in binary, the rest in text.
    pub fn set_columns(&mut self, mut columns: Vec<FieldDescription>) {
        self.result_formats = columns
            .iter()
            .map(|c| {
                if c.type_oid.has_binary_decoder() {
                    Format::Binary
                } else {
                    Format::Text
                }
            })
            .collect();
        // Describe reports text for a statement; record what Bind will ask for
        for (col, fmt) in columns.iter_mut().zip(&self.result_formats) {
            col.format = *fmt;
        }
        self.columns = Arc::new(columns);
    }

    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// O(1) LRU cache for prepared statements, keyed by query text.
///
/// Statements are stored as `Arc<PreparedStatement>` so a cache hit is a
/// reference count increment. The cache also hands out statement names,
/// which are unique for the lifetime of the connection.
pub struct StatementCache {
    cache: LruCache<String, Arc<PreparedStatement>>,
    next_id: u64,
}

impl StatementCache {
    /// Create a new statement cache with the given capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            next_id: 0,
        }
    }

    /// Get a cached statement and mark it recently used.
    pub fn get(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.get(query).map(Arc::clone)
    }

    /// Check if a query is cached without touching LRU order.
    #[inline]
    pub fn contains(&self, query: &str) -> bool {
        self.cache.contains(query)
    }

    /// Insert a prepared statement into the cache.
    ///
    /// Returns the name of the statement evicted or replaced to make room,
    /// which the caller must close on the server.
    pub fn insert(&mut self, statement: Arc<PreparedStatement>) -> Option<String> {
        let name = statement.name.clone();
        self.cache
            .push(statement.query.clone(), statement)
            .map(|(_, old)| old.name.clone())
            .filter(|old| *old != name)
    }

    /// Remove a statement from the cache.
    pub fn remove(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.pop(query)
    }

    /// Generate a unique statement name for this connection.
    pub fn next_statement_name(&mut self) -> String {
        self.next_id += 1;
        format!("{}{}", STATEMENT_PREFIX, self.next_id)
    }

    /// Get the number of cached statements.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Forget every cached statement without closing it on the server.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(100)
    }
}
