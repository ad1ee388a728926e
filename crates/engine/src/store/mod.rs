//! Durable key-value state store (executions, locks, checkpoints, DLQ)
//!
//! The store is the sole source of truth. Two backends implement the same
//! trait: a sqlite-backed durable store and an in-memory store for tests and
//! degraded operation. Multi-field execution updates go through versioned
//! writes; `put_versioned` is the CAS primitive backing optimistic
//! concurrency control.

use async_trait::async_trait;
use std::time::Duration;

use crate::types::StoreError;

pub mod keys;
pub mod locks;
pub mod memory;
pub mod sqlite;

pub use locks::{LockGuard, LockManager};
pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

/// A value plus the store-side version that wrote it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: String,
    pub version: u64,
}

/// Abstract state store with TTLs, SETNX, and versioned CAS writes.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a value, honoring expiry.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Read a value together with its version.
    async fn get_versioned(&self, key: &str) -> Result<Option<VersionedValue>, StoreError>;

    /// Unconditional write.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Versioned write. `expected = Some(v)` succeeds only while the stored
    /// version is exactly `v`; `expected = None` requires the key to be
    /// absent. Returns the new version. Fails with
    /// [`StoreError::VersionConflict`] otherwise.
    async fn put_versioned(
        &self,
        key: &str,
        value: &str,
        expected: Option<u64>,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError>;

    /// Set-if-absent with TTL. Returns `true` when this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<bool, StoreError>;

    /// Delete a key. Returns `true` when the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// List `(key, value)` pairs under a prefix, expired entries excluded.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}
