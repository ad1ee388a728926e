//! In-memory state store
//!
//! Backs tests and the degraded in-process fallback. TTL handling matches
//! the durable backend: expired entries are invisible to reads and scans and
//! are removed lazily.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::{StateStore, VersionedValue};
use crate::types::StoreError;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|t| Instant::now() >= t).unwrap_or(false)
    }
}

/// In-memory implementation of [`StateStore`].
#[derive(Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, Entry>,
    unavailable: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate backend unavailability (every operation fails).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked down".into()));
        }
        Ok(())
    }

    fn live_entry(&self, key: &str) -> Option<Entry> {
        // Clone out of the guard before any removal; holding a shard ref
        // across remove() would deadlock.
        let entry = self.entries.get(key).map(|e| e.clone())?;
        if entry.is_expired() {
            self.entries.remove(key);
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        Ok(self.live_entry(key).map(|e| e.value))
    }

    async fn get_versioned(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        self.check_available()?;
        Ok(self.live_entry(key).map(|e| VersionedValue {
            value: e.value,
            version: e.version,
        }))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_available()?;
        let version = self.live_entry(key).map(|e| e.version + 1).unwrap_or(1);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn put_versioned(
        &self,
        key: &str,
        value: &str,
        expected: Option<u64>,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        // The DashMap entry guard keeps check-and-write atomic per key.
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let live = if occupied.get().is_expired() {
                    None
                } else {
                    Some(occupied.get().version)
                };
                match (live, expected) {
                    (Some(found), Some(exp)) if found == exp => {
                        let next = exp + 1;
                        occupied.insert(Entry {
                            value: value.to_string(),
                            version: next,
                            expires_at: ttl.map(|d| Instant::now() + d),
                        });
                        Ok(next)
                    }
                    (Some(found), Some(exp)) => Err(StoreError::VersionConflict {
                        key: key.to_string(),
                        expected: exp,
                        found,
                    }),
                    (Some(found), None) => Err(StoreError::VersionConflict {
                        key: key.to_string(),
                        expected: 0,
                        found,
                    }),
                    (None, Some(exp)) => Err(StoreError::VersionConflict {
                        key: key.to_string(),
                        expected: exp,
                        found: 0,
                    }),
                    (None, None) => {
                        occupied.insert(Entry {
                            value: value.to_string(),
                            version: 1,
                            expires_at: ttl.map(|d| Instant::now() + d),
                        });
                        Ok(1)
                    }
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => match expected {
                Some(exp) => Err(StoreError::VersionConflict {
                    key: key.to_string(),
                    expected: exp,
                    found: 0,
                }),
                None => {
                    vacant.insert(Entry {
                        value: value.to_string(),
                        version: 1,
                        expires_at: ttl.map(|d| Instant::now() + d),
                    });
                    Ok(1)
                }
            },
        }
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    let version = occupied.get().version + 1;
                    occupied.insert(Entry {
                        value: value.to_string(),
                        version,
                        expires_at: ttl.map(|d| Instant::now() + d),
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value: value.to_string(),
                    version: 1,
                    expires_at: ttl.map(|d| Instant::now() + d),
                });
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        match self.entries.remove(key) {
            Some((_, entry)) => Ok(!entry.is_expired()),
            None => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.check_available()?;
        let mut results: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired())
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }
}
