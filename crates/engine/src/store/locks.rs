//! Distributed locking and idempotency over the state store
//!
//! Both lock kinds are SETNX-with-TTL keys. The coarse lock serializes
//! segments of one execution and is released when the segment ends; step
//! locks persist for their full TTL so queue redeliveries of an attempted
//! step are recognized as duplicates.
//!
//! When the store is unreachable the manager either fails fast or degrades
//! to in-process locking, per configured policy. In-process locks only
//! protect against races inside this worker; the downgrade is logged.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::StateStore;
use crate::config::StoreFallbackPolicy;
use crate::types::{LockError, StoreError};

/// A held lock. Release explicitly; the TTL reclaims leaked locks.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    token: String,
    in_process: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Acquires and releases SETNX locks, with optional in-process fallback.
pub struct LockManager {
    store: Arc<dyn StateStore>,
    fallback_policy: StoreFallbackPolicy,
    local: DashMap<String, (String, Instant)>,
}

impl LockManager {
    pub fn new(store: Arc<dyn StateStore>, fallback_policy: StoreFallbackPolicy) -> Self {
        Self {
            store,
            fallback_policy,
            local: DashMap::new(),
        }
    }

    /// Try to take the lock at `key` with the given TTL.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let token = Uuid::new_v4().to_string();
        match self.store.set_nx(key, &token, Some(ttl)).await {
            Ok(true) => Ok(LockGuard {
                key: key.to_string(),
                token,
                in_process: false,
            }),
            Ok(false) => Err(LockError::Held {
                key: key.to_string(),
            }),
            Err(StoreError::Unavailable(reason)) => match self.fallback_policy {
                StoreFallbackPolicy::FailFast => Err(LockError::BackendUnavailable { reason }),
                StoreFallbackPolicy::FallbackInProcess => {
                    tracing::warn!(
                        key = %key,
                        "state store unreachable, degrading to in-process lock"
                    );
                    self.acquire_local(key, &token, ttl)
                }
            },
            Err(e) => Err(LockError::BackendUnavailable {
                reason: e.to_string(),
            }),
        }
    }

    fn acquire_local(&self, key: &str, token: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let expires = Instant::now() + ttl;
        match self.local.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().1 <= Instant::now() {
                    occupied.insert((token.to_string(), expires));
                    Ok(LockGuard {
                        key: key.to_string(),
                        token: token.to_string(),
                        in_process: true,
                    })
                } else {
                    Err(LockError::Held {
                        key: key.to_string(),
                    })
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert((token.to_string(), expires));
                Ok(LockGuard {
                    key: key.to_string(),
                    token: token.to_string(),
                    in_process: true,
                })
            }
        }
    }

    /// Release a held lock. Only removes the key if the token still matches,
    /// so a lock that expired and was re-acquired elsewhere is left alone.
    pub async fn release(&self, guard: LockGuard) {
        if guard.in_process {
            self.local
                .remove_if(&guard.key, |_, (token, _)| token == &guard.token);
            return;
        }
        match self.store.get(&guard.key).await {
            Ok(Some(current)) if current == guard.token => {
                if let Err(e) = self.store.delete(&guard.key).await {
                    tracing::warn!(key = %guard.key, error = %e, "failed to release lock");
                }
            }
            Ok(_) => {
                // Expired or taken over; nothing to release.
            }
            Err(e) => {
                tracing::warn!(key = %guard.key, error = %e, "failed to read lock on release");
            }
        }
    }

    /// Whether a lock key currently exists (diagnostics, tests).
    pub async fn is_held(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    fn manager(policy: StoreFallbackPolicy) -> (Arc<MemoryStateStore>, LockManager) {
        let store = Arc::new(MemoryStateStore::new());
        let locks = LockManager::new(store.clone(), policy);
        (store, locks)
    }

    #[tokio::test]
    async fn test_second_acquire_fails() {
        let (_, locks) = manager(StoreFallbackPolicy::FailFast);
        let guard = locks.acquire("exec:x:lock", Duration::from_secs(30)).await.unwrap();
        assert!(matches!(
            locks.acquire("exec:x:lock", Duration::from_secs(30)).await,
            Err(LockError::Held { .. })
        ));
        locks.release(guard).await;
        assert!(locks.acquire("exec:x:lock", Duration::from_secs(30)).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_respects_token() {
        let (store, locks) = manager(StoreFallbackPolicy::FailFast);
        let guard = locks.acquire("k", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Lock expired and was re-acquired by another worker.
        let other = locks.acquire("k", Duration::from_secs(30)).await.unwrap();
        locks.release(guard).await;
        assert!(store.get("k").await.unwrap().is_some());
        locks.release(other).await;
    }

    #[tokio::test]
    async fn test_fail_fast_when_store_down() {
        let (store, locks) = manager(StoreFallbackPolicy::FailFast);
        store.set_unavailable(true);
        assert!(matches!(
            locks.acquire("k", Duration::from_secs(1)).await,
            Err(LockError::BackendUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_process_fallback() {
        let (store, locks) = manager(StoreFallbackPolicy::FallbackInProcess);
        store.set_unavailable(true);
        let guard = locks.acquire("k", Duration::from_secs(30)).await.unwrap();
        assert!(matches!(
            locks.acquire("k", Duration::from_secs(30)).await,
            Err(LockError::Held { .. })
        ));
        locks.release(guard).await;
        assert!(locks.acquire("k", Duration::from_secs(30)).await.is_ok());
    }
}
