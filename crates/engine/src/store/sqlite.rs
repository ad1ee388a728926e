//! Sqlite-backed durable state store
//!
//! Single `kv` table with per-key versions and millisecond expiry. WAL mode
//! for concurrent access. Expired rows are invisible to reads and swept
//! lazily on write paths.

use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::time::Duration;

use super::{StateStore, VersionedValue};
use crate::types::StoreError;

/// Sqlite implementation of [`StateStore`].
pub struct SqliteStateStore {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStateStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn =
            rusqlite::Connection::open(path).map_err(|e| StoreError::Sqlite(e.to_string()))?;

        // WAL mode for concurrent access.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                version    INTEGER NOT NULL DEFAULT 1,
                expires_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);",
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn expiry_ms(ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|d| Self::now_ms() + d.as_millis() as i64)
    }

    fn sweep(conn: &rusqlite::Connection) {
        let _ = conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            rusqlite::params![Self::now_ms()],
        );
    }

    fn read_live(
        conn: &rusqlite::Connection,
        key: &str,
    ) -> Result<Option<VersionedValue>, StoreError> {
        let mut stmt = conn
            .prepare(
                "SELECT value, version FROM kv
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let mut rows = stmt
            .query(rusqlite::params![key, Self::now_ms()])
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        match rows.next().map_err(|e| StoreError::Sqlite(e.to_string()))? {
            Some(row) => {
                let value: String = row.get(0).map_err(|e| StoreError::Sqlite(e.to_string()))?;
                let version: i64 = row.get(1).map_err(|e| StoreError::Sqlite(e.to_string()))?;
                Ok(Some(VersionedValue {
                    value,
                    version: version as u64,
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(Self::read_live(&conn, key)?.map(|v| v.value))
    }

    async fn get_versioned(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        let conn = self.conn.lock().await;
        Self::read_live(&conn, key)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        Self::sweep(&conn);
        conn.execute(
            "INSERT INTO kv (key, value, version, expires_at) VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 version = kv.version + 1,
                 expires_at = excluded.expires_at",
            rusqlite::params![key, value, Self::expiry_ms(ttl)],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn put_versioned(
        &self,
        key: &str,
        value: &str,
        expected: Option<u64>,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        Self::sweep(&conn);
        let found = Self::read_live(&conn, key)?.map(|v| v.version);
        match (found, expected) {
            (Some(found), Some(exp)) if found == exp => {
                let next = exp + 1;
                let changed = conn
                    .execute(
                        "UPDATE kv SET value = ?2, version = ?3, expires_at = ?4
                         WHERE key = ?1 AND version = ?5",
                        rusqlite::params![key, value, next as i64, Self::expiry_ms(ttl), exp as i64],
                    )
                    .map_err(|e| StoreError::Sqlite(e.to_string()))?;
                if changed == 0 {
                    return Err(StoreError::VersionConflict {
                        key: key.to_string(),
                        expected: exp,
                        found,
                    });
                }
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
                // Replace any expired leftover row.
                conn.execute(
                    "INSERT INTO kv (key, value, version, expires_at) VALUES (?1, ?2, 1, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                         value = excluded.value,
                         version = 1,
                         expires_at = excluded.expires_at",
                    rusqlite::params![key, value, Self::expiry_ms(ttl)],
                )
                .map_err(|e| StoreError::Sqlite(e.to_string()))?;
                Ok(1)
            }
        }
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        Self::sweep(&conn);
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO kv (key, value, version, expires_at)
                 VALUES (?1, ?2, 1, ?3)",
                rusqlite::params![key, value, Self::expiry_ms(ttl)],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(changed > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "DELETE FROM kv WHERE key = ?1
                 AND (expires_at IS NULL OR expires_at > ?2)",
                rusqlite::params![key, Self::now_ms()],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(changed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.conn.lock().await;
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = conn
            .prepare(
                "SELECT key, value FROM kv
                 WHERE key LIKE ?1 ESCAPE '\\'
                   AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY key",
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![pattern, Self::now_ms()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| StoreError::Sqlite(e.to_string()))?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_bumps_version() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store.put("k", "a", None).await.unwrap();
        store.put("k", "b", None).await.unwrap();
        let v = store.get_versioned("k").await.unwrap().unwrap();
        assert_eq!(v.value, "b");
        assert_eq!(v.version, 2);
    }

    #[tokio::test]
    async fn test_versioned_cas() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let v1 = store.put_versioned("k", "a", None, None).await.unwrap();
        let v2 = store.put_versioned("k", "b", Some(v1), None).await.unwrap();
        assert_eq!(v2, 2);
        assert!(matches!(
            store.put_versioned("k", "c", Some(v1), None).await,
            Err(StoreError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_nx_and_ttl() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        assert!(store
            .set_nx("lock", "w1", Some(Duration::from_millis(20)))
            .await
            .unwrap());
        assert!(!store.set_nx("lock", "w2", None).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.set_nx("lock", "w3", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_prefix_ordering() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store.put("exec:b:state", "2", None).await.unwrap();
        store.put("exec:a:state", "1", None).await.unwrap();
        store.put("other", "x", None).await.unwrap();
        let results = store.scan_prefix("exec:").await.unwrap();
        assert_eq!(
            results,
            vec![
                ("exec:a:state".to_string(), "1".to_string()),
                ("exec:b:state".to_string(), "2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = SqliteStateStore::open(&path).unwrap();
        store.put("k", "v", None).await.unwrap();
        drop(store);
        let reopened = SqliteStateStore::open(&path).unwrap();
        assert_eq!(reopened.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
