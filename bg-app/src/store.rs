//! SQLite persistence for handover flags and the conversation log.
//!
//! One connection behind a mutex; every statement runs on the blocking pool.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bg_engine::{ConversationLog, EngineError, HandoverStore, UserId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS handover_flags (
    user_id    TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_handover_flags_expires_at ON handover_flags (expires_at);

CREATE TABLE IF NOT EXISTS message_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    TEXT NOT NULL,
    content    TEXT NOT NULL,
    response   TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_message_log_user ON message_log (user_id, created_at);
"#;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    #[tracing::instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)
                .with_context(|| format!("open sqlite db {}", path.display()))?;
            conn.execute_batch(SCHEMA).context("apply schema")?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let out = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await??;
        Ok(out)
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

fn store_err(e: anyhow::Error) -> EngineError {
    EngineError::Store(format!("{e:#}"))
}

#[async_trait]
impl HandoverStore for SqliteStore {
    async fn get(&self, user_id: &UserId) -> bg_engine::Result<Option<DateTime<Utc>>> {
        let user = user_id.to_string();
        let ms = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT expires_at FROM handover_flags WHERE user_id = ?1",
                    params![user],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
            })
            .await
            .map_err(store_err)?;
        Ok(ms.and_then(from_millis))
    }

    async fn put(&self, user_id: &UserId, expires_at: DateTime<Utc>) -> bg_engine::Result<()> {
        let user = user_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO handover_flags (user_id, expires_at) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET expires_at = excluded.expires_at",
                params![user, to_millis(expires_at)],
            )
        })
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn remove(&self, user_id: &UserId) -> bg_engine::Result<bool> {
        let user = user_id.to_string();
        let removed = self
            .with_conn(move |conn| {
                conn.execute("DELETE FROM handover_flags WHERE user_id = ?1", params![user])
            })
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> bg_engine::Result<usize> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM handover_flags WHERE expires_at <= ?1",
                params![to_millis(now)],
            )
        })
        .await
        .map_err(store_err)
    }
}

#[async_trait]
impl ConversationLog for SqliteStore {
    async fn record_message(
        &self,
        user_id: &UserId,
        content: &str,
        response: Option<&str>,
    ) -> bg_engine::Result<()> {
        let user = user_id.to_string();
        let content = content.to_string();
        let response = response.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO message_log (user_id, content, response, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user, content, response, to_millis(Utc::now())],
            )
        })
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn temp_store() -> (SqliteStore, std::path::PathBuf) {
        let path = std::env::temp_dir()
            .join(format!("burstgate-test-{}", uuid::Uuid::new_v4()))
            .join("store.db");
        let store = SqliteStore::open(&path).await.expect("open store");
        (store, path)
    }

    fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn handover_flags_upsert_and_expire() {
        let (store, path) = temp_store().await;
        let user = UserId::new("u1");
        let now = Utc::now();

        assert_eq!(store.get(&user).await.expect("get"), None);
        store.put(&user, now + Duration::minutes(5)).await.expect("put");
        store.put(&user, now + Duration::minutes(10)).await.expect("upsert");
        let stored = store.get(&user).await.expect("get").expect("present");
        assert_eq!(stored.timestamp_millis(), (now + Duration::minutes(10)).timestamp_millis());

        store
            .put(&UserId::new("old"), now - Duration::seconds(1))
            .await
            .expect("put old");
        assert_eq!(store.remove_expired(now).await.expect("sweep"), 1);
        assert!(store.remove(&user).await.expect("remove"));
        assert!(!store.remove(&user).await.expect("remove again"));
        cleanup(&path);
    }

    #[tokio::test]
    async fn messages_are_logged() {
        let (store, path) = temp_store().await;
        let user = UserId::new("u1");
        store
            .record_message(&user, "hello", Some("hi there"))
            .await
            .expect("record");
        store.record_message(&user, "quiet", None).await.expect("record");

        let rows: Vec<(String, Option<String>)> = store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT content, response FROM message_log WHERE user_id = 'u1' ORDER BY id",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect()
            })
            .await
            .expect("query");
        assert_eq!(
            rows,
            vec![
                ("hello".to_string(), Some("hi there".to_string())),
                ("quiet".to_string(), None),
            ]
        );
        cleanup(&path);
    }

    #[tokio::test]
    async fn flags_survive_reopen() {
        let (store, path) = temp_store().await;
        let user = UserId::new("u1");
        let expires = Utc::now() + Duration::hours(1);
        store.put(&user, expires).await.expect("put");
        drop(store);

        let reopened = SqliteStore::open(&path).await.expect("reopen");
        assert!(reopened.get(&user).await.expect("get").is_some());
        cleanup(&path);
    }
}
