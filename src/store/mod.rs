//! Durable metadata storage using SQLite.
//!
//! One database file under the data directory holds sessions, categories,
//! stored scrollback, the per-session event log, notification preferences,
//! and the applied-migration ledger. All access goes through a
//! [`MetadataStore`] backed by a connection pool; sqlx caches prepared
//! statements per connection and drops the cache when the pool closes.
//!
//! Foreign keys are enforced on every connection: deleting a session
//! cascades into `scrollback` and `session_logs`, deleting a category sets
//! member sessions' `category_id` to NULL.

mod migrations;

pub mod categories;
pub mod prefs;
pub mod sessions;

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use crate::error::Result;

/// SQLite-backed store shared by the session manager and the services.
#[derive(Clone)]
pub struct MetadataStore {
    pub(crate) pool: Pool<Sqlite>,
}

impl MetadataStore {
    /// Open (creating if missing) the database at `path` and bring the
    /// schema up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database for tests. Single connection: each SQLite
    /// `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("static connect string")
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Close the pool, flushing WAL state and dropping statement caches.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sessions::SessionRecord;

    #[tokio::test]
    async fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        // Parent directories are created on open.
        let path = dir.path().join("data").join("ttyhub.db");

        let store = MetadataStore::open(&path).await.unwrap();
        store
            .insert_session(&SessionRecord {
                id: "s1".to_string(),
                name: "durable".to_string(),
                shell: "/bin/sh".to_string(),
                cwd: "/tmp".to_string(),
                created_at: 1_000,
                last_accessed_at: 1_000,
                owner_id: None,
                status: "idle".to_string(),
                cols: 80,
                rows: 24,
                external_mux_handle: None,
                category_id: None,
                sort_order: 0,
            })
            .await
            .unwrap();
        store.close().await;

        let store = MetadataStore::open(&path).await.unwrap();
        let got = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(got.name, "durable");
        assert_eq!(got.status, "idle");

        // The second open re-runs migrate; the ledger still records the
        // migration exactly once.
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM migrations")
            .fetch_all(&store.pool)
            .await
            .unwrap();
        assert_eq!(names, vec!["0001_initial_schema"]);
        store.close().await;
    }
}
