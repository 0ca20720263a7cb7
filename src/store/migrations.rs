//! Numbered schema migrations.
//!
//! Each migration is applied at most once; applied names are recorded in
//! the `migrations` table. A migration's statements run inside a single
//! transaction together with the ledger insert.

use sqlx::Row;

use super::MetadataStore;
use crate::error::Result;
use crate::util::now_ms;

/// Ordered migration list. Append only; never edit an applied migration.
const MIGRATIONS: &[(&str, &[&str])] = &[(
    "0001_initial_schema",
    &[
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            shell TEXT NOT NULL,
            cwd TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_accessed_at INTEGER NOT NULL,
            owner_id TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            cols INTEGER NOT NULL DEFAULT 80,
            rows INTEGER NOT NULL DEFAULT 24,
            external_mux_handle TEXT,
            category_id TEXT REFERENCES categories(id) ON DELETE SET NULL,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            collapsed INTEGER NOT NULL DEFAULT 0,
            owner_id TEXT,
            created_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS scrollback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL UNIQUE
                REFERENCES sessions(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS session_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL
                REFERENCES sessions(id) ON DELETE CASCADE,
            event_type TEXT NOT NULL,
            details TEXT,
            created_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS notification_preferences (
            user_id TEXT PRIMARY KEY,
            browser_enabled INTEGER NOT NULL DEFAULT 1,
            visual_enabled INTEGER NOT NULL DEFAULT 1,
            notify_on_input INTEGER NOT NULL DEFAULT 1,
            notify_on_completed INTEGER NOT NULL DEFAULT 1,
            updated_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_category ON sessions(category_id)",
        "CREATE INDEX IF NOT EXISTS idx_logs_session ON session_logs(session_id)",
    ],
)];

impl MetadataStore {
    /// Apply any migrations not yet recorded in the `migrations` table.
    pub(super) async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                applied_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        for (name, statements) in MIGRATIONS {
            let applied = sqlx::query("SELECT COUNT(*) AS n FROM migrations WHERE name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await?
                .get::<i64, _>("n")
                > 0;
            if applied {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            for stmt in *statements {
                sqlx::query(stmt).execute(&mut *tx).await?;
            }
            #[allow(clippy::cast_possible_wrap)]
            sqlx::query("INSERT INTO migrations (name, applied_at) VALUES (?, ?)")
                .bind(name)
                .bind(now_ms() as i64)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!("Applied migration {name}");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MetadataStore;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = MetadataStore::in_memory().await.unwrap();
        // in_memory already migrated once; a second pass is a no-op.
        store.migrate().await.unwrap();

        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM migrations ORDER BY id")
                .fetch_all(&store.pool)
                .await
                .unwrap();
        assert_eq!(names, vec!["0001_initial_schema"]);
    }
}
