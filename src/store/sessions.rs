//! Session rows, the per-session event log, and stored scrollback.

use serde::Serialize;
use sqlx::FromRow;

use super::MetadataStore;
use crate::error::Result;
use crate::util::now_ms;

/// Durable session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Idle,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Terminated => "terminated",
        }
    }
}

/// One row of the `sessions` table. Serializes in the wire's camelCase.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub shell: String,
    pub cwd: String,
    pub created_at: i64,
    pub last_accessed_at: i64,
    pub owner_id: Option<String>,
    pub status: String,
    pub cols: u16,
    pub rows: u16,
    pub external_mux_handle: Option<String>,
    pub category_id: Option<String>,
    pub sort_order: i64,
}

/// One row of the `session_logs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub session_id: String,
    pub event_type: String,
    pub details: Option<String>,
    pub created_at: i64,
}

impl MetadataStore {
    pub async fn insert_session(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions
                (id, name, shell, cwd, created_at, last_accessed_at, owner_id,
                 status, cols, rows, external_mux_handle, category_id, sort_order)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.shell)
        .bind(&record.cwd)
        .bind(record.created_at)
        .bind(record.last_accessed_at)
        .bind(&record.owner_id)
        .bind(&record.status)
        .bind(record.cols)
        .bind(record.rows)
        .bind(&record.external_mux_handle)
        .bind(&record.category_id)
        .bind(record.sort_order)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let record = sqlx::query_as::<_, SessionRecord>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// All sessions, uncategorized first, then by category and sort order.
    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let records = sqlx::query_as::<_, SessionRecord>(
            "SELECT * FROM sessions
             ORDER BY category_id IS NOT NULL, category_id, sort_order, created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_session(&self, id: &str, last_accessed_at: i64) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_accessed_at = ? WHERE id = ?")
            .bind(last_accessed_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_session_dims(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        sqlx::query("UPDATE sessions SET cols = ?, rows = ? WHERE id = ?")
            .bind(cols)
            .bind(rows)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn rename_session(&self, id: &str, name: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn move_session(
        &self,
        id: &str,
        category_id: Option<&str>,
        sort_order: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE sessions SET category_id = ?, sort_order = ? WHERE id = ?")
            .bind(category_id)
            .bind(sort_order)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a session row; scrollback and log rows cascade.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Quota input: sessions not yet terminated.
    pub async fn count_non_terminated(&self) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE status != 'terminated'")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Highest sort order within one category (NULL = uncategorized).
    /// Returns -1 when the scope is empty so `max + 1` starts at 0.
    pub async fn max_sort_order(&self, category_id: Option<&str>) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sort_order) FROM sessions
             WHERE (category_id = ?1) OR (?1 IS NULL AND category_id IS NULL)",
        )
        .bind(category_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(max.unwrap_or(-1))
    }

    /// Replace the stored scrollback blob for a session.
    pub async fn save_scrollback(&self, session_id: &str, content: &str) -> Result<()> {
        #[allow(clippy::cast_possible_wrap)]
        sqlx::query(
            "INSERT INTO scrollback (session_id, content, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE
                SET content = excluded.content, created_at = excluded.created_at",
        )
        .bind(session_id)
        .bind(content)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_scrollback(&self, session_id: &str) -> Result<Option<String>> {
        let content =
            sqlx::query_scalar("SELECT content FROM scrollback WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(content)
    }

    /// Append one event-log entry for a session.
    pub async fn append_log(
        &self,
        session_id: &str,
        event_type: &str,
        details: Option<&str>,
    ) -> Result<()> {
        #[allow(clippy::cast_possible_wrap)]
        sqlx::query(
            "INSERT INTO session_logs (session_id, event_type, details, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(event_type)
        .bind(details)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn logs_for_session(&self, session_id: &str) -> Result<Vec<LogRecord>> {
        let logs = sqlx::query_as::<_, LogRecord>(
            "SELECT * FROM session_logs WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, category: Option<&str>, sort: i64) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            name: "test".to_string(),
            shell: "/bin/bash".to_string(),
            cwd: "/tmp".to_string(),
            created_at: 1_000,
            last_accessed_at: 1_000,
            owner_id: None,
            status: "active".to_string(),
            cols: 80,
            rows: 24,
            external_mux_handle: None,
            category_id: category.map(ToString::to_string),
            sort_order: sort,
        }
    }

    #[tokio::test]
    async fn insert_get_roundtrip() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.insert_session(&record("s1", None, 0)).await.unwrap();

        let got = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(got.name, "test");
        assert_eq!(got.cols, 80);
        assert_eq!(got.status, "active");
        assert!(store.get_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_and_rename_updates() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.insert_session(&record("s1", None, 0)).await.unwrap();

        store
            .update_session_status("s1", SessionStatus::Terminated)
            .await
            .unwrap();
        store.rename_session("s1", "renamed").await.unwrap();

        let got = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(got.status, "terminated");
        assert_eq!(got.name, "renamed");
    }

    #[tokio::test]
    async fn rename_is_idempotent() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.insert_session(&record("s1", None, 0)).await.unwrap();
        store.rename_session("s1", "n").await.unwrap();
        store.rename_session("s1", "n").await.unwrap();
        let got = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(got.name, "n");
    }

    #[tokio::test]
    async fn quota_counts_only_non_terminated() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.insert_session(&record("a", None, 0)).await.unwrap();
        store.insert_session(&record("b", None, 1)).await.unwrap();
        assert_eq!(store.count_non_terminated().await.unwrap(), 2);

        store
            .update_session_status("a", SessionStatus::Terminated)
            .await
            .unwrap();
        assert_eq!(store.count_non_terminated().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn max_sort_order_is_scoped_by_category() {
        let store = MetadataStore::in_memory().await.unwrap();
        assert_eq!(store.max_sort_order(None).await.unwrap(), -1);

        store.insert_session(&record("a", None, 3)).await.unwrap();
        store.insert_session(&record("b", None, 7)).await.unwrap();
        assert_eq!(store.max_sort_order(None).await.unwrap(), 7);
        assert_eq!(store.max_sort_order(Some("c1")).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn delete_cascades_scrollback_and_logs() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.insert_session(&record("s1", None, 0)).await.unwrap();
        store.save_scrollback("s1", "line1\nline2").await.unwrap();
        store.append_log("s1", "create", None).await.unwrap();

        store.delete_session("s1").await.unwrap();
        assert!(store.get_session("s1").await.unwrap().is_none());
        assert!(store.get_scrollback("s1").await.unwrap().is_none());
        assert!(store.logs_for_session("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scrollback_save_replaces() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.insert_session(&record("s1", None, 0)).await.unwrap();
        store.save_scrollback("s1", "first").await.unwrap();
        store.save_scrollback("s1", "second").await.unwrap();
        assert_eq!(
            store.get_scrollback("s1").await.unwrap().as_deref(),
            Some("second")
        );
    }

    #[tokio::test]
    async fn event_log_appends_in_order() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.insert_session(&record("s1", None, 0)).await.unwrap();
        store.append_log("s1", "create", None).await.unwrap();
        store
            .append_log("s1", "rename", Some("{\"name\":\"x\"}"))
            .await
            .unwrap();

        let logs = store.logs_for_session("s1").await.unwrap();
        let kinds: Vec<&str> = logs.iter().map(|l| l.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["create", "rename"]);
    }
}
