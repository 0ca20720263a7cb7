//! Category rows: named, ordered, collapsible session groups.

use serde::Serialize;
use sqlx::FromRow;

use super::MetadataStore;
use crate::error::Result;

/// One row of the `categories` table. Serializes in the wire's camelCase.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRecord {
    pub id: String,
    pub name: String,
    pub sort_order: i64,
    pub collapsed: bool,
    pub owner_id: Option<String>,
    pub created_at: i64,
}

impl MetadataStore {
    pub async fn insert_category(&self, record: &CategoryRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO categories (id, name, sort_order, collapsed, owner_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.sort_order)
        .bind(record.collapsed)
        .bind(&record.owner_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_category(&self, id: &str) -> Result<Option<CategoryRecord>> {
        let record =
            sqlx::query_as::<_, CategoryRecord>("SELECT * FROM categories WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    pub async fn list_categories(&self) -> Result<Vec<CategoryRecord>> {
        let records = sqlx::query_as::<_, CategoryRecord>(
            "SELECT * FROM categories ORDER BY sort_order, created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn rename_category(&self, id: &str, name: &str) -> Result<()> {
        sqlx::query("UPDATE categories SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_category_collapsed(&self, id: &str, collapsed: bool) -> Result<()> {
        sqlx::query("UPDATE categories SET collapsed = ? WHERE id = ?")
            .bind(collapsed)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a category. Member sessions become uncategorized via the
    /// `ON DELETE SET NULL` foreign key.
    pub async fn delete_category(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM categories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply a full id→order assignment in one transaction.
    pub async fn reorder_categories(&self, ordering: &[(String, i64)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (id, sort_order) in ordering {
            sqlx::query("UPDATE categories SET sort_order = ? WHERE id = ?")
                .bind(sort_order)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Highest category sort order, -1 when there are none.
    pub async fn max_category_sort_order(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(sort_order) FROM categories")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sessions::SessionRecord;

    fn category(id: &str, sort: i64) -> CategoryRecord {
        CategoryRecord {
            id: id.to_string(),
            name: format!("cat-{id}"),
            sort_order: sort,
            collapsed: false,
            owner_id: None,
            created_at: 1_000,
        }
    }

    #[tokio::test]
    async fn crud_roundtrip() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.insert_category(&category("c1", 0)).await.unwrap();

        let got = store.get_category("c1").await.unwrap().unwrap();
        assert_eq!(got.name, "cat-c1");
        assert!(!got.collapsed);

        store.rename_category("c1", "projects").await.unwrap();
        store.set_category_collapsed("c1", true).await.unwrap();
        let got = store.get_category("c1").await.unwrap().unwrap();
        assert_eq!(got.name, "projects");
        assert!(got.collapsed);
    }

    #[tokio::test]
    async fn reorder_applies_all_rows() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.insert_category(&category("a", 0)).await.unwrap();
        store.insert_category(&category("b", 1)).await.unwrap();

        store
            .reorder_categories(&[("a".to_string(), 1), ("b".to_string(), 0)])
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list_categories()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn delete_leaves_sessions_uncategorized() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.insert_category(&category("c1", 0)).await.unwrap();
        store
            .insert_session(&SessionRecord {
                id: "s1".to_string(),
                name: "t".to_string(),
                shell: "/bin/sh".to_string(),
                cwd: "/".to_string(),
                created_at: 0,
                last_accessed_at: 0,
                owner_id: None,
                status: "active".to_string(),
                cols: 80,
                rows: 24,
                external_mux_handle: None,
                category_id: Some("c1".to_string()),
                sort_order: 0,
            })
            .await
            .unwrap();

        store.delete_category("c1").await.unwrap();
        let session = store.get_session("s1").await.unwrap().unwrap();
        assert!(session.category_id.is_none());
    }
}
