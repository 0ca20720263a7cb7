//! Category and preference operations.
//!
//! Thin CRUD over the metadata store; the connection handler calls these and
//! broadcasts the results. Categories are owner-scoped display groups; their
//! deletion leaves member sessions uncategorized.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::categories::CategoryRecord;
use crate::store::prefs::NotificationPrefs;
use crate::store::MetadataStore;
use crate::util::now_ms;

const MAX_CATEGORY_NAME_LEN: usize = 100;

/// CRUD facade over categories and notification preferences.
#[derive(Clone)]
pub struct CategoryService {
    store: MetadataStore,
}

impl CategoryService {
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> Result<Vec<CategoryRecord>> {
        self.store.list_categories().await
    }

    /// Create a category at the end of the sort order.
    pub async fn create(&self, name: &str, owner: Option<&str>) -> Result<CategoryRecord> {
        let name = validate_category_name(name)?;
        let record = CategoryRecord {
            id: Uuid::new_v4().to_string(),
            name,
            sort_order: self.store.max_category_sort_order().await? + 1,
            collapsed: false,
            owner_id: owner.map(ToString::to_string),
            created_at: now_ms() as i64,
        };
        self.store.insert_category(&record).await?;
        Ok(record)
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<()> {
        let name = validate_category_name(name)?;
        if self.store.get_category(id).await?.is_none() {
            return Err(Error::CategoryNotFound);
        }
        self.store.rename_category(id, &name).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.store.get_category(id).await?.is_none() {
            return Err(Error::CategoryNotFound);
        }
        self.store.delete_category(id).await
    }

    /// Apply a full ordering in a single transaction.
    pub async fn reorder(&self, ordering: &[(String, i64)]) -> Result<()> {
        self.store.reorder_categories(ordering).await
    }

    /// Flip the collapsed/expanded UI hint.
    pub async fn toggle(&self, id: &str) -> Result<bool> {
        let record = self
            .store
            .get_category(id)
            .await?
            .ok_or(Error::CategoryNotFound)?;
        let collapsed = !record.collapsed;
        self.store.set_category_collapsed(id, collapsed).await?;
        Ok(collapsed)
    }

    pub async fn get_prefs(&self, user_id: &str) -> Result<NotificationPrefs> {
        self.store.get_prefs(user_id).await
    }

    pub async fn set_prefs(&self, user_id: &str, prefs: NotificationPrefs) -> Result<()> {
        self.store.upsert_prefs(user_id, prefs).await
    }
}

fn validate_category_name(raw: &str) -> Result<String> {
    let name = raw.trim().to_string();
    if name.is_empty() || name.chars().count() > MAX_CATEGORY_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "Category name must be 1-{MAX_CATEGORY_NAME_LEN} characters"
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> CategoryService {
        CategoryService::new(MetadataStore::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn create_appends_sort_order() {
        let svc = service().await;
        let a = svc.create("alpha", None).await.unwrap();
        let b = svc.create("beta", Some("alice")).await.unwrap();
        assert_eq!(a.sort_order, 0);
        assert_eq!(b.sort_order, 1);
        assert_eq!(b.owner_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn toggle_flips_collapsed() {
        let svc = service().await;
        let cat = svc.create("alpha", None).await.unwrap();
        assert!(svc.toggle(&cat.id).await.unwrap());
        assert!(!svc.toggle(&cat.id).await.unwrap());
        assert!(matches!(
            svc.toggle("missing").await.unwrap_err(),
            Error::CategoryNotFound
        ));
    }

    #[tokio::test]
    async fn rename_and_delete_require_existing() {
        let svc = service().await;
        let cat = svc.create("alpha", None).await.unwrap();
        svc.rename(&cat.id, "renamed").await.unwrap();
        assert!(matches!(
            svc.rename("missing", "x").await.unwrap_err(),
            Error::CategoryNotFound
        ));

        svc.delete(&cat.id).await.unwrap();
        assert!(matches!(
            svc.delete(&cat.id).await.unwrap_err(),
            Error::CategoryNotFound
        ));
    }

    #[tokio::test]
    async fn name_bounds() {
        let svc = service().await;
        assert!(svc.create("  ", None).await.is_err());
        assert!(svc.create(&"x".repeat(101), None).await.is_err());
    }
}
