//! Per-user notification preference rows.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::MetadataStore;
use crate::error::Result;
use crate::util::now_ms;

/// Notification preferences for one principal. All flags default to true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationPrefs {
    pub browser_enabled: bool,
    pub visual_enabled: bool,
    pub notify_on_input: bool,
    pub notify_on_completed: bool,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            browser_enabled: true,
            visual_enabled: true,
            notify_on_input: true,
            notify_on_completed: true,
        }
    }
}

impl MetadataStore {
    /// Preferences for a user, falling back to the all-true defaults when
    /// the user has never saved any.
    pub async fn get_prefs(&self, user_id: &str) -> Result<NotificationPrefs> {
        let prefs = sqlx::query_as::<_, NotificationPrefs>(
            "SELECT browser_enabled, visual_enabled, notify_on_input, notify_on_completed
             FROM notification_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(prefs.unwrap_or_default())
    }

    pub async fn upsert_prefs(&self, user_id: &str, prefs: NotificationPrefs) -> Result<()> {
        #[allow(clippy::cast_possible_wrap)]
        sqlx::query(
            "INSERT INTO notification_preferences
                (user_id, browser_enabled, visual_enabled,
                 notify_on_input, notify_on_completed, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                browser_enabled = excluded.browser_enabled,
                visual_enabled = excluded.visual_enabled,
                notify_on_input = excluded.notify_on_input,
                notify_on_completed = excluded.notify_on_completed,
                updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(prefs.browser_enabled)
        .bind(prefs.visual_enabled)
        .bind(prefs.notify_on_input)
        .bind(prefs.notify_on_completed)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
