use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqlitePool;

use crate::models::TierListState;

/// Durable storage for tier list state, keyed by channel id.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(&self, channel_id: &str) -> Result<Option<TierListState>>;

    /// Store `state`. Writes carrying an older `version` than the stored row
    /// are ignored.
    async fn set_state(&self, channel_id: &str, state: &TierListState) -> Result<()>;
}

#[derive(Clone)]
pub struct TierListRepository {
    pub(crate) pool: SqlitePool,
}

impl TierListRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Channel ids with stored state, most recently updated first.
    pub async fn list_channels(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT channel_id FROM tier_lists ORDER BY updated_at DESC, channel_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("channel_id")).collect())
    }
}

#[async_trait]
impl StateStore for TierListRepository {
    async fn get_state(&self, channel_id: &str) -> Result<Option<TierListState>> {
        let row = sqlx::query("SELECT state FROM tier_lists WHERE channel_id = ?")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let json: String = row.get("state");
        let state = serde_json::from_str(&json)
            .with_context(|| format!("corrupt tier list state for channel {channel_id}"))?;
        Ok(Some(state))
    }

    async fn set_state(&self, channel_id: &str, state: &TierListState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        sqlx::query(
            r#"
            INSERT INTO tier_lists (channel_id, state, version, updated_at)
            VALUES (?, ?, ?, unixepoch())
            ON CONFLICT(channel_id) DO UPDATE SET
                state = excluded.state,
                version = excluded.version,
                updated_at = excluded.updated_at
            WHERE excluded.version >= tier_lists.version
            "#,
        )
        .bind(channel_id)
        .bind(json)
        .bind(state.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
