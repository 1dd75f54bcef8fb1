//! Read-only user directory the engine resolves recipients against.
//!
//! Role membership and attribute data stay behind this narrow interface;
//! the engine never embeds authorization logic of its own.
use crate::model::Recipient;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Ids of every active account, ascending.
    async fn active_users(&self) -> Result<Vec<i64>>;

    /// Active members of a role, or `None` when the role itself is unknown.
    async fn role_members(&self, role: &str) -> Result<Option<Vec<i64>>>;

    /// Active users whose attribute `key` equals `value` exactly.
    async fn users_with_meta(&self, key: &str, value: &str) -> Result<Vec<i64>>;

    /// Full recipient record, including the attribute map. `None` when the
    /// id does not exist.
    async fn recipient(&self, id: i64) -> Result<Option<Recipient>>;
}

/// Directory backed by the `users` / `roles` / `user_roles` / `user_meta`
/// tables of the engine database.
#[derive(Clone)]
pub struct SqliteDirectory {
    pool: SqlitePool,
}

impl SqliteDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for SqliteDirectory {
    async fn active_users(&self) -> Result<Vec<i64>> {
        let ids =
            sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE active = 1 ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    async fn role_members(&self, role: &str) -> Result<Option<Vec<i64>>> {
        let known = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM roles WHERE role_key = ?")
            .bind(role)
            .fetch_one(&self.pool)
            .await?;
        if known == 0 {
            return Ok(None);
        }
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT u.id FROM users u JOIN user_roles r ON r.user_id = u.id \
             WHERE r.role_key = ? AND u.active = 1 ORDER BY u.id ASC",
        )
        .bind(role)
        .fetch_all(&self.pool)
        .await?;
        Ok(Some(ids))
    }

    async fn users_with_meta(&self, key: &str, value: &str) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT u.id FROM users u JOIN user_meta m ON m.user_id = u.id \
             WHERE m.meta_key = ? AND m.meta_value = ? AND u.active = 1 ORDER BY u.id ASC",
        )
        .bind(key)
        .bind(value)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn recipient(&self, id: i64) -> Result<Option<Recipient>> {
        let row = sqlx::query("SELECT id, email, display_name FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let meta_rows =
            sqlx::query("SELECT meta_key, meta_value FROM user_meta WHERE user_id = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        let mut meta = HashMap::with_capacity(meta_rows.len());
        for m in meta_rows {
            meta.insert(
                m.get::<String, _>("meta_key"),
                m.get::<String, _>("meta_value"),
            );
        }

        Ok(Some(Recipient {
            id: row.get("id"),
            email: row.get("email"),
            display_name: row.get("display_name"),
            meta,
        }))
    }
}
