//! Replica snapshot persistence.
//!
//! Implements the engine's [`DurableStore`] on the `replica_snapshots` table.

use futures::future::{BoxFuture, FutureExt};
use replica_engine::{DurableStore, Error};
use sqlx::types::Json;

use super::Pool;

/// PostgreSQL-backed snapshot store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn storage_error(e: sqlx::Error) -> Error {
    Error::Storage(e.to_string())
}

impl DurableStore for PgStore {
    fn get(&self, key: &str) -> BoxFuture<'_, replica_engine::Result<Option<serde_json::Value>>> {
        let key = key.to_string();
        async move {
            let row: Option<(Json<serde_json::Value>,)> =
                sqlx::query_as("SELECT value FROM replica_snapshots WHERE key = $1")
                    .bind(&key)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(storage_error)?;
            Ok(row.map(|(Json(value),)| value))
        }
        .boxed()
    }

    fn set(&self, key: &str, value: serde_json::Value) -> BoxFuture<'_, replica_engine::Result<()>> {
        let key = key.to_string();
        async move {
            sqlx::query(
                r#"
                INSERT INTO replica_snapshots (key, value, updated_at)
                VALUES ($1, $2, now())
                ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&key)
            .bind(Json(value))
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

            tracing::debug!(replica = %key, "Snapshot stored");
            Ok(())
        }
        .boxed()
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, replica_engine::Result<()>> {
        let key = key.to_string();
        async move {
            sqlx::query("DELETE FROM replica_snapshots WHERE key = $1")
                .bind(&key)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
            Ok(())
        }
        .boxed()
    }

    fn keys(&self, prefix: &str) -> BoxFuture<'_, replica_engine::Result<Vec<String>>> {
        let prefix = prefix.to_string();
        async move {
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT key FROM replica_snapshots WHERE left(key, length($1)) = $1 ORDER BY key",
            )
            .bind(&prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
            Ok(rows.into_iter().map(|(key,)| key).collect())
        }
        .boxed()
    }
}
