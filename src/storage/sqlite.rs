/*!
SQLite storage adapter.

Durable implementation of the [`Storage`] trait over a `sqlx` SQLite pool.
One row per call in the `calls` table; blobs are encoded through the
session's [`Codec`]. The status column carries the lifecycle state and the
compare-and-swap transition is a conditional `UPDATE`, which SQLite
serializes, giving the single-writer guarantee without extra locking.

Schema:

- `calls.id`          ← call id (hex, primary key)
- `calls.node_ref`    ← encoded `graph/node` pair
- `calls.args_blob`   ← codec-encoded positional slots
- `calls.kwargs_blob` ← codec-encoded keyword slots
- `calls.gates_blob`  ← codec-encoded ordering-only dependency ids
- `calls.status`      ← encoded `CallStatus`
- `calls.result_blob` ← codec-encoded outcome (value | forward | error)
- `calls.created_at` / `calls.updated_at` ← RFC 3339 timestamps
*/

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::instrument;

use super::{outcome_status, CallRow, ResultLookup, Storage, StorageError, StoredOutcome};
use crate::call::StoredSlot;
use crate::codec::{Codec, JsonCodec};
use crate::config::RuntimeConfig;
use crate::types::{CallId, CallStatus, NodeRef};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS calls (
    id          TEXT PRIMARY KEY,
    node_ref    TEXT NOT NULL,
    args_blob   BLOB NOT NULL,
    kwargs_blob BLOB NOT NULL,
    gates_blob  BLOB NOT NULL,
    status      TEXT NOT NULL,
    result_blob BLOB,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_calls_status ON calls (status);
"#;

/// SQLite-backed [`Storage`].
pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
    codec: Arc<dyn Codec>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish()
    }
}

fn backend(context: &'static str, e: impl std::fmt::Display) -> StorageError {
    StorageError::Unavailable {
        reason: format!("{context}: {e}"),
    }
}

impl SqliteStorage {
    /// Connect (or create) a SQLite database at `database_url` and apply
    /// the schema. Example URL: `sqlite://mycelia.db`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        Self::connect_with_codec(database_url, Arc::new(JsonCodec)).await
    }

    /// Connect with an explicit value codec.
    pub async fn connect_with_codec(
        database_url: &str,
        codec: Arc<dyn Codec>,
    ) -> Result<Self, StorageError> {
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.trim();
            if !path.is_empty() && path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if !p.exists() {
                    let _ = std::fs::File::create_new(p);
                }
            }
        }
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| backend("connect", e))?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| backend("schema", e))?;
        Ok(Self {
            pool: Arc::new(pool),
            codec,
        })
    }

    /// Connect using the database name resolved by the runtime config
    /// (`MYCELIA_SQLITE_URL` / `MYCELIA_SQLITE_DB` environment fallbacks).
    pub async fn connect_default(config: &RuntimeConfig) -> Result<Self, StorageError> {
        let url = config.sqlite_url();
        Self::connect(&url).await
    }

    fn encode<T: Serialize>(&self, value: &T, context: &'static str) -> Result<Vec<u8>, StorageError> {
        let json = serde_json::to_value(value).map_err(|e| backend(context, e))?;
        self.codec.encode(&json).map_err(|e| backend(context, e))
    }

    fn decode<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        id: CallId,
        context: &'static str,
    ) -> Result<T, StorageError> {
        let json = self.codec.decode(bytes).map_err(|e| StorageError::Corrupt {
            id,
            reason: format!("{context}: {e}"),
        })?;
        serde_json::from_value(json).map_err(|e| StorageError::Corrupt {
            id,
            reason: format!("{context}: {e}"),
        })
    }

    fn row_from_sqlite(&self, row: &SqliteRow) -> Result<CallRow, StorageError> {
        let id_text: String = row.get("id");
        let id = CallId::parse(&id_text).ok_or_else(|| StorageError::Corrupt {
            id: CallId::from_bytes([0; 32]),
            reason: format!("bad call id `{id_text}`"),
        })?;
        let node_ref: String = row.get("node_ref");
        let args: Vec<StoredSlot> = self.decode(row.get("args_blob"), id, "args")?;
        let kwargs: Vec<(String, StoredSlot)> = self.decode(row.get("kwargs_blob"), id, "kwargs")?;
        let gates: Vec<CallId> = self.decode(row.get("gates_blob"), id, "gates")?;
        let status: String = row.get("status");
        let result = match row.get::<Option<Vec<u8>>, _>("result_blob") {
            Some(bytes) => Some(self.decode::<StoredOutcome>(&bytes, id, "result")?),
            None => None,
        };
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        Ok(CallRow {
            id,
            node_ref: NodeRef::decode(&node_ref),
            args,
            kwargs,
            gates,
            status: CallStatus::decode(&status),
            result,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl Storage for SqliteStorage {
    #[instrument(skip(self, row), err)]
    async fn put_call(&self, row: CallRow) -> Result<(), StorageError> {
        let args_blob = self.encode(&row.args, "args")?;
        let kwargs_blob = self.encode(&row.kwargs, "kwargs")?;
        let gates_blob = self.encode(&row.gates, "gates")?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO calls
                (id, node_ref, args_blob, kwargs_blob, gates_blob, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(row.id.to_hex())
        .bind(row.node_ref.encode())
        .bind(args_blob)
        .bind(kwargs_blob)
        .bind(gates_blob)
        .bind(row.status.encode())
        .bind(row.created_at.to_rfc3339())
        .bind(row.updated_at.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("insert call", e))?;
        Ok(())
    }

    async fn get_call(&self, id: CallId) -> Result<Option<CallRow>, StorageError> {
        let row = sqlx::query("SELECT * FROM calls WHERE id = ?1")
            .bind(id.to_hex())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| backend("select call", e))?;
        row.map(|r| self.row_from_sqlite(&r)).transpose()
    }

    #[instrument(skip(self, outcome), err)]
    async fn put_result(&self, id: CallId, outcome: StoredOutcome) -> Result<(), StorageError> {
        let status = outcome_status(&outcome);
        let blob = self.encode(&outcome, "result")?;
        sqlx::query(
            r#"
            UPDATE calls SET result_blob = ?1, status = ?2, updated_at = ?3 WHERE id = ?4
            "#,
        )
        .bind(blob)
        .bind(status.encode())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_hex())
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("update result", e))?;
        Ok(())
    }

    async fn get_result(&self, id: CallId) -> Result<ResultLookup, StorageError> {
        let row = sqlx::query("SELECT result_blob FROM calls WHERE id = ?1")
            .bind(id.to_hex())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| backend("select result", e))?;
        let Some(row) = row else {
            return Ok(ResultLookup::Missing);
        };
        let Some(bytes) = row.get::<Option<Vec<u8>>, _>("result_blob") else {
            return Ok(ResultLookup::Missing);
        };
        Ok(match self.decode::<StoredOutcome>(&bytes, id, "result")? {
            StoredOutcome::Value { value } => ResultLookup::Value(value),
            StoredOutcome::Forward { target } => ResultLookup::Forward(target),
            StoredOutcome::Error { error } => ResultLookup::Error(error),
        })
    }

    async fn set_status(&self, id: CallId, status: CallStatus) -> Result<(), StorageError> {
        sqlx::query("UPDATE calls SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.encode())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_hex())
            .execute(&*self.pool)
            .await
            .map_err(|e| backend("update status", e))?;
        Ok(())
    }

    async fn cas_status(
        &self,
        id: CallId,
        from: CallStatus,
        to: CallStatus,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE calls SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(to.encode())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_hex())
        .bind(from.encode())
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("cas status", e))?;
        Ok(result.rows_affected() == 1)
    }
}
