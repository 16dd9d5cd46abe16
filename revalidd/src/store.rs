use std::{fs, path::Path, path::PathBuf, sync::Arc};

use revalid_core::HttpMethod;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::OnceCell;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Replay attempts before a queued operation is abandoned.
pub const MAX_RETRIES: i64 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid operation method: {0}")]
    InvalidMethod(String),
    #[error("invalid operation status: {0}")]
    InvalidStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl OperationStatus {
    fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Syncing => "syncing",
            OperationStatus::Synced => "synced",
            OperationStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(OperationStatus::Pending),
            "syncing" => Ok(OperationStatus::Syncing),
            "synced" => Ok(OperationStatus::Synced),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    pub id: i64,
    pub method: HttpMethod,
    pub endpoint: String,
    pub data: Option<Value>,
    pub headers: Option<Value>,
    pub timestamp: i64,
    pub retry_count: i64,
    pub status: OperationStatus,
}

impl QueuedOperation {
    /// Bearer token captured from the `Authorization` header snapshot.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .as_ref()?
            .get("Authorization")?
            .as_str()?
            .strip_prefix("Bearer ")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NewOperation<'a> {
    pub method: HttpMethod,
    pub endpoint: &'a str,
    pub data: Option<&'a Value>,
    pub headers: Option<&'a Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub timestamp: i64,
}

/// Persistent write queue and read cache.
///
/// Schema setup runs lazily on first use through a shared cell, so any number
/// of concurrent first callers wait on the same migration run.
#[derive(Clone)]
pub struct OfflineStore {
    pool: SqlitePool,
    ready: Arc<OnceCell<()>>,
}

impl OfflineStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            ready: Arc::new(OnceCell::new()),
        }
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self::from_pool(pool))
    }

    pub async fn open_default() -> Result<Self, StoreError> {
        Self::open(&default_db_path()?).await
    }

    /// A private in-memory database. One long-lived connection keeps the data alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.ready
            .get_or_try_init(|| async {
                MIGRATOR.run(&self.pool).await?;
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn enqueue_operation(&self, op: &NewOperation<'_>) -> Result<i64, StoreError> {
        self.init().await?;
        let data = op.data.map(serde_json::to_string).transpose()?;
        let headers = op.headers.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            "INSERT INTO offline_operations (method, endpoint, data, headers, timestamp, retry_count, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 'pending')",
        )
        .bind(op.method.as_str())
        .bind(op.endpoint)
        .bind(data)
        .bind(headers)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Pending and failed operations, oldest first.
    pub async fn list_replayable(&self) -> Result<Vec<QueuedOperation>, StoreError> {
        self.init().await?;
        let rows = sqlx::query(
            "SELECT id, method, endpoint, data, headers, timestamp, retry_count, status
             FROM offline_operations
             WHERE status IN ('pending', 'failed')
             ORDER BY timestamp ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(operation_from_row).collect()
    }

    pub async fn get_operation(&self, id: i64) -> Result<Option<QueuedOperation>, StoreError> {
        self.init().await?;
        let row = sqlx::query(
            "SELECT id, method, endpoint, data, headers, timestamp, retry_count, status
             FROM offline_operations WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(operation_from_row).transpose()
    }

    /// Returns operations left `syncing` by an interrupted pass to `pending`.
    pub async fn reset_interrupted(&self) -> Result<u64, StoreError> {
        self.init().await?;
        let result = sqlx::query(
            "UPDATE offline_operations SET status = 'pending' WHERE status = 'syncing'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn set_status(&self, id: i64, status: OperationStatus) -> Result<(), StoreError> {
        self.init().await?;
        sqlx::query("UPDATE offline_operations SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bumps the retry counter, marks the operation failed and returns the new count.
    pub async fn record_failure(&self, id: i64) -> Result<i64, StoreError> {
        self.init().await?;
        let row = sqlx::query(
            "UPDATE offline_operations
             SET retry_count = retry_count + 1, status = 'failed'
             WHERE id = ?1
             RETURNING retry_count",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("retry_count")?),
            None => Ok(MAX_RETRIES),
        }
    }

    pub async fn delete_operation(&self, id: i64) -> Result<(), StoreError> {
        self.init().await?;
        sqlx::query("DELETE FROM offline_operations WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<i64, StoreError> {
        self.init().await?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM offline_operations WHERE status != 'synced'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }

    pub async fn cache_put(&self, endpoint: &str, value: &Value) -> Result<(), StoreError> {
        self.init().await?;
        sqlx::query(
            "INSERT INTO offline_data (key, value, timestamp) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                timestamp = excluded.timestamp",
        )
        .bind(cache_key(endpoint))
        .bind(serde_json::to_string(value)?)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cache_get(&self, endpoint: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.init().await?;
        let row = sqlx::query("SELECT key, value, timestamp FROM offline_data WHERE key = ?1")
            .bind(cache_key(endpoint))
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: String = row.try_get("value")?;
        Ok(Some(CacheEntry {
            key: row.try_get("key")?,
            value: serde_json::from_str(&value)?,
            timestamp: row.try_get("timestamp")?,
        }))
    }

    pub async fn cache_remove(&self, endpoint: &str) -> Result<(), StoreError> {
        self.init().await?;
        sqlx::query("DELETE FROM offline_data WHERE key = ?1")
            .bind(cache_key(endpoint))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drops every cached response and queued operation.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.init().await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM offline_operations")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM offline_data")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Cache key for an endpoint: leading slash enforced, trailing slash trimmed,
/// query string kept.
pub fn cache_key(endpoint: &str) -> String {
    let (path, query) = match endpoint.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (endpoint, None),
    };
    let trimmed = path.trim().trim_end_matches('/');
    let mut key = String::with_capacity(endpoint.len() + 1);
    if !trimmed.starts_with('/') {
        key.push('/');
    }
    key.push_str(trimmed);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        key.push('?');
        key.push_str(query);
    }
    key
}

fn operation_from_row(row: &SqliteRow) -> Result<QueuedOperation, StoreError> {
    let method: String = row.try_get("method")?;
    let status: String = row.try_get("status")?;
    let data: Option<String> = row.try_get("data")?;
    let headers: Option<String> = row.try_get("headers")?;
    Ok(QueuedOperation {
        id: row.try_get("id")?,
        method: HttpMethod::parse(&method).ok_or(StoreError::InvalidMethod(method))?,
        endpoint: row.try_get("endpoint")?,
        data: data.as_deref().map(serde_json::from_str).transpose()?,
        headers: headers.as_deref().map(serde_json::from_str).transpose()?,
        timestamp: row.try_get("timestamp")?,
        retry_count: row.try_get("retry_count")?,
        status: OperationStatus::parse(&status)?,
    })
}

pub(crate) fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("revalid");
    path.push("offline.db");
    Ok(path)
}
