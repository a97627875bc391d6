//! Storage backends for cached results
//!
//! Payloads are opaque bytes. Rows are keyed by namespace and the SHA-256 of
//! the canonical key text; the text itself is kept for inspection.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::db::open_pool;
use crate::error::{Error, Result};

/// SQL to create the result cache table
pub const CREATE_RESULT_CACHE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS result_cache (
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    payload BLOB NOT NULL,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (namespace, key_hash)
);
"#;

/// Last-write-wins key/value store for cached results
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, namespace: &str, key: &str, payload: Vec<u8>) -> Result<()>;
}

/// Hex SHA-256 of a canonical key
pub fn key_hash(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

pub struct SqliteResultStore {
    pool: SqlitePool,
}

impl SqliteResultStore {
    /// Create a new store from an existing connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the database at `path` and make sure the schema exists
    pub async fn connect(path: &Path) -> Result<Self> {
        let store = Self::new(open_pool(path).await?);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_RESULT_CACHE_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        info!("Result cache table initialized");
        Ok(())
    }

    /// Number of cached entries in a namespace
    pub async fn count(&self, namespace: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM result_cache WHERE namespace = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            "SELECT payload FROM result_cache WHERE namespace = ? AND key_hash = ?",
        )
        .bind(namespace)
        .bind(key_hash(key))
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("payload")))
    }

    async fn put(&self, namespace: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        let size = payload.len();
        sqlx::query(
            r#"
            INSERT INTO result_cache (namespace, key_hash, cache_key, payload, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(namespace, key_hash) DO UPDATE SET
                cache_key = excluded.cache_key,
                payload = excluded.payload,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(namespace)
        .bind(key_hash(key))
        .bind(key)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        debug!(namespace = %namespace, bytes = size, "Stored cache entry");
        Ok(())
    }
}

/// Process-local store for tests and cache-only-in-memory runs
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    entries: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(namespace.to_string(), key_hash(key)))
            .cloned())
    }

    async fn put(&self, namespace: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        self.entries
            .write()
            .await
            .insert((namespace.to_string(), key_hash(key)), payload);
        Ok(())
    }
}
