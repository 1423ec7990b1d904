//! SQLite-backed cache store, durable across restarts.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::CacheStorage;
use crate::error::CacheError;
use crate::request::{CachedResponse, RequestKey, ResponseType};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Cache store persisted in a single SQLite file.
///
/// All statements run on the blocking pool; the connection is shared
/// behind a mutex.
#[derive(Clone)]
pub struct SqliteCacheStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheStorage {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        info!(path = %path.as_ref().display(), "Opening cache store");
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Store that lives only as long as the value.
    pub fn in_memory() -> Result<Self, CacheError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&mut Connection) -> Result<R, CacheError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CacheError::Storage("cache store connection poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| CacheError::Storage(format!("cache store task failed: {}", e)))?
    }
}

fn init_schema(conn: &Connection) -> Result<(), CacheError> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )
        .unwrap_or(false);

    let version: i32 = if table_exists {
        conn.query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0)
    } else {
        0
    };

    if version > SCHEMA_VERSION {
        return Err(CacheError::Storage(format!(
            "cache store schema {} is newer than supported {}",
            version, SCHEMA_VERSION
        )));
    }

    if version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version INTEGER NOT NULL,
                applied_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS buckets (
                name TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                bucket TEXT NOT NULL REFERENCES buckets(name) ON DELETE CASCADE,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                response_url TEXT NOT NULL,
                status INTEGER NOT NULL,
                headers TEXT NOT NULL,
                body BLOB NOT NULL,
                response_type TEXT NOT NULL,
                redirected INTEGER NOT NULL,
                vary TEXT NOT NULL,
                cached_at INTEGER NOT NULL,
                PRIMARY KEY (bucket, method, url)
            );
            "#,
        )?;
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
            params![SCHEMA_VERSION, Utc::now().timestamp()],
        )?;
        debug!(version = SCHEMA_VERSION, "Cache store schema created");
    }

    Ok(())
}

fn bucket_exists(conn: &Connection, name: &str) -> Result<bool, CacheError> {
    Ok(conn
        .query_row("SELECT 1 FROM buckets WHERE name = ?", params![name], |_| Ok(()))
        .optional()?
        .is_some())
}

fn insert_entry(
    conn: &Connection,
    bucket: &str,
    key: &RequestKey,
    response: &CachedResponse,
) -> Result<(), CacheError> {
    let headers = serde_json::to_string(&response.headers)
        .map_err(|e| CacheError::Storage(e.to_string()))?;
    let vary =
        serde_json::to_string(&response.vary).map_err(|e| CacheError::Storage(e.to_string()))?;

    conn.execute(
        "INSERT OR REPLACE INTO entries
            (bucket, method, url, response_url, status, headers, body, response_type, redirected, vary, cached_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            bucket,
            key.method(),
            key.url(),
            response.url,
            response.status,
            headers,
            &response.body[..],
            response.response_type.as_str(),
            response.redirected,
            vary,
            response.cached_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        response_url: row.get(0)?,
        status: row.get(1)?,
        headers: row.get(2)?,
        body: row.get(3)?,
        response_type: row.get(4)?,
        redirected: row.get(5)?,
        vary: row.get(6)?,
        cached_at: row.get(7)?,
    })
}

/// Columns as read, before decoding.
struct RawEntry {
    response_url: String,
    status: u16,
    headers: String,
    body: Vec<u8>,
    response_type: String,
    redirected: bool,
    vary: String,
    cached_at: i64,
}

impl RawEntry {
    fn decode(self) -> Result<CachedResponse, CacheError> {
        let corrupt = |what: &str| CacheError::Corrupt(format!("{} for {}", what, self.response_url));

        let headers = serde_json::from_str(&self.headers).map_err(|_| corrupt("headers"))?;
        let vary = serde_json::from_str(&self.vary).map_err(|_| corrupt("vary"))?;
        let response_type =
            ResponseType::parse(&self.response_type).ok_or_else(|| corrupt("response type"))?;
        let cached_at: DateTime<Utc> =
            DateTime::from_timestamp_millis(self.cached_at).ok_or_else(|| corrupt("timestamp"))?;

        Ok(CachedResponse {
            url: self.response_url,
            status: self.status,
            headers,
            body: Bytes::from(self.body),
            response_type,
            redirected: self.redirected,
            vary,
            cached_at,
        })
    }
}

#[async_trait]
impl CacheStorage for SqliteCacheStorage {
    async fn open(&self, name: &str) -> Result<bool, CacheError> {
        let name = name.to_string();
        self.run(move |conn| {
            let created = conn.execute(
                "INSERT OR IGNORE INTO buckets (name, created_at) VALUES (?, ?)",
                params![name, Utc::now().timestamp_millis()],
            )?;
            Ok(created > 0)
        })
        .await
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        let name = name.to_string();
        self.run(move |conn| bucket_exists(conn, &name)).await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM buckets ORDER BY rowid")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let name = name.to_string();
        self.run(move |conn| {
            let removed = conn.execute("DELETE FROM buckets WHERE name = ?", params![name])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>, CacheError> {
        let bucket = bucket.to_string();
        let key = key.clone();
        self.run(move |conn| {
            let raw = conn
                .query_row(
                    "SELECT response_url, status, headers, body, response_type, redirected, vary, cached_at
                     FROM entries WHERE bucket = ? AND method = ? AND url = ?",
                    params![bucket, key.method(), key.url()],
                    row_to_entry,
                )
                .optional()?;
            raw.map(RawEntry::decode).transpose()
        })
        .await
    }

    async fn put(&self, bucket: &str, key: RequestKey, response: CachedResponse) -> Result<(), CacheError> {
        let bucket = bucket.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            if !bucket_exists(&tx, &bucket)? {
                return Err(CacheError::BucketMissing(bucket));
            }
            insert_entry(&tx, &bucket, &key, &response)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn put_all(
        &self,
        bucket: &str,
        entries: Vec<(RequestKey, CachedResponse)>,
    ) -> Result<(), CacheError> {
        let bucket = bucket.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            if !bucket_exists(&tx, &bucket)? {
                return Err(CacheError::BucketMissing(bucket));
            }
            for (key, response) in &entries {
                insert_entry(&tx, &bucket, key, response)?;
            }
            tx.commit()?;
            debug!(bucket = %bucket, count = entries.len(), "Stored entries");
            Ok(())
        })
        .await
    }

    async fn entry_keys(&self, bucket: &str) -> Result<Vec<RequestKey>, CacheError> {
        let bucket = bucket.to_string();
        self.run(move |conn| {
            if !bucket_exists(conn, &bucket)? {
                return Err(CacheError::BucketMissing(bucket));
            }
            let mut stmt =
                conn.prepare("SELECT method, url FROM entries WHERE bucket = ? ORDER BY rowid")?;
            let keys = stmt
                .query_map(params![bucket], |row| {
                    Ok(RequestKey::from_parts(row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }
}
