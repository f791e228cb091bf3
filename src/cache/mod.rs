//! Durable per-client result cache.
//!
//! The whole table lives in memory; SQLite only backs it up. Every mutation
//! rewrites the stored table inside one transaction, so a reader never sees
//! half of an update. When the database cannot be opened the cache keeps
//! working in memory only.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, Sqlite, SqlitePool, migrate::MigrateDatabase};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::models::{CacheEntry, ListingRecord};

pub fn default_ttl() -> Duration {
    Duration::hours(24)
}

pub struct ResultCache {
    pool: Option<SqlitePool>,
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ResultCache {
    /// Opens the cache stored at `db_url`, starting empty if it cannot be read.
    pub async fn open(db_url: &str, ttl: Duration) -> Self {
        let pool = match connect(db_url).await {
            Ok(pool) => pool,
            Err(e) => {
                error!("Result cache unavailable at {}: {} - continuing without persistence", db_url, e);
                return Self::in_memory(ttl);
            }
        };

        let entries = match load(&pool).await {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to load result cache: {} - starting empty", e);
                HashMap::new()
            }
        };

        info!("Result cache loaded with {} entries", entries.len());
        Self {
            pool: Some(pool),
            entries,
            ttl,
        }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            pool: None,
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn get(&mut self, key: &str) -> Option<Vec<ListingRecord>> {
        self.get_at(key, Utc::now()).await
    }

    /// Returns the entry for `key` unless it is older than the TTL at `now`;
    /// expired entries are purged.
    pub async fn get_at(&mut self, key: &str, now: DateTime<Utc>) -> Option<Vec<ListingRecord>> {
        let expired = self.is_expired(self.entries.get(key)?, now);

        if expired {
            debug!("Cache entry expired: {}", key);
            self.entries.remove(key);
            self.persist().await;
            return None;
        }

        self.entries.get(key).map(|entry| entry.data.clone())
    }

    pub async fn set(&mut self, key: &str, records: Vec<ListingRecord>) {
        self.set_at(key, records, Utc::now()).await;
    }

    pub async fn set_at(&mut self, key: &str, records: Vec<ListingRecord>, now: DateTime<Utc>) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                timestamp: now,
                data: records,
            },
        );
        self.persist().await;
    }

    pub async fn clear_expired(&mut self) {
        self.clear_expired_at(Utc::now()).await;
    }

    pub async fn clear_expired_at(&mut self, now: DateTime<Utc>) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| now - entry.timestamp <= ttl);

        if self.entries.len() != before {
            info!("Purged {} expired cache entries", before - self.entries.len());
            self.persist().await;
        }
    }

    pub async fn clear(&mut self) {
        self.entries.clear();
        self.persist().await;
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.timestamp > self.ttl
    }

    async fn persist(&self) {
        let Some(pool) = &self.pool else {
            return;
        };

        if let Err(e) = store(pool, &self.entries).await {
            error!("Failed to persist result cache: {}", e);
        }
    }
}

async fn connect(db_url: &str) -> Result<SqlitePool> {
    if let Some(path) = db_url.strip_prefix("sqlite:")
        && !path.contains(":memory:")
        && let Some(parent) = Path::new(path.trim_start_matches("//")).parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Create database file if it doesn't exist
    if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
        info!("Creating cache database");
        Sqlite::create_database(db_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(db_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

async fn load(pool: &SqlitePool) -> Result<HashMap<String, CacheEntry>> {
    let rows = sqlx::query("SELECT key, timestamp, data FROM cache_entries")
        .fetch_all(pool)
        .await?;

    let mut entries = HashMap::new();
    for row in rows {
        let key: String = row.get("key");
        let millis: i64 = row.get("timestamp");
        let data: String = row.get("data");

        let Some(timestamp) = DateTime::from_timestamp_millis(millis) else {
            warn!("Skipping cache entry {} with invalid timestamp", key);
            continue;
        };
        match serde_json::from_str::<Vec<ListingRecord>>(&data) {
            Ok(data) => {
                entries.insert(key, CacheEntry { timestamp, data });
            }
            Err(e) => warn!("Skipping unreadable cache entry {}: {}", key, e),
        }
    }

    Ok(entries)
}

async fn store(pool: &SqlitePool, entries: &HashMap<String, CacheEntry>) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM cache_entries").execute(&mut *tx).await?;

    for (key, entry) in entries {
        let data = serde_json::to_string(&entry.data)?;
        sqlx::query("INSERT INTO cache_entries (key, timestamp, data) VALUES (?, ?, ?)")
            .bind(key)
            .bind(entry.timestamp.timestamp_millis())
            .bind(data)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}
