// Cache-or-fetch execution of key-addressable queries
// Keys are `<query_name>:<primary>`; secondary key parts select a hash field under it

use crate::cache::store::CacheStore;
use crate::config::CacheSettings;
use crate::db::SessionFactory;
use crate::errors::{QueryCacheError, StorageError};
use crate::telemetry;
use crate::value::{Row, Value};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Number of positional parameters in a batched lookup statement
pub const BATCH_WIDTH: usize = 10;

/// Column through which a batched lookup row names the key it answers
pub const ROW_KEY_FIELD: &str = "_qkey";

/// Where a returned row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Hit,
    Miss,
}

/// A result row plus its origin; only `row` is ever written to the store
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRow {
    pub row: Row,
    pub origin: Origin,
}

impl CachedRow {
    fn hit(row: Row) -> Self {
        Self {
            row,
            origin: Origin::Hit,
        }
    }

    fn miss(row: Row) -> Self {
        Self {
            row,
            origin: Origin::Miss,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.origin == Origin::Hit
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.row.get(column)
    }
}

#[derive(Debug, Clone)]
pub struct QueryCacheConfig {
    /// Deadline for each cache-store round trip; `None` waits indefinitely
    pub operation_timeout: Option<Duration>,
    /// How many batched statements `run10` may have in flight at once
    pub batch_concurrency: usize,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            operation_timeout: None,
            batch_concurrency: 1,
        }
    }
}

impl From<&CacheSettings> for QueryCacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            operation_timeout: settings.operation_timeout_ms.map(Duration::from_millis),
            batch_concurrency: settings.batch_concurrency.max(1),
        }
    }
}

/// Cache store key for one primary key of a query
pub fn cache_key(query_name: &str, primary: &str) -> String {
    format!("{}:{}", query_name, primary)
}

/// Hash field for secondary key parts: their compact JSON array
pub fn secondary_field(parts: &[Value]) -> String {
    Value::List(parts.to_vec()).to_key_segment()
}

/// Split keys into full batches of `BATCH_WIDTH` parameters, padding the
/// last one with nulls
pub fn batch_chunks(keys: &[String]) -> Vec<Vec<Value>> {
    keys.chunks(BATCH_WIDTH)
        .map(|chunk| {
            let mut params: Vec<Value> = chunk.iter().map(|k| Value::from(k.as_str())).collect();
            params.resize(BATCH_WIDTH, Value::Null);
            params
        })
        .collect()
}

/// Query executor that serves repeated point lookups from a cache store
///
/// The database stays authoritative: cache-store failures turn into misses,
/// database failures are returned to the caller.
#[derive(Clone)]
pub struct QueryCache {
    store: Arc<dyn CacheStore>,
    sessions: SessionFactory,
    config: QueryCacheConfig,
}

impl QueryCache {
    pub fn new(store: Arc<dyn CacheStore>, sessions: SessionFactory) -> Self {
        Self {
            store,
            sessions,
            config: QueryCacheConfig::default(),
        }
    }

    pub fn with_config(mut self, config: QueryCacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sessions(&self) -> &SessionFactory {
        &self.sessions
    }

    /// Fetch the first row of `sql` for `key_parts`, through the cache
    ///
    /// `key_parts[0]` is the primary key; any further parts pick a field of
    /// the hash stored under it. All parts are bound as positional
    /// parameters. With `ttl_seconds <= 0` the cache is neither read nor
    /// written. An empty result is `Ok(None)` and is not cached.
    #[instrument(skip(self, sql, key_parts), fields(query = query_name, ttl = ttl_seconds))]
    pub async fn run1(
        &self,
        query_name: &str,
        sql: &str,
        key_parts: &[Value],
        ttl_seconds: i64,
    ) -> Result<Option<CachedRow>, QueryCacheError> {
        let (primary, secondary) = key_parts
            .split_first()
            .ok_or_else(|| QueryCacheError::EmptyKey(query_name.to_string()))?;

        let key = cache_key(query_name, &primary.to_key_segment());
        let field = (!secondary.is_empty()).then(|| secondary_field(secondary));

        if ttl_seconds > 0 {
            if let Some(row) = self.lookup(&key, field.as_deref()).await {
                telemetry::record_cache_hit(query_name);
                return Ok(Some(CachedRow::hit(row)));
            }
        }
        telemetry::record_cache_miss(query_name);

        let mut session = self.sessions.session();
        let rows = session.query(sql, key_parts).await;
        session.close();

        let Some(row) = rows?.into_iter().next() else {
            debug!(key = %key, "No row found");
            return Ok(None);
        };

        if ttl_seconds > 0 {
            self.write_back(&key, field.as_deref(), &row, ttl_seconds as u64)
                .await;
        }
        Ok(Some(CachedRow::miss(row)))
    }

    /// Fetch rows for many keys, `BATCH_WIDTH` keys per statement
    ///
    /// `sql` takes exactly `BATCH_WIDTH` positional parameters and each row it
    /// returns carries the key it answers in `ROW_KEY_FIELD`. Keys without a
    /// row are absent from the result. Any failed statement fails the call;
    /// rows of statements that already completed stay cached.
    ///
    /// Keys and the null padding are bound as `TEXT`. Compare them against a
    /// non-text column through a cast, e.g. `WHERE id IN ($1::int4, ...)`,
    /// and return the key as text, e.g. `id::text AS _qkey`.
    #[instrument(skip(self, sql, keys), fields(query = query_name, keys = keys.len(), ttl = ttl_seconds))]
    pub async fn run10<K>(
        &self,
        query_name: &str,
        sql: &str,
        keys: &[K],
        ttl_seconds: i64,
    ) -> Result<HashMap<String, CachedRow>, QueryCacheError>
    where
        K: AsRef<str> + Sync,
    {
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();

        if ttl_seconds > 0 {
            let lookups = keys.iter().map(|key| {
                let key = key.as_ref();
                async move { (key, self.lookup(&cache_key(query_name, key), None).await) }
            });
            for (key, cached) in join_all(lookups).await {
                match cached {
                    Some(row) => {
                        telemetry::record_cache_hit(query_name);
                        found.insert(key.to_string(), CachedRow::hit(row));
                    }
                    None => missing.push(key.to_string()),
                }
            }
        } else {
            missing.extend(keys.iter().map(|key| key.as_ref().to_string()));
        }

        if missing.is_empty() {
            return Ok(found);
        }
        for _ in &missing {
            telemetry::record_cache_miss(query_name);
        }

        let chunks = batch_chunks(&missing);
        debug!(
            missing = missing.len(),
            batches = chunks.len(),
            "Fetching uncached keys"
        );

        let mut batches = stream::iter(chunks)
            .map(|params| self.fetch_batch(query_name, sql, params, ttl_seconds))
            .buffer_unordered(self.config.batch_concurrency.max(1));

        while let Some(rows) = batches.next().await {
            for (key, row) in rows? {
                found.insert(key, CachedRow::miss(row));
            }
        }

        Ok(found)
    }

    /// Drop the cached entry for `key`, including every secondary field
    /// stored under it; a missing entry is not an error
    #[instrument(skip(self), fields(query = query_name))]
    pub async fn invalidate(&self, query_name: &str, key: &str) -> Result<(), QueryCacheError> {
        let key = cache_key(query_name, key);
        self.bounded(self.store.delete(&key)).await.map_err(|e| {
            telemetry::record_cache_store_error("delete");
            warn!(key = %key, error = %e, "Failed to invalidate cache entry");
            e
        })?;
        debug!(key = %key, "Cache entry invalidated");
        Ok(())
    }

    async fn fetch_batch(
        &self,
        query_name: &str,
        sql: &str,
        params: Vec<Value>,
        ttl_seconds: i64,
    ) -> Result<Vec<(String, Row)>, QueryCacheError> {
        telemetry::record_batch_execution(query_name);

        let mut session = self.sessions.session();
        let rows = session.query(sql, &params).await;
        session.close();

        let rows = rows?;
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key = match row.get(ROW_KEY_FIELD) {
                Some(value) if !value.is_null() => value.to_key_segment(),
                _ => {
                    return Err(QueryCacheError::MissingRowKey {
                        query_name: query_name.to_string(),
                        field: ROW_KEY_FIELD.to_string(),
                    })
                }
            };

            if ttl_seconds > 0 {
                self.write_back(&cache_key(query_name, &key), None, &row, ttl_seconds as u64)
                    .await;
            }
            keyed.push((key, row));
        }

        Ok(keyed)
    }

    /// Read a cached row; any store failure or undecodable payload is a miss
    async fn lookup(&self, key: &str, field: Option<&str>) -> Option<Row> {
        let (operation, result) = match field {
            None => ("get", self.bounded(self.store.get(key)).await),
            Some(field) => ("hget", self.bounded(self.store.hget(key, field)).await),
        };

        let bytes = match result {
            Ok(bytes) => bytes?,
            Err(e) => {
                telemetry::record_cache_store_error(operation);
                warn!(key = %key, error = %e, "Cache read failed, falling back to database");
                return None;
            }
        };

        match serde_json::from_slice::<Row>(&bytes) {
            Ok(row) => Some(row),
            Err(e) => {
                telemetry::record_cache_store_error("decode");
                warn!(key = %key, error = %e, "Undecodable cache entry, treating as miss");
                None
            }
        }
    }

    /// Store a fetched row; failures are logged and otherwise ignored
    async fn write_back(&self, key: &str, field: Option<&str>, row: &Row, ttl_seconds: u64) {
        let payload = match serde_json::to_vec(row) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Row not serializable, skipping cache write");
                return;
            }
        };

        let (operation, result) = match field {
            None => (
                "set",
                self.bounded(self.store.set(key, &payload, ttl_seconds)).await,
            ),
            Some(field) => match self.bounded(self.store.hset(key, field, &payload)).await {
                // The outer key's TTL is renewed on every field write
                Ok(()) => (
                    "expire",
                    self.bounded(self.store.expire(key, ttl_seconds)).await,
                ),
                Err(e) => ("hset", Err(e)),
            },
        };

        if let Err(e) = result {
            telemetry::record_cache_store_error(operation);
            warn!(key = %key, error = %e, "Cache write failed");

            // A hash whose TTL could not be set would never expire
            if operation == "expire" {
                if let Err(e) = self.bounded(self.store.delete(key)).await {
                    telemetry::record_cache_store_error("delete");
                    warn!(key = %key, error = %e, "Failed to drop hash left without TTL");
                }
            }
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match self.config.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| StorageError::Timeout(limit.as_millis() as u64))?,
            None => fut.await,
        }
    }
}
