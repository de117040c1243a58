// Wiring helpers for binaries and live tests: settings in, ready components out

use crate::cache::{CacheStore, QueryCache, QueryCacheConfig, RedisCacheStore};
use crate::config::Settings;
use crate::db::{ConnectionPool, PgConnector, PoolConfig, SessionFactory};
use crate::dsn::Dsn;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Build the process-wide connection pool over PostgreSQL
pub fn init_connection_pool(settings: &Settings) -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(
        Arc::new(PgConnector),
        PoolConfig::from(&settings.pool),
    ))
}

/// Resolve the configured database's DSN, reading its password from the environment
///
/// # Errors
/// Returns error if the password variable is unset or the target is malformed
pub fn init_dsn(settings: &Settings) -> Result<Dsn> {
    let dsn = Dsn::from_settings(&settings.database).context("Failed to build database DSN")?;
    info!(dsn = %dsn, "Database DSN resolved");
    Ok(dsn)
}

/// Connect the Redis cache store and check it answers
///
/// # Errors
/// Returns error if Redis is unreachable
#[tracing::instrument(skip(settings))]
pub async fn init_cache_store(settings: &Settings) -> Result<Arc<RedisCacheStore>> {
    let store = RedisCacheStore::new(&settings.redis)
        .await
        .context("Failed to connect Redis cache store")?;
    store
        .health_check()
        .await
        .context("Redis cache store health check failed")?;

    info!("Redis cache store initialized");
    Ok(Arc::new(store))
}

/// Assemble a query cache for the configured database
///
/// # Errors
/// Returns error if the DSN cannot be built or Redis is unreachable
#[tracing::instrument(skip(settings, pool))]
pub async fn init_query_cache(settings: &Settings, pool: Arc<ConnectionPool>) -> Result<QueryCache> {
    let dsn = init_dsn(settings)?;
    let store = init_cache_store(settings).await?;

    let cache = assemble_query_cache(settings, pool, dsn, store);
    info!("Query cache initialized");
    Ok(cache)
}

/// Build a query cache over an already connected store, applying the
/// configured statement and cache-store deadlines
pub fn assemble_query_cache(
    settings: &Settings,
    pool: Arc<ConnectionPool>,
    dsn: Dsn,
    store: Arc<dyn CacheStore>,
) -> QueryCache {
    let sessions =
        SessionFactory::new(pool, dsn).with_timeout(settings.database.statement_timeout());
    QueryCache::new(store, sessions).with_config(QueryCacheConfig::from(&settings.cache))
}
