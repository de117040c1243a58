// Cache store backends and the caching query executor

pub mod query;
pub mod redis;
pub mod store;

pub use query::{
    batch_chunks, cache_key, secondary_field, CachedRow, Origin, QueryCache, QueryCacheConfig,
    BATCH_WIDTH, ROW_KEY_FIELD,
};
pub use redis::RedisCacheStore;
pub use store::{CacheStore, MemoryCacheStore};
