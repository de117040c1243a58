// Caching query layer: keyed connection pool, scoped sessions and a query cache

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod db;
pub mod dsn;
pub mod errors;
pub mod telemetry;
pub mod value;
