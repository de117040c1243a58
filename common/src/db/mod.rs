// Database layer: physical connections, the keyed pool and scoped sessions

pub mod connection;
pub mod pool;
pub mod session;

pub use connection::{Connector, DbConnection, PgConnector};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use session::{Session, SessionFactory};
