// Error handling framework
// One enum per concern; the query cache wraps them all in QueryCacheError

use thiserror::Error;

/// Missing or invalid configuration, raised before any pool activity
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Required secret not set: environment variable {0}")]
    MissingSecret(String),

    #[error("Missing required setting: {0}")]
    MissingSetting(String),

    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out after {0} seconds waiting for a pooled connection")]
    AcquireTimeout(u64),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Database operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Invalid statement: {0}")]
    InvalidStatement(String),
}

impl DatabaseError {
    /// Whether the error means no physical connection could be obtained
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DatabaseError::ConnectionFailed(_) | DatabaseError::AcquireTimeout(_)
        )
    }
}

/// Cache store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Redis error: {0}")]
    RedisError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Cache store operation timed out after {0} ms")]
    Timeout(u64),
}

/// Errors surfaced by the query cache to its callers
///
/// An absent row is not an error; it is `Ok(None)` or a missing map entry.
#[derive(Error, Debug)]
pub enum QueryCacheError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Query {0} called with an empty cache key")]
    EmptyKey(String),

    #[error("Row returned by query {query_name} has no {field} column")]
    MissingRowKey { query_name: String, field: String },
}

// Implement From for common external errors
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(e) => DatabaseError::ConnectionFailed(e.to_string()),
            sqlx::Error::Io(e) => DatabaseError::ConnectionFailed(e.to_string()),
            sqlx::Error::Tls(e) => DatabaseError::ConnectionFailed(e.to_string()),
            sqlx::Error::PoolTimedOut => DatabaseError::AcquireTimeout(0),
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    // Class 08: connection exception, class 28: invalid authorization
                    if code.starts_with("08") || code.starts_with("28") {
                        return DatabaseError::ConnectionFailed(db_err.message().to_string());
                    }
                }
                DatabaseError::QueryFailed(db_err.message().to_string())
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() {
            StorageError::ConnectionFailed(err.to_string())
        } else {
            StorageError::RedisError(err.to_string())
        }
    }
}
