// Scoped database sessions over pooled connections
// Every statement runs in its own transaction; the connection always goes back to the pool

use crate::db::pool::{ConnectionPool, PooledConnection};
use crate::dsn::Dsn;
use crate::errors::DatabaseError;
use crate::value::{Row, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Opens sessions against one DSN
#[derive(Clone)]
pub struct SessionFactory {
    pool: Arc<ConnectionPool>,
    dsn: Dsn,
    timeout: Option<Duration>,
}

impl SessionFactory {
    pub fn new(pool: Arc<ConnectionPool>, dsn: Dsn) -> Self {
        Self {
            pool,
            dsn,
            timeout: None,
        }
    }

    /// Per-statement deadline applied to every session this factory opens
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session(&self) -> Session {
        Session::new(self.pool.clone(), self.dsn.clone()).with_timeout(self.timeout)
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn dsn(&self) -> &Dsn {
        &self.dsn
    }
}

/// Exclusive borrow of one pooled connection for a unit of work
///
/// The connection is returned to the pool by `close()` or, at the latest,
/// when the session is dropped. Statements that fail are rolled back and
/// their error is returned.
pub struct Session {
    pool: Arc<ConnectionPool>,
    dsn: Dsn,
    conn: Option<PooledConnection>,
    // Set between BEGIN and COMMIT/ROLLBACK
    in_transaction: bool,
    timeout: Option<Duration>,
}

impl Session {
    pub fn new(pool: Arc<ConnectionPool>, dsn: Dsn) -> Self {
        Self {
            pool,
            dsn,
            conn: None,
            in_transaction: false,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Pool id of the borrowed connection, if any
    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(PooledConnection::id)
    }

    /// Borrow a connection from the pool unless one is already held
    pub async fn open(&mut self) -> Result<&mut Self, DatabaseError> {
        if self.conn.is_none() {
            let conn = self.pool.acquire(&self.dsn).await?;
            debug!(connection_id = conn.id(), "Session opened");
            self.conn = Some(conn);
        }
        Ok(self)
    }

    /// Return the connection to the pool; a no-op when nothing is held
    ///
    /// Every operation commits its own work, so a completed session has no
    /// transaction left to commit. A transaction is only still open when an
    /// operation future was dropped before finishing. Its work is incomplete,
    /// so `close` rolls it back rather than committing it: the connection goes
    /// to a background task that rolls back and then releases it.
    pub fn close(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if !self.in_transaction {
            self.pool.release(&self.dsn, conn);
            return;
        }
        self.in_transaction = false;

        let pool = self.pool.clone();
        let dsn = self.dsn.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    connection_id = conn.id(),
                    "Session closed mid-transaction, rolling back"
                );
                handle.spawn(async move {
                    let mut conn = conn;
                    match conn.rollback().await {
                        Ok(()) => pool.release(&dsn, conn),
                        Err(e) => {
                            warn!(error = %e, "Rollback of interrupted session failed");
                            pool.discard(conn);
                        }
                    }
                });
            }
            Err(_) => {
                warn!("No runtime to roll back interrupted session, dropping connection");
                pool.discard(conn);
            }
        }
    }

    /// Run a read statement and return all rows
    #[instrument(skip(self, sql, params), fields(param_count = params.len()))]
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DatabaseError> {
        let timeout = self.timeout;
        let conn = self.begin().await?;
        let result = with_deadline(timeout, conn.fetch_all(sql, params)).await;
        let rows = self.finish(result).await?;

        debug!(rows = rows.len(), "Query returned rows");
        Ok(rows)
    }

    /// Run a write statement and return the affected-row count
    #[instrument(skip(self, sql, params), fields(param_count = params.len()))]
    pub async fn modify(&mut self, sql: &str, params: &[Value]) -> Result<u64, DatabaseError> {
        let timeout = self.timeout;
        let conn = self.begin().await?;
        let result = with_deadline(timeout, conn.execute(sql, params)).await;
        self.finish(result).await
    }

    /// Run several write statements in one transaction
    ///
    /// Any failure rolls back the whole batch; counts gathered before the
    /// failure are dropped.
    #[instrument(skip(self, statements), fields(statement_count = statements.len()))]
    pub async fn batch_modify(
        &mut self,
        statements: &[(&str, Vec<Value>)],
    ) -> Result<Vec<u64>, DatabaseError> {
        let timeout = self.timeout;
        let conn = self.begin().await?;

        let mut counts = Vec::with_capacity(statements.len());
        let mut result = Ok(());
        for (sql, params) in statements {
            match with_deadline(timeout, conn.execute(sql, params)).await {
                Ok(count) => counts.push(count),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.finish(result.map(|()| counts)).await
    }

    async fn begin(&mut self) -> Result<&mut PooledConnection, DatabaseError> {
        self.open().await?;
        let timeout = self.timeout;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DatabaseError::ConnectionFailed("Session not open".to_string()))?;

        // Marked before BEGIN so an interrupted BEGIN is also rolled back
        self.in_transaction = true;
        let began = with_deadline(timeout, conn.begin()).await;
        if let Err(e) = began {
            error!(error = %e, "BEGIN failed");
            self.recover().await;
            return Err(e);
        }

        self.conn
            .as_mut()
            .ok_or_else(|| DatabaseError::ConnectionFailed("Session not open".to_string()))
    }

    async fn finish<T>(&mut self, result: Result<T, DatabaseError>) -> Result<T, DatabaseError> {
        let timeout = self.timeout;
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Statement failed, rolling back");
                self.recover().await;
                return Err(e);
            }
        };

        let Some(conn) = self.conn.as_mut() else {
            return Err(DatabaseError::ConnectionFailed("Session not open".to_string()));
        };
        let committed = with_deadline(timeout, conn.commit()).await;
        match committed {
            Ok(()) => {
                self.in_transaction = false;
                Ok(value)
            }
            Err(e) => {
                error!(error = %e, "COMMIT failed");
                self.recover().await;
                Err(e)
            }
        }
    }

    /// Roll back the open transaction; a connection that cannot roll back is discarded
    async fn recover(&mut self) {
        let timeout = self.timeout;
        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        let rolled_back = with_deadline(timeout, conn.rollback()).await;
        if let Err(e) = rolled_back {
            error!(error = %e, "ROLLBACK failed, discarding connection");
            if let Some(conn) = self.conn.take() {
                self.pool.discard(conn);
            }
        }
        self.in_transaction = false;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn with_deadline<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, DatabaseError>
where
    F: Future<Output = Result<T, DatabaseError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| DatabaseError::Timeout(limit.as_millis() as u64))?,
        None => fut.await,
    }
}
