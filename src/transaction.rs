//! Transactional sessions
//!
//! A [`TransactionalSession`] owns one open database transaction. Adapter
//! writes issued with a session run on it right away; statements handed to
//! [`TransactionalSession::enqueue`] are kept in a [`StatementLog`] and replayed
//! in order at commit. Commit and abort consume the session, so a session can
//! never be reused.

use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::sql::builder::SqlStatement;

/// Ordered list of statements deferred to commit time
#[derive(Debug, Default, Clone)]
pub struct StatementLog {
    pending: Vec<SqlStatement>,
    executed: usize,
}

impl StatementLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a statement to run at commit
    pub fn push(&mut self, statement: SqlStatement) {
        self.pending.push(statement);
    }

    /// Statements waiting for commit
    pub fn pending(&self) -> &[SqlStatement] {
        &self.pending
    }

    /// Number of statements already run on the transaction
    pub fn executed(&self) -> usize {
        self.executed
    }

    fn record_executed(&mut self) {
        self.executed += 1;
    }

    fn take_pending(&mut self) -> Vec<SqlStatement> {
        std::mem::take(&mut self.pending)
    }
}

/// One open transaction plus its statement log
pub struct TransactionalSession {
    id: Uuid,
    tx: Transaction<'static, Postgres>,
    log: StatementLog,
}

impl std::fmt::Debug for TransactionalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalSession")
            .field("id", &self.id)
            .field("log", &self.log)
            .finish()
    }
}

impl TransactionalSession {
    /// Open a transaction on a pooled connection
    pub async fn begin(pool: &PgPool) -> Result<Self> {
        let tx = pool.begin().await?;
        let id = Uuid::new_v4();
        debug!(session = %id, "transaction opened");
        Ok(Self {
            id,
            tx,
            log: StatementLog::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn log(&self) -> &StatementLog {
        &self.log
    }

    /// Defer a statement until commit
    pub fn enqueue(&mut self, statement: SqlStatement) {
        self.log.push(statement);
    }

    /// Connection of the open transaction, for statements that return rows
    pub fn connection(&mut self) -> &mut PgConnection {
        self.log.record_executed();
        &mut self.tx
    }

    /// Replay the deferred statements in order, then commit
    ///
    /// If any replayed statement fails the transaction is rolled back and the
    /// error returned.
    pub async fn commit(mut self) -> Result<()> {
        let pending = self.log.take_pending();
        let replayed = pending.len();
        for statement in &pending {
            statement.query().execute(&mut *self.tx).await?;
            self.log.record_executed();
        }
        self.tx.commit().await?;
        debug!(
            session = %self.id,
            replayed,
            executed = self.log.executed(),
            "transaction committed"
        );
        Ok(())
    }

    /// Roll back and discard deferred statements
    ///
    /// Always resolves; a failed rollback is logged since the connection drop
    /// rolls back anyway.
    pub async fn abort(mut self) -> Result<()> {
        let discarded = self.log.take_pending().len();
        if let Err(err) = self.tx.rollback().await {
            warn!(session = %self.id, error = %err, "rollback failed");
        }
        debug!(session = %self.id, discarded, "transaction aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::builder::SqlParam;

    #[test]
    fn test_log_keeps_enqueue_order() {
        let mut log = StatementLog::new();
        log.push(SqlStatement::raw("SELECT 1"));
        log.push(SqlStatement::new("SELECT $1", vec![SqlParam::Int(2)]));

        let sql: Vec<&str> = log.pending().iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(sql, vec!["SELECT 1", "SELECT $1"]);
        assert_eq!(log.executed(), 0);
    }

    #[test]
    fn test_take_pending_empties_log() {
        let mut log = StatementLog::new();
        log.push(SqlStatement::raw("SELECT 1"));
        log.record_executed();

        let taken = log.take_pending();
        assert_eq!(taken.len(), 1);
        assert!(log.pending().is_empty());
        assert_eq!(log.executed(), 1);
    }
}
