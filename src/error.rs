use thiserror::Error;

use crate::models::{JobId, Money, TxnId, UserId};

/// Errors raised by the matching pipeline, the billing ledger and the
/// gateway reconciler.
///
/// Most variants are contained at the scope where they happen: a failed
/// oracle call drops one (user, job) pair, a duplicate insert is ignored,
/// a bad signature leaves a transaction pending. Only `Storage` is allowed to
/// abort a whole user's run.
#[derive(Debug, Error)]
pub enum HuntError {
    #[error("scoring oracle failed for job {job_id}: {reason}")]
    OracleFailure { job_id: JobId, reason: String },

    #[error("match for user {user_id} and job {job_id} already exists")]
    PersistenceConflict { user_id: UserId, job_id: JobId },

    #[error("payment signature invalid for order {order_id}")]
    GatewaySignatureInvalid { order_id: String },

    #[error("payment gateway unreachable: {0}")]
    GatewayUnreachable(String),

    #[error("payment gateway rejected request: {0}")]
    Gateway(String),

    #[error("insufficient balance: {balance} available, {fee} required")]
    InsufficientBalance { balance: Money, fee: Money },

    #[error("transaction {txn_id} expired after {minutes} minutes without payment")]
    StaleTransactionUnresolved { txn_id: TxnId, minutes: i64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage lock poisoned")]
    LockPoisoned,

    #[error("malformed stored document: {0}")]
    Document(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HuntError>;

impl HuntError {
    /// Transport-level failures talking to the gateway; the transaction stays
    /// pending and a later sync or sweep picks it up.
    pub fn is_transient(&self) -> bool {
        matches!(self, HuntError::GatewayUnreachable(_))
    }
}

impl From<reqwest::Error> for HuntError {
    fn from(err: reqwest::Error) -> Self {
        HuntError::GatewayUnreachable(err.to_string())
    }
}
