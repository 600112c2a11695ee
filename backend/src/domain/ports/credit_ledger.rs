//! Port for the per-user credit balance.
//!
//! The ledger exposes atomic adjustment only. Precondition checks (balance
//! covering a cost) belong to callers; the ledger's single invariant is that
//! it never stores a negative balance, so refund and credit primitives floor
//! at zero. Adapters must implement `adjust` with an atomic
//! increment/decrement, not an application-level read-then-write.

use async_trait::async_trait;

use crate::domain::identity::UserId;

/// Errors raised by credit ledger adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreditLedgerError {
    /// Ledger backend could not be reached.
    #[error("credit ledger connection failed: {message}")]
    Connection { message: String },
    /// Adjustment or read failed during execution.
    #[error("credit ledger operation failed: {message}")]
    Operation { message: String },
}

impl CreditLedgerError {
    /// Helper for connection oriented failures.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Helper for operation failures.
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation {
            message: message.into(),
        }
    }
}

/// Port for atomic credit balance reads and adjustments.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Current balance for `user_id`; absent users read as zero.
    async fn balance(&self, user_id: &UserId) -> Result<i64, CreditLedgerError>;

    /// Atomically add `delta` (negative to debit) to the user's balance and
    /// return the new value. The stored result is floored at zero.
    async fn adjust(&self, user_id: &UserId, delta: i64) -> Result<i64, CreditLedgerError>;
}

/// Fixture implementation with an unlimited zero balance.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixtureCreditLedger;

#[async_trait]
impl CreditLedger for FixtureCreditLedger {
    async fn balance(&self, _user_id: &UserId) -> Result<i64, CreditLedgerError> {
        Ok(0)
    }

    async fn adjust(&self, _user_id: &UserId, delta: i64) -> Result<i64, CreditLedgerError> {
        Ok(delta.max(0))
    }
}

#[cfg(test)]
mod tests {
    //! Regression coverage for this module.

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[tokio::test]
    async fn fixture_floors_at_zero() {
        let ledger = FixtureCreditLedger;
        let balance = ledger
            .adjust(&UserId::random(), -5)
            .await
            .expect("fixture adjust succeeds");
        assert_eq!(balance, 0);
    }

    #[rstest]
    fn operation_error_formats_message() {
        let err = CreditLedgerError::operation("row lock timeout");
        assert!(err.to_string().contains("row lock timeout"));
    }
}
