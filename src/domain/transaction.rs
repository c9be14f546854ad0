use super::account::{AccountId, AccountNumber, Amount};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// A validated request to move `amount` from `source` to `target`.
///
/// Fields are private: a value of this type always has a positive amount and
/// two distinct account numbers, so the engine never re-checks the shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransferRequest {
    source: AccountNumber,
    target: AccountNumber,
    amount: Amount,
}

impl TransferRequest {
    pub fn new(
        source: AccountNumber,
        target: AccountNumber,
        amount: Decimal,
    ) -> Result<Self, LedgerError> {
        if source == target {
            return Err(LedgerError::SameAccount(source));
        }
        Ok(Self {
            source,
            target,
            amount: Amount::new(amount)?,
        })
    }

    pub fn source(&self) -> AccountNumber {
        self.source
    }

    pub fn target(&self) -> AccountNumber {
        self.target
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }
}

/// A ledger entry about to be appended. The store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub source_account_id: AccountId,
    pub target_account_id: AccountId,
    pub amount: Amount,
    /// Set only for a rejected attempt that is being recorded.
    pub error: Option<String>,
}

impl NewLedgerEntry {
    pub fn applied(source: AccountId, target: AccountId, amount: Amount) -> Self {
        Self {
            source_account_id: source,
            target_account_id: target,
            amount,
            error: None,
        }
    }

    pub fn rejected(source: AccountId, target: AccountId, amount: Amount, error: String) -> Self {
        Self {
            source_account_id: source,
            target_account_id: target,
            amount,
            error: Some(error),
        }
    }
}

/// An immutable row of the transaction log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub source_account_id: AccountId,
    pub target_account_id: AccountId,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn is_applied(&self) -> bool {
        self.error.is_none()
    }
}
