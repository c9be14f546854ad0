use crate::config::EngineConfig;
use crate::domain::ports::{AccountStore, LedgerStoreBox, TransactionLog, UnitOfWork, UnitOfWorkBox};
use crate::domain::transaction::{NewLedgerEntry, TransferRequest};
use crate::error::{BatchFailure, LedgerError, Result};
use std::fmt::Display;
use std::future::Future;
use tracing::{debug, info, warn};

/// Moves funds between accounts.
///
/// `TransferEngine` owns the injected store handle and runs every call as one
/// unit of work: the source row is locked, sufficiency is checked, both balances
/// move and a ledger entry is appended, then everything commits together. Any
/// error drops the unit of work, which rolls it back.
///
/// The engine keeps no state of its own, so one instance can be shared across
/// tasks (for example behind an `Arc`).
pub struct TransferEngine {
    store: LedgerStoreBox,
    config: EngineConfig,
}

/// Result of evaluating one request inside an open unit of work.
pub(crate) enum Posting {
    Applied,
    /// Nothing was changed. `entry` describes the attempt should the caller
    /// want it recorded.
    Rejected {
        entry: NewLedgerEntry,
        error: LedgerError,
    },
}

impl TransferEngine {
    /// Creates an engine with the default [`EngineConfig`].
    pub fn new(store: LedgerStoreBox) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: LedgerStoreBox, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Transfers `request.amount()` from the source to the target account.
    ///
    /// Returns `InsufficientFunds` without changing anything when the source
    /// balance does not cover the amount. With `audit_rejections` enabled the
    /// rejected attempt is still written to the transaction log.
    pub async fn transfer(&self, request: TransferRequest) -> Result<()> {
        self.with_retries(|| self.attempt_transfer(&request)).await
    }

    async fn attempt_transfer(&self, request: &TransferRequest) -> Result<()> {
        let timeout = self.config.transfer_timeout();
        // The deadline stops at commit: a commit already sent must not be
        // reported as a timeout.
        let (mut uow, posting) = tokio::time::timeout(timeout, self.prepare_transfer(request))
            .await
            .map_err(|_| LedgerError::Timeout(timeout))??;

        match posting {
            Posting::Applied => {
                uow.commit().await?;
                info!(
                    source = %request.source(),
                    target = %request.target(),
                    amount = %request.amount(),
                    "transfer committed"
                );
                Ok(())
            }
            Posting::Rejected { entry, error } => {
                if self.config.audit_rejections {
                    uow.append(entry).await?;
                    uow.commit().await?;
                }
                info!(
                    source = %request.source(),
                    target = %request.target(),
                    amount = %request.amount(),
                    recorded = self.config.audit_rejections,
                    "transfer rejected: {}",
                    error
                );
                Err(error)
            }
        }
    }

    async fn prepare_transfer(&self, request: &TransferRequest) -> Result<(UnitOfWorkBox, Posting)> {
        let mut uow = self.begin().await?;
        let posting = post(&mut uow, request).await?;
        Ok((uow, posting))
    }

    pub(super) async fn begin(&self) -> Result<UnitOfWorkBox> {
        self.store.begin().await
    }

    /// Re-runs `op` while it fails with a retryable conflict, up to
    /// `max_attempts` in total.
    pub(super) async fn with_retries<T, E, F, Fut>(&self, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt: u32 = 1;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    warn!(attempt, error = %e, "unit of work conflicted, retrying");
                    tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Errors that may succeed when the whole unit of work is run again.
pub(crate) trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for LedgerError {
    fn is_retryable(&self) -> bool {
        LedgerError::is_retryable(self)
    }
}

impl Retryable for BatchFailure {
    fn is_retryable(&self) -> bool {
        BatchFailure::is_retryable(self)
    }
}

/// Applies one request inside `uow`: lock the source, resolve the target,
/// check funds, debit, credit, log.
///
/// An `Err` leaves `uow` in an unknown state and must be followed by dropping it.
pub(crate) async fn post(uow: &mut UnitOfWorkBox, request: &TransferRequest) -> Result<Posting> {
    let amount = request.amount();

    let (source_id, available) = uow.lock_and_get_balance(request.source()).await?;
    let target_id = uow.resolve_id(request.target()).await?;

    if !available.covers(amount) {
        let error = LedgerError::InsufficientFunds {
            account: request.source(),
            available: available.0,
            requested: amount.value(),
        };
        let entry = NewLedgerEntry::rejected(source_id, target_id, amount, error.to_string());
        return Ok(Posting::Rejected { entry, error });
    }

    uow.adjust_balance(source_id, -amount.value()).await?;
    uow.adjust_balance(target_id, amount.value()).await?;
    uow.append(NewLedgerEntry::applied(source_id, target_id, amount))
        .await?;

    debug!(
        source_id = %source_id,
        target_id = %target_id,
        amount = %amount,
        "posting applied"
    );
    Ok(Posting::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::{Account, AccountNumber, Balance};
    use crate::domain::ports::Registry;
    use crate::error::ErrorKind;
    use crate::infrastructure::in_memory::InMemoryLedger;
    use rust_decimal_macros::dec;

    async fn setup(config: EngineConfig) -> (TransferEngine, InMemoryLedger, Account, Account) {
        let ledger = InMemoryLedger::new();
        let company = ledger.create_company("Acme").await.unwrap();
        let a = ledger
            .open_account(company.id, Balance::new(dec!(200)))
            .await
            .unwrap();
        let b = ledger.open_account(company.id, Balance::ZERO).await.unwrap();
        let engine = TransferEngine::with_config(Box::new(ledger.clone()), config);
        (engine, ledger, a, b)
    }

    async fn balance(ledger: &InMemoryLedger, number: AccountNumber) -> Balance {
        ledger.find_account(number).await.unwrap().unwrap().balance
    }

    #[tokio::test]
    async fn test_transfer_then_overdraft() {
        let (engine, ledger, a, b) = setup(EngineConfig::default()).await;

        let first = TransferRequest::new(a.number, b.number, dec!(150)).unwrap();
        engine.transfer(first).await.unwrap();
        assert_eq!(balance(&ledger, a.number).await, Balance::new(dec!(50)));
        assert_eq!(balance(&ledger, b.number).await, Balance::new(dec!(150)));
        assert_eq!(ledger.ledger_entries().await.unwrap().len(), 1);

        let second = TransferRequest::new(a.number, b.number, dec!(100)).unwrap();
        let err = engine.transfer(second).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { available, requested, .. }
                if available == dec!(50) && requested == dec!(100)
        ));

        assert_eq!(balance(&ledger, a.number).await, Balance::new(dec!(50)));
        assert_eq!(balance(&ledger, b.number).await, Balance::new(dec!(150)));
        assert_eq!(ledger.ledger_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exact_balance_is_sufficient() {
        let (engine, ledger, a, b) = setup(EngineConfig::default()).await;

        let request = TransferRequest::new(a.number, b.number, dec!(200)).unwrap();
        engine.transfer(request).await.unwrap();
        assert_eq!(balance(&ledger, a.number).await, Balance::ZERO);
        assert_eq!(balance(&ledger, b.number).await, Balance::new(dec!(200)));
    }

    #[tokio::test]
    async fn test_unknown_accounts() {
        let (engine, ledger, a, _) = setup(EngineConfig::default()).await;

        let request = TransferRequest::new(AccountNumber(1), a.number, dec!(1)).unwrap();
        let err = engine.transfer(request).await.unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(AccountNumber(1))));

        let request = TransferRequest::new(a.number, AccountNumber(2), dec!(1)).unwrap();
        let err = engine.transfer(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(balance(&ledger, a.number).await, Balance::new(dec!(200)));
        assert!(ledger.ledger_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audited_rejection_is_logged_without_moving_funds() {
        let config = EngineConfig {
            audit_rejections: true,
            ..EngineConfig::default()
        };
        let (engine, ledger, a, b) = setup(config).await;

        let request = TransferRequest::new(a.number, b.number, dec!(500)).unwrap();
        let err = engine.transfer(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

        assert_eq!(balance(&ledger, a.number).await, Balance::new(dec!(200)));
        assert_eq!(balance(&ledger, b.number).await, Balance::ZERO);

        let entries = ledger.ledger_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_applied());
        assert_eq!(entries[0].source_account_id, a.id);
        assert_eq!(entries[0].amount, dec!(500));
        assert!(entries[0].error.as_deref().unwrap().contains("insufficient"));
    }

    #[tokio::test]
    async fn test_retries_stop_at_max_attempts() {
        let (engine, _, _, _) = setup(EngineConfig {
            max_attempts: 3,
            retry_backoff_ms: 0,
            ..EngineConfig::default()
        })
        .await;

        let mut calls = 0;
        let result: Result<()> = engine
            .with_retries(|| {
                calls += 1;
                async { Err(LedgerError::Conflict("40001".into())) }
            })
            .await;
        assert!(matches!(result, Err(LedgerError::Conflict(_))));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_fail_fast() {
        let (engine, _, _, _) = setup(EngineConfig::default()).await;

        let mut calls = 0;
        let result: Result<()> = engine
            .with_retries(|| {
                calls += 1;
                async { Err(LedgerError::StoreError("broken pipe".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_conflict() {
        let (engine, _, _, _) = setup(EngineConfig {
            retry_backoff_ms: 0,
            ..EngineConfig::default()
        })
        .await;

        let mut calls = 0;
        let result = engine
            .with_retries(|| {
                calls += 1;
                let outcome = if calls == 1 {
                    Err(LedgerError::Conflict("deadlock detected".into()))
                } else {
                    Ok(calls)
                };
                async move { outcome }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }
}
