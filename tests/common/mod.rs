#![allow(dead_code)]

use async_trait::async_trait;
use minibank::TransferEngine;
use minibank::config::EngineConfig;
use minibank::domain::account::{Account, AccountId, AccountNumber, Balance};
use minibank::domain::ports::{
    AccountStore, LedgerStore, Registry, TransactionLog, UnitOfWork, UnitOfWorkBox,
};
use minibank::domain::transaction::NewLedgerEntry;
use minibank::error::{LedgerError, Result};
use minibank::infrastructure::in_memory::InMemoryLedger;
use rust_decimal::Decimal;
use std::path::Path;
use std::time::Duration;

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_backoff_ms: 1,
        ..EngineConfig::default()
    }
}

/// One company holding one account per balance, in order.
pub async fn seeded_ledger(balances: &[Decimal]) -> (InMemoryLedger, Vec<Account>) {
    let ledger = InMemoryLedger::new();
    let company = ledger.create_company("Acme").await.unwrap();
    let mut accounts = Vec::with_capacity(balances.len());
    for balance in balances {
        let account = ledger
            .open_account(company.id, Balance::new(*balance))
            .await
            .unwrap();
        accounts.push(account);
    }
    (ledger, accounts)
}

pub async fn seeded_engine(balances: &[Decimal]) -> (TransferEngine, InMemoryLedger, Vec<Account>) {
    let (ledger, accounts) = seeded_ledger(balances).await;
    let engine = TransferEngine::with_config(Box::new(ledger.clone()), fast_config());
    (engine, ledger, accounts)
}

pub async fn balance_of(ledger: &InMemoryLedger, number: AccountNumber) -> Decimal {
    ledger.find_account(number).await.unwrap().unwrap().balance.0
}

pub async fn balances_of(ledger: &InMemoryLedger, accounts: &[Account]) -> Vec<Decimal> {
    let mut result = Vec::with_capacity(accounts.len());
    for account in accounts {
        result.push(balance_of(ledger, account.number).await);
    }
    result
}

/// Wraps an [`InMemoryLedger`] and fails every credit (positive adjustment)
/// with a store error, after the debit has already been staged.
#[derive(Clone)]
pub struct FailingLedger {
    inner: InMemoryLedger,
}

impl FailingLedger {
    pub fn new(inner: InMemoryLedger) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl LedgerStore for FailingLedger {
    async fn begin(&self) -> Result<UnitOfWorkBox> {
        Ok(Box::new(FailingUnitOfWork {
            inner: self.inner.begin().await?,
        }))
    }
}

struct FailingUnitOfWork {
    inner: UnitOfWorkBox,
}

#[async_trait]
impl AccountStore for FailingUnitOfWork {
    async fn lock_and_get_balance(&mut self, number: AccountNumber) -> Result<(AccountId, Balance)> {
        self.inner.lock_and_get_balance(number).await
    }

    async fn resolve_id(&mut self, number: AccountNumber) -> Result<AccountId> {
        self.inner.resolve_id(number).await
    }

    async fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<()> {
        if delta > Decimal::ZERO {
            return Err(LedgerError::StoreError("injected credit failure".to_string()));
        }
        self.inner.adjust_balance(id, delta).await
    }
}

#[async_trait]
impl TransactionLog for FailingUnitOfWork {
    async fn append(&mut self, entry: NewLedgerEntry) -> Result<()> {
        self.inner.append(entry).await
    }
}

#[async_trait]
impl UnitOfWork for FailingUnitOfWork {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await
    }
}

/// Wraps an [`InMemoryLedger`] and stalls every commit for `delay` before
/// committing.
#[derive(Clone)]
pub struct SlowCommitLedger {
    inner: InMemoryLedger,
    delay: Duration,
}

impl SlowCommitLedger {
    pub fn new(inner: InMemoryLedger, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl LedgerStore for SlowCommitLedger {
    async fn begin(&self) -> Result<UnitOfWorkBox> {
        Ok(Box::new(SlowCommitUnitOfWork {
            inner: self.inner.begin().await?,
            delay: self.delay,
        }))
    }
}

struct SlowCommitUnitOfWork {
    inner: UnitOfWorkBox,
    delay: Duration,
}

#[async_trait]
impl AccountStore for SlowCommitUnitOfWork {
    async fn lock_and_get_balance(&mut self, number: AccountNumber) -> Result<(AccountId, Balance)> {
        self.inner.lock_and_get_balance(number).await
    }

    async fn resolve_id(&mut self, number: AccountNumber) -> Result<AccountId> {
        self.inner.resolve_id(number).await
    }

    async fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<()> {
        self.inner.adjust_balance(id, delta).await
    }
}

#[async_trait]
impl TransactionLog for SlowCommitUnitOfWork {
    async fn append(&mut self, entry: NewLedgerEntry) -> Result<()> {
        self.inner.append(entry).await
    }
}

#[async_trait]
impl UnitOfWork for SlowCommitUnitOfWork {
    async fn commit(self: Box<Self>) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.commit().await
    }
}

/// Writes a seed file with `accounts` accounts of company `Acme`, numbered from
/// 1, each holding `balance`.
pub fn generate_accounts_csv(path: &Path, accounts: usize, balance: &str) -> std::io::Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["company", "account", "balance"])?;
    for number in 1..=accounts {
        wtr.write_record(["Acme", &number.to_string(), balance])?;
    }
    wtr.flush()
}

/// Writes a headerless batch of `rows` transfers of `amount` walking the ring
/// of accounts `1..=accounts`.
pub fn generate_batch_csv(
    path: &Path,
    accounts: usize,
    rows: usize,
    amount: &str,
) -> std::io::Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    for row in 0..rows {
        let source = row % accounts + 1;
        let target = source % accounts + 1;
        wtr.write_record([source.to_string(), target.to_string(), amount.to_string()])?;
    }
    wtr.flush()
}
