use super::account::{Account, AccountId, AccountNumber, Balance, Company, CompanyId};
use super::transaction::{LedgerEntry, NewLedgerEntry};
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Account access inside an open unit of work.
#[async_trait]
pub trait AccountStore: Send {
    /// Resolves `number`, takes an exclusive row lock held until the unit of work
    /// ends, and returns the balance as this unit currently sees it.
    ///
    /// Locking an account this unit already holds does not block.
    async fn lock_and_get_balance(&mut self, number: AccountNumber) -> Result<(AccountId, Balance)>;

    /// Resolves `number` without locking.
    async fn resolve_id(&mut self, number: AccountNumber) -> Result<AccountId>;

    /// Applies `balance += delta`. Debits require the row lock.
    async fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<()>;
}

/// Append-only transaction log inside an open unit of work.
#[async_trait]
pub trait TransactionLog: Send {
    async fn append(&mut self, entry: NewLedgerEntry) -> Result<()>;
}

/// One atomic, isolated unit against the store.
///
/// Dropping a unit of work without calling [`UnitOfWork::commit`] rolls back
/// every change made through it and releases its locks.
#[async_trait]
pub trait UnitOfWork: AccountStore + TransactionLog {
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Entry point of the store for the transfer engine.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<UnitOfWorkBox>;
}

/// Plain lookups and inserts for companies and accounts, plus read access to the
/// transaction log. None of these touch balances of existing accounts.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn create_company(&self, name: &str) -> Result<Company>;
    async fn list_companies(&self) -> Result<Vec<Company>>;
    async fn get_company(&self, id: CompanyId) -> Result<Option<Company>>;
    async fn open_account(&self, company: CompanyId, opening: Balance) -> Result<Account>;
    /// Opens an account under an explicit number, e.g. when seeding from a file.
    /// A number already in use is a validation error.
    async fn insert_account(
        &self,
        company: CompanyId,
        number: AccountNumber,
        opening: Balance,
    ) -> Result<Account>;
    async fn list_accounts(&self, company: CompanyId) -> Result<Vec<Account>>;
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>>;
    async fn find_account(&self, number: AccountNumber) -> Result<Option<Account>>;
    async fn ledger_entries(&self) -> Result<Vec<LedgerEntry>>;
}

pub type UnitOfWorkBox = Box<dyn UnitOfWork>;
pub type LedgerStoreBox = Box<dyn LedgerStore>;
pub type RegistryBox = Box<dyn Registry>;
