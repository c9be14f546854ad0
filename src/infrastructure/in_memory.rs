use crate::config::DatabaseConfig;
use crate::domain::account::{
    Account, AccountId, AccountNumber, Balance, Company, CompanyId,
};
use crate::domain::ports::{
    AccountStore, LedgerStore, Registry, TransactionLog, UnitOfWork, UnitOfWorkBox,
};
use crate::domain::transaction::{LedgerEntry, NewLedgerEntry};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

/// First account number handed out by [`Registry::open_account`].
pub const FIRST_ACCOUNT_NUMBER: i64 = 1_000_000_000_000_000;

#[derive(Debug)]
struct AccountRow {
    account: Account,
    /// Exclusive row lock, held by at most one unit of work at a time.
    lock: Arc<Mutex<()>>,
}

#[derive(Debug)]
struct LedgerState {
    companies: BTreeMap<CompanyId, Company>,
    accounts: BTreeMap<AccountId, AccountRow>,
    numbers: HashMap<AccountNumber, AccountId>,
    entries: Vec<LedgerEntry>,
    next_company_id: i64,
    next_account_id: i64,
    next_account_number: i64,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            companies: BTreeMap::new(),
            accounts: BTreeMap::new(),
            numbers: HashMap::new(),
            entries: Vec::new(),
            next_company_id: 1,
            next_account_id: 1,
            next_account_number: FIRST_ACCOUNT_NUMBER,
        }
    }
}

impl LedgerState {
    fn account_id(&self, number: AccountNumber) -> Result<AccountId> {
        self.numbers
            .get(&number)
            .copied()
            .ok_or(LedgerError::AccountNotFound(number))
    }

    fn row(&self, id: AccountId) -> Result<&AccountRow> {
        self.accounts
            .get(&id)
            .ok_or_else(|| LedgerError::StoreError(format!("unknown account id {}", id)))
    }

    fn insert_row(&mut self, company_id: CompanyId, number: AccountNumber, balance: Balance) -> Account {
        let id = AccountId(self.next_account_id);
        self.next_account_id += 1;

        let account = Account {
            id,
            company_id,
            number,
            balance,
        };
        self.numbers.insert(number, id);
        self.accounts.insert(
            id,
            AccountRow {
                account: account.clone(),
                lock: Arc::new(Mutex::new(())),
            },
        );
        account
    }
}

/// A thread-safe in-memory ledger.
///
/// Behaves like a transactional store: every account row has its own async
/// mutex standing in for a `SELECT ... FOR UPDATE` lock, and a unit of work
/// buffers its writes until commit. `Clone` shares the underlying state.
#[derive(Clone)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
    lock_timeout: Duration,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// Creates a new, empty in-memory ledger.
    pub fn new() -> Self {
        Self::with_lock_timeout(DatabaseConfig::default().lock_timeout())
    }

    /// Creates an empty ledger whose row lock waits give up after `lock_timeout`.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerState::default())),
            lock_timeout,
        }
    }

    /// Sum of all committed balances.
    pub async fn total_balance(&self) -> Decimal {
        let state = self.state.read().await;
        state
            .accounts
            .values()
            .map(|row| row.account.balance.0)
            .sum()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn begin(&self) -> Result<UnitOfWorkBox> {
        Ok(Box::new(InMemoryUnitOfWork {
            state: Arc::clone(&self.state),
            lock_timeout: self.lock_timeout,
            held: HashMap::new(),
            deltas: BTreeMap::new(),
            pending: Vec::new(),
        }))
    }
}

#[async_trait]
impl Registry for InMemoryLedger {
    async fn create_company(&self, name: &str) -> Result<Company> {
        let mut state = self.state.write().await;
        let company = Company {
            id: CompanyId(state.next_company_id),
            name: name.to_string(),
        };
        state.next_company_id += 1;
        state.companies.insert(company.id, company.clone());
        Ok(company)
    }

    async fn list_companies(&self) -> Result<Vec<Company>> {
        let state = self.state.read().await;
        Ok(state.companies.values().cloned().collect())
    }

    async fn get_company(&self, id: CompanyId) -> Result<Option<Company>> {
        let state = self.state.read().await;
        Ok(state.companies.get(&id).cloned())
    }

    async fn open_account(&self, company: CompanyId, opening: Balance) -> Result<Account> {
        let mut state = self.state.write().await;
        if !state.companies.contains_key(&company) {
            return Err(LedgerError::CompanyNotFound(company));
        }
        // Skip numbers already taken by seeded accounts
        let mut number = AccountNumber(state.next_account_number);
        while state.numbers.contains_key(&number) {
            number = AccountNumber(number.0 + 1);
        }
        state.next_account_number = number.0 + 1;
        Ok(state.insert_row(company, number, opening))
    }

    async fn insert_account(
        &self,
        company: CompanyId,
        number: AccountNumber,
        opening: Balance,
    ) -> Result<Account> {
        let mut state = self.state.write().await;
        if !state.companies.contains_key(&company) {
            return Err(LedgerError::CompanyNotFound(company));
        }
        if state.numbers.contains_key(&number) {
            return Err(LedgerError::ValidationError(format!(
                "account number {} already exists",
                number
            )));
        }
        Ok(state.insert_row(company, number, opening))
    }

    async fn list_accounts(&self, company: CompanyId) -> Result<Vec<Account>> {
        let state = self.state.read().await;
        Ok(state
            .accounts
            .values()
            .filter(|row| row.account.company_id == company)
            .map(|row| row.account.clone())
            .collect())
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        let state = self.state.read().await;
        Ok(state.accounts.get(&id).map(|row| row.account.clone()))
    }

    async fn find_account(&self, number: AccountNumber) -> Result<Option<Account>> {
        let state = self.state.read().await;
        Ok(state
            .numbers
            .get(&number)
            .and_then(|id| state.accounts.get(id))
            .map(|row| row.account.clone()))
    }

    async fn ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state.entries.clone())
    }
}

/// Unit of work over an [`InMemoryLedger`].
///
/// Holds the row locks it acquired and buffers balance deltas and log entries.
/// Nothing reaches the shared state before [`UnitOfWork::commit`].
pub struct InMemoryUnitOfWork {
    state: Arc<RwLock<LedgerState>>,
    lock_timeout: Duration,
    held: HashMap<AccountId, OwnedMutexGuard<()>>,
    deltas: BTreeMap<AccountId, Decimal>,
    pending: Vec<NewLedgerEntry>,
}

impl InMemoryUnitOfWork {
    fn pending_delta(&self, id: AccountId) -> Decimal {
        self.deltas.get(&id).copied().unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl AccountStore for InMemoryUnitOfWork {
    async fn lock_and_get_balance(&mut self, number: AccountNumber) -> Result<(AccountId, Balance)> {
        let (id, row_lock) = {
            let state = self.state.read().await;
            let id = state.account_id(number)?;
            (id, Arc::clone(&state.row(id)?.lock))
        };

        if !self.held.contains_key(&id) {
            let guard = tokio::time::timeout(self.lock_timeout, row_lock.lock_owned())
                .await
                .map_err(|_| {
                    LedgerError::Conflict(format!(
                        "timed out waiting for the lock on account {}",
                        number
                    ))
                })?;
            self.held.insert(id, guard);
        }

        // Read only after the lock is ours
        let state = self.state.read().await;
        let committed = state.row(id)?.account.balance;
        Ok((id, committed + Balance::new(self.pending_delta(id))))
    }

    async fn resolve_id(&mut self, number: AccountNumber) -> Result<AccountId> {
        let state = self.state.read().await;
        state.account_id(number)
    }

    async fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<()> {
        self.state.read().await.row(id)?;
        if delta < Decimal::ZERO && !self.held.contains_key(&id) {
            return Err(LedgerError::StoreError(format!(
                "debit of account id {} without holding its lock",
                id
            )));
        }
        *self.deltas.entry(id).or_insert(Decimal::ZERO) += delta;
        Ok(())
    }
}

#[async_trait]
impl TransactionLog for InMemoryUnitOfWork {
    async fn append(&mut self, entry: NewLedgerEntry) -> Result<()> {
        {
            let state = self.state.read().await;
            state.row(entry.source_account_id)?;
            state.row(entry.target_account_id)?;
        }
        self.pending.push(entry);
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryUnitOfWork {
            state,
            held,
            deltas,
            pending,
            ..
        } = *self;

        let mut state = state.write().await;

        // Mirrors the CHECK (balance >= 0) constraint: validate everything first
        for (id, delta) in &deltas {
            let balance = state.row(*id)?.account.balance.0 + delta;
            if balance < Decimal::ZERO {
                return Err(LedgerError::StoreError(format!(
                    "balance of account id {} would become negative",
                    id
                )));
            }
        }

        for (id, delta) in &deltas {
            if let Some(row) = state.accounts.get_mut(id) {
                row.account.balance.0 += delta;
            }
        }

        let now = Utc::now();
        for entry in pending {
            let id = state.entries.len() as i64 + 1;
            state.entries.push(LedgerEntry {
                id,
                source_account_id: entry.source_account_id,
                target_account_id: entry.target_account_id,
                amount: entry.amount.value(),
                error: entry.error,
                created_at: now,
            });
        }

        debug!(accounts = deltas.len(), locks = held.len(), "in-memory unit of work committed");
        drop(state);
        drop(held);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::Amount;
    use rust_decimal_macros::dec;

    async fn ledger_with_two_accounts() -> (InMemoryLedger, Account, Account) {
        let ledger = InMemoryLedger::new();
        let company = ledger.create_company("Acme").await.unwrap();
        let a = ledger
            .open_account(company.id, Balance::new(dec!(100)))
            .await
            .unwrap();
        let b = ledger.open_account(company.id, Balance::ZERO).await.unwrap();
        (ledger, a, b)
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let ledger = InMemoryLedger::new();
        let company = ledger.create_company("Acme").await.unwrap();
        assert_eq!(company.id, CompanyId(1));

        let account = ledger
            .open_account(company.id, Balance::new(dec!(10)))
            .await
            .unwrap();
        assert_eq!(account.number, AccountNumber(FIRST_ACCOUNT_NUMBER));

        assert_eq!(ledger.list_companies().await.unwrap(), vec![company.clone()]);
        assert_eq!(
            ledger.list_accounts(company.id).await.unwrap(),
            vec![account.clone()]
        );
        assert_eq!(
            ledger.get_account(account.id).await.unwrap(),
            Some(account.clone())
        );
        assert_eq!(
            ledger.find_account(account.number).await.unwrap(),
            Some(account)
        );
        assert!(ledger.get_company(CompanyId(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_account_unknown_company() {
        let ledger = InMemoryLedger::new();
        let result = ledger.open_account(CompanyId(42), Balance::ZERO).await;
        assert!(matches!(result, Err(LedgerError::CompanyNotFound(CompanyId(42)))));
    }

    #[tokio::test]
    async fn test_open_account_skips_seeded_numbers() {
        let ledger = InMemoryLedger::new();
        let company = ledger.create_company("Acme").await.unwrap();
        ledger
            .insert_account(company.id, AccountNumber(FIRST_ACCOUNT_NUMBER), Balance::ZERO)
            .await
            .unwrap();

        let opened = ledger.open_account(company.id, Balance::ZERO).await.unwrap();
        assert_eq!(opened.number, AccountNumber(FIRST_ACCOUNT_NUMBER + 1));

        let duplicate = ledger
            .insert_account(company.id, opened.number, Balance::ZERO)
            .await;
        assert!(matches!(duplicate, Err(LedgerError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_unit_of_work_commit_applies_changes() {
        let (ledger, a, b) = ledger_with_two_accounts().await;
        let amount = Amount::new(dec!(30)).unwrap();

        let mut uow = ledger.begin().await.unwrap();
        let (a_id, balance) = uow.lock_and_get_balance(a.number).await.unwrap();
        assert_eq!(balance, Balance::new(dec!(100)));
        let b_id = uow.resolve_id(b.number).await.unwrap();
        uow.adjust_balance(a_id, -amount.value()).await.unwrap();
        uow.adjust_balance(b_id, amount.value()).await.unwrap();
        uow.append(NewLedgerEntry::applied(a_id, b_id, amount))
            .await
            .unwrap();

        // Not visible before commit
        let before = ledger.find_account(a.number).await.unwrap().unwrap();
        assert_eq!(before.balance, Balance::new(dec!(100)));

        uow.commit().await.unwrap();

        let a_after = ledger.find_account(a.number).await.unwrap().unwrap();
        let b_after = ledger.find_account(b.number).await.unwrap().unwrap();
        assert_eq!(a_after.balance, Balance::new(dec!(70)));
        assert_eq!(b_after.balance, Balance::new(dec!(30)));

        let entries = ledger.ledger_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, 1);
        assert_eq!(entries[0].amount, dec!(30));
        assert!(entries[0].is_applied());
    }

    #[tokio::test]
    async fn test_unit_of_work_drop_rolls_back() {
        let (ledger, a, b) = ledger_with_two_accounts().await;
        {
            let mut uow = ledger.begin().await.unwrap();
            let (a_id, _) = uow.lock_and_get_balance(a.number).await.unwrap();
            let b_id = uow.resolve_id(b.number).await.unwrap();
            uow.adjust_balance(a_id, dec!(-50)).await.unwrap();
            uow.adjust_balance(b_id, dec!(50)).await.unwrap();
        }

        assert_eq!(ledger.total_balance().await, dec!(100));
        let a_after = ledger.find_account(a.number).await.unwrap().unwrap();
        assert_eq!(a_after.balance, Balance::new(dec!(100)));
        assert!(ledger.ledger_entries().await.unwrap().is_empty());

        // The lock was released with the dropped unit
        let mut uow = ledger.begin().await.unwrap();
        assert!(uow.lock_and_get_balance(a.number).await.is_ok());
    }

    #[tokio::test]
    async fn test_relock_within_unit_sees_pending_delta() {
        let (ledger, a, b) = ledger_with_two_accounts().await;
        let mut uow = ledger.begin().await.unwrap();

        let b_id = uow.resolve_id(b.number).await.unwrap();
        uow.adjust_balance(b_id, dec!(25)).await.unwrap();

        let (a_id, _) = uow.lock_and_get_balance(a.number).await.unwrap();
        let (again, balance) = uow.lock_and_get_balance(a.number).await.unwrap();
        assert_eq!(a_id, again);
        assert_eq!(balance, Balance::new(dec!(100)));

        let (_, b_balance) = uow.lock_and_get_balance(b.number).await.unwrap();
        assert_eq!(b_balance, Balance::new(dec!(25)));
    }

    #[tokio::test]
    async fn test_debit_requires_lock() {
        let (ledger, a, _) = ledger_with_two_accounts().await;
        let mut uow = ledger.begin().await.unwrap();
        let a_id = uow.resolve_id(a.number).await.unwrap();

        let result = uow.adjust_balance(a_id, dec!(-1)).await;
        assert!(matches!(result, Err(LedgerError::StoreError(_))));
    }

    #[tokio::test]
    async fn test_unknown_account_number() {
        let (ledger, _, _) = ledger_with_two_accounts().await;
        let mut uow = ledger.begin().await.unwrap();

        let result = uow.lock_and_get_balance(AccountNumber(7)).await;
        assert!(matches!(result, Err(LedgerError::AccountNotFound(AccountNumber(7)))));
        let result = uow.resolve_id(AccountNumber(8)).await;
        assert!(matches!(result, Err(LedgerError::AccountNotFound(AccountNumber(8)))));
    }

    #[tokio::test]
    async fn test_lock_wait_times_out_as_conflict() {
        let ledger = InMemoryLedger::with_lock_timeout(Duration::from_millis(20));
        let company = ledger.create_company("Acme").await.unwrap();
        let a = ledger
            .open_account(company.id, Balance::new(dec!(1)))
            .await
            .unwrap();

        let mut first = ledger.begin().await.unwrap();
        first.lock_and_get_balance(a.number).await.unwrap();

        let mut second = ledger.begin().await.unwrap();
        let result = second.lock_and_get_balance(a.number).await;
        assert!(matches!(result, Err(ref e) if e.is_retryable()));
    }

    #[tokio::test]
    async fn test_commit_refuses_negative_balance() {
        let (ledger, _, b) = ledger_with_two_accounts().await;
        let mut uow = ledger.begin().await.unwrap();
        let (b_id, _) = uow.lock_and_get_balance(b.number).await.unwrap();
        uow.adjust_balance(b_id, dec!(-1)).await.unwrap();

        let result = uow.commit().await;
        assert!(matches!(result, Err(LedgerError::StoreError(_))));
        assert_eq!(ledger.total_balance().await, dec!(100));
    }
}
