//! PostgreSQL-backed ledger.
//!
//! Row locking is `SELECT ... FOR UPDATE` inside a `SERIALIZABLE` transaction.
//! Serialization failures and deadlocks come back as `LedgerError::Conflict` and
//! are retried by the engine.

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
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;

/// PostgreSQL ledger. `Clone` shares the connection pool.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedger {
    /// Opens a connection pool sized by `config`.
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout())
            .connect(url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool established"
        );
        Ok(Self::from_pool(pool, config.lock_timeout()))
    }

    pub fn from_pool(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the schema migrations shipped with the crate.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::StoreError(format!("migration failed: {}", e)))?;
        tracing::info!("database schema is up to date");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: AccountId(row.try_get("account_id")?),
        company_id: CompanyId(row.try_get("company_id")?),
        number: AccountNumber(row.try_get("account_number")?),
        balance: Balance::new(row.try_get("account_balance")?),
    })
}

fn company_from_row(row: &PgRow) -> Result<Company> {
    Ok(Company {
        id: CompanyId(row.try_get("company_id")?),
        name: row.try_get("company_name")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.try_get("tx_id")?,
        source_account_id: AccountId(row.try_get("source_account_id")?),
        target_account_id: AccountId(row.try_get("target_account_id")?),
        amount: row.try_get("transfer_amount")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn begin(&self) -> Result<UnitOfWorkBox> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        // SET does not take bind parameters
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

/// A `SERIALIZABLE` PostgreSQL transaction. Dropping it rolls back.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AccountStore for PgUnitOfWork {
    async fn lock_and_get_balance(&mut self, number: AccountNumber) -> Result<(AccountId, Balance)> {
        let row = sqlx::query(
            r#"SELECT account_id, account_balance
                 FROM account
                WHERE account_number = $1
                  FOR UPDATE"#,
        )
        .bind(number.0)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or(LedgerError::AccountNotFound(number))?;

        Ok((
            AccountId(row.try_get("account_id")?),
            Balance::new(row.try_get("account_balance")?),
        ))
    }

    async fn resolve_id(&mut self, number: AccountNumber) -> Result<AccountId> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT account_id FROM account WHERE account_number = $1",
        )
        .bind(number.0)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or(LedgerError::AccountNotFound(number))?;

        Ok(AccountId(id))
    }

    async fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE account
                  SET account_balance = account_balance + $1
                WHERE account_id = $2"#,
        )
        .bind(delta)
        .bind(id.0)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::StoreError(format!(
                "balance update matched {} rows for account id {}",
                result.rows_affected(),
                id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionLog for PgUnitOfWork {
    async fn append(&mut self, entry: NewLedgerEntry) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO transaction
                   (source_account_id, target_account_id, transfer_amount, error)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(entry.source_account_id.0)
        .bind(entry.target_account_id.0)
        .bind(entry.amount.value())
        .bind(entry.error)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Registry for PgLedger {
    async fn create_company(&self, name: &str) -> Result<Company> {
        let row = sqlx::query(
            "INSERT INTO company (company_name) VALUES ($1) RETURNING company_id, company_name",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        company_from_row(&row)
    }

    async fn list_companies(&self) -> Result<Vec<Company>> {
        let rows = sqlx::query("SELECT company_id, company_name FROM company ORDER BY company_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(company_from_row).collect()
    }

    async fn get_company(&self, id: CompanyId) -> Result<Option<Company>> {
        let row = sqlx::query("SELECT company_id, company_name FROM company WHERE company_id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(company_from_row).transpose()
    }

    async fn open_account(&self, company: CompanyId, opening: Balance) -> Result<Account> {
        let row = sqlx::query(
            r#"INSERT INTO account (company_id, account_balance)
               SELECT $1, $2
                WHERE EXISTS (SELECT 1 FROM company WHERE company_id = $1)
               RETURNING account_id, company_id, account_number, account_balance"#,
        )
        .bind(company.0)
        .bind(opening.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(LedgerError::CompanyNotFound(company))?;
        account_from_row(&row)
    }

    async fn insert_account(
        &self,
        company: CompanyId,
        number: AccountNumber,
        opening: Balance,
    ) -> Result<Account> {
        let row = sqlx::query(
            r#"INSERT INTO account (company_id, account_number, account_balance)
               SELECT $1, $2, $3
                WHERE EXISTS (SELECT 1 FROM company WHERE company_id = $1)
               RETURNING account_id, company_id, account_number, account_balance"#,
        )
        .bind(company.0)
        .bind(number.0)
        .bind(opening.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match &e {
            // unique_violation on account_number
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                LedgerError::ValidationError(format!("account number {} already exists", number))
            }
            _ => LedgerError::from(e),
        })?
        .ok_or(LedgerError::CompanyNotFound(company))?;
        account_from_row(&row)
    }

    async fn list_accounts(&self, company: CompanyId) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            r#"SELECT account_id, company_id, account_number, account_balance
                 FROM account
                WHERE company_id = $1
                ORDER BY account_id"#,
        )
        .bind(company.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"SELECT account_id, company_id, account_number, account_balance
                 FROM account
                WHERE account_id = $1"#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_account(&self, number: AccountNumber) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"SELECT account_id, company_id, account_number, account_balance
                 FROM account
                WHERE account_number = $1"#,
        )
        .bind(number.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"SELECT tx_id, source_account_id, target_account_id, transfer_amount,
                      error, created_at
                 FROM transaction
                ORDER BY tx_id"#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }
}
