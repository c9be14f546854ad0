use crate::domain::account::{Account, AccountId, AccountNumber, Balance, Company, CompanyId};
use crate::domain::transaction::LedgerEntry;
use crate::error::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct AccountRow {
    account: AccountNumber,
    company: CompanyId,
    balance: Balance,
}

#[derive(Serialize)]
struct CompanyRow<'a> {
    company: CompanyId,
    name: &'a str,
}

#[derive(Serialize)]
struct EntryRow<'a> {
    id: i64,
    source: AccountId,
    target: AccountId,
    amount: Decimal,
    error: &'a str,
    created_at: String,
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Writes accounts as `account,company,balance`.
pub struct AccountWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> AccountWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_accounts<I>(&mut self, accounts: I) -> Result<()>
    where
        I: IntoIterator<Item = Account>,
    {
        let mut wrote_any = false;
        for account in accounts {
            self.writer.serialize(AccountRow {
                account: account.number,
                company: account.company_id,
                balance: account.balance,
            })?;
            wrote_any = true;
        }
        if !wrote_any {
            self.writer.write_record(["account", "company", "balance"])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes companies as `company,name`.
pub struct CompanyWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CompanyWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_companies(&mut self, companies: &[Company]) -> Result<()> {
        if companies.is_empty() {
            self.writer.write_record(["company", "name"])?;
        }
        for company in companies {
            self.writer.serialize(CompanyRow {
                company: company.id,
                name: &company.name,
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes the transaction log as `id,source,target,amount,error,created_at`.
pub struct EntryWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> EntryWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_entries(&mut self, entries: &[LedgerEntry]) -> Result<()> {
        if entries.is_empty() {
            self.writer
                .write_record(["id", "source", "target", "amount", "error", "created_at"])?;
        }
        for entry in entries {
            self.writer.serialize(EntryRow {
                id: entry.id,
                source: entry.source_account_id,
                target: entry.target_account_id,
                amount: entry.amount,
                error: entry.error.as_deref().unwrap_or(""),
                created_at: timestamp(&entry.created_at),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
