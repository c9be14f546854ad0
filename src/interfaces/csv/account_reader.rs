use crate::domain::account::{AccountNumber, Balance, CompanyId};
use crate::domain::ports::Registry;
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;

/// One row of an account seed file: `company,account,balance`.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct AccountSeed {
    pub company: String,
    pub account: AccountNumber,
    // Exact decimal text, never through f64
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
}

/// Reads account seeds from a CSV source with a header row.
pub struct AccountReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> AccountReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(source);
        Self { reader }
    }

    pub fn seeds(self) -> impl Iterator<Item = Result<AccountSeed>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(LedgerError::from))
    }
}

/// Creates the seeded companies (by name, first appearance order) and accounts.
///
/// Returns the number of accounts inserted.
pub async fn seed_ledger<R, I>(ledger: &R, seeds: I) -> Result<usize>
where
    R: Registry + ?Sized,
    I: IntoIterator<Item = Result<AccountSeed>>,
{
    let mut companies: HashMap<String, CompanyId> = HashMap::new();
    for company in ledger.list_companies().await? {
        companies.entry(company.name).or_insert(company.id);
    }

    let mut inserted = 0;
    for seed in seeds {
        let seed = seed?;
        let opening = Balance::opening(seed.balance)?;
        let company = match companies.get(&seed.company) {
            Some(id) => *id,
            None => {
                let company = ledger.create_company(&seed.company).await?;
                companies.insert(company.name, company.id);
                company.id
            }
        };
        ledger.insert_account(company, seed.account, opening).await?;
        inserted += 1;
    }

    tracing::debug!(accounts = inserted, companies = companies.len(), "ledger seeded");
    Ok(inserted)
}
