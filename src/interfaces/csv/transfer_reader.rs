use crate::domain::account::AccountNumber;
use crate::domain::transaction::TransferRequest;
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use std::io::Read;
use std::str::FromStr;

const FIELDS: usize = 3;

/// Reads batch transfers from a headerless CSV source.
///
/// Every line is `source,target,amount`. Whitespace around fields is trimmed
/// and blank lines are skipped. A line that does not parse into a valid
/// [`TransferRequest`] yields `ParseError` carrying its 1-based line number.
pub struct TransferReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> TransferReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily parses the remaining lines.
    pub fn requests(self) -> impl Iterator<Item = Result<TransferRequest>> {
        self.reader
            .into_records()
            .filter(|record| match record {
                Ok(record) => !record.iter().all(str::is_empty),
                Err(_) => true,
            })
            .map(|record| {
                let record = record.map_err(|e| {
                    let line = e.position().map(|p| p.line()).unwrap_or(0);
                    LedgerError::ParseError {
                        line,
                        message: e.to_string(),
                    }
                })?;
                let line = record.position().map(|p| p.line()).unwrap_or(0);
                parse_record(&record).map_err(|message| LedgerError::ParseError { line, message })
            })
    }

    /// Parses the whole source, stopping at the first bad line.
    pub fn read_all(self) -> Result<Vec<TransferRequest>> {
        self.requests().collect()
    }
}

fn parse_record(record: &csv::StringRecord) -> std::result::Result<TransferRequest, String> {
    if record.len() != FIELDS {
        return Err(format!(
            "expected {} fields (source,target,amount), found {}",
            FIELDS,
            record.len()
        ));
    }

    let source = parse_account(&record[0], "source")?;
    let target = parse_account(&record[1], "target")?;
    let amount = Decimal::from_str(&record[2])
        .map_err(|e| format!("invalid amount {:?}: {}", &record[2], e))?;

    TransferRequest::new(source, target, amount).map_err(|e| e.to_string())
}

fn parse_account(field: &str, role: &str) -> std::result::Result<AccountNumber, String> {
    field
        .parse::<i64>()
        .map(AccountNumber)
        .map_err(|e| format!("invalid {} account number {:?}: {}", role, field, e))
}
