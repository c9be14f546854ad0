use crate::domain::account::{AccountNumber, CompanyId};
use miette::Diagnostic;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Coarse classification of a [`LedgerError`].
///
/// Callers branch on this instead of matching individual variants: a front-end
/// presents `InsufficientFunds` as a conflict, `Store` as a server fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InsufficientFunds,
    Store,
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::Store => "store",
            ErrorKind::Validation => "validation",
        }
    }

    /// Process exit code used by the command-line front-end.
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorKind::Store => 1,
            ErrorKind::Validation => 2,
            ErrorKind::InsufficientFunds => 3,
            ErrorKind::NotFound => 4,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Diagnostic, Debug)]
pub enum LedgerError {
    // === Lookup ===
    #[error("account {0} not found")]
    #[diagnostic(code(minibank::account_not_found))]
    AccountNotFound(AccountNumber),

    #[error("company {0} not found")]
    #[diagnostic(code(minibank::company_not_found))]
    CompanyNotFound(CompanyId),

    // === Business rejection ===
    #[error("insufficient balance in account {account}: available {available}, requested {requested}")]
    #[diagnostic(
        code(minibank::insufficient_funds),
        help("top up the source account or lower the amount")
    )]
    InsufficientFunds {
        account: AccountNumber,
        available: Decimal,
        requested: Decimal,
    },

    // === Validation ===
    #[error("validation error: {0}")]
    #[diagnostic(code(minibank::validation))]
    ValidationError(String),

    #[error("source and target account cannot be the same ({0})")]
    #[diagnostic(code(minibank::same_account))]
    SameAccount(AccountNumber),

    #[error("parse error on line {line}: {message}")]
    #[diagnostic(code(minibank::parse))]
    ParseError { line: u64, message: String },

    #[error("CSV error: {0}")]
    #[diagnostic(code(minibank::csv))]
    CsvError(#[from] csv::Error),

    #[error("configuration error: {0}")]
    #[diagnostic(code(minibank::config))]
    ConfigError(String),

    // === Store ===
    #[error("transaction conflict: {0}")]
    #[diagnostic(
        code(minibank::conflict),
        help("the whole operation was rolled back and can be retried")
    )]
    Conflict(String),

    /// The deadline expired before commit; nothing was applied.
    #[error("operation timed out after {0:?}")]
    #[diagnostic(code(minibank::timeout))]
    Timeout(Duration),

    #[error("store error: {0}")]
    #[diagnostic(code(minibank::store))]
    StoreError(String),

    #[error("IO error: {0}")]
    #[diagnostic(code(minibank::io))]
    IoError(#[from] std::io::Error),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::AccountNotFound(_) | LedgerError::CompanyNotFound(_) => {
                ErrorKind::NotFound
            }
            LedgerError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            LedgerError::ValidationError(_)
            | LedgerError::SameAccount(_)
            | LedgerError::ParseError { .. }
            | LedgerError::CsvError(_)
            | LedgerError::ConfigError(_) => ErrorKind::Validation,
            LedgerError::Conflict(_)
            | LedgerError::Timeout(_)
            | LedgerError::StoreError(_)
            | LedgerError::IoError(_) => ErrorKind::Store,
        }
    }

    /// Whether re-running the whole unit of work from scratch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}

#[cfg(feature = "storage-postgres")]
impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            // serialization_failure, deadlock_detected, lock_not_available
            if let Some("40001" | "40P01" | "55P03") = db.code().as_deref() {
                return LedgerError::Conflict(db.message().to_string());
            }
        }
        LedgerError::StoreError(e.to_string())
    }
}

/// A batch aborted before commit. Nothing from the batch was persisted.
#[derive(Error, Debug)]
pub struct BatchFailure {
    /// 0-based index of the offending request, `None` when the failure happened
    /// outside any single row (opening or committing the unit, batch timeout).
    pub row: Option<usize>,
    #[source]
    pub cause: LedgerError,
}

impl BatchFailure {
    pub fn at_row(row: usize, cause: LedgerError) -> Self {
        Self {
            row: Some(row),
            cause,
        }
    }

    pub fn unattributed(cause: LedgerError) -> Self {
        Self { row: None, cause }
    }

    pub fn kind(&self) -> ErrorKind {
        self.cause.kind()
    }

    /// 1-based line number of the offending request in its input file.
    pub fn line(&self) -> Option<usize> {
        self.row.map(|row| row + 1)
    }

    pub fn is_retryable(&self) -> bool {
        self.cause.is_retryable()
    }

    pub fn report(&self) -> BatchFailureReport {
        BatchFailureReport {
            row: self.row,
            line: self.line(),
            kind: self.kind(),
            error: self.cause.to_string(),
        }
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row {
            Some(row) => write!(f, "batch aborted at row {}: {}", row, self.cause),
            None => write!(f, "batch aborted: {}", self.cause),
        }
    }
}

/// Serializable view of a [`BatchFailure`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailureReport {
    pub row: Option<usize>,
    pub line: Option<usize>,
    pub kind: ErrorKind,
    pub error: String,
}
