//! Company ledger with an atomic transfer engine.
//!
//! The crate is laid out in layers:
//!
//! - [`domain`] - accounts, ledger entries, transfer requests and the store ports
//! - [`application`] - the transfer engine and the batch coordinator
//! - [`infrastructure`] - in-memory and PostgreSQL implementations of the ports
//! - [`interfaces`] - CSV transport for batches and account listings

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
pub mod logging;

pub use application::engine::TransferEngine;
pub use error::{BatchFailure, ErrorKind, LedgerError, Result};
