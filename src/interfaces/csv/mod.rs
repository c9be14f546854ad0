//! CSV transport: batch files in, account listings and the transaction log out.

pub mod account_reader;
pub mod transfer_reader;
pub mod writer;
