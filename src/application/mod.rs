//! Application layer: the transfer engine and the batch coordinator.
//!
//! [`engine::TransferEngine`] is the entry point for moving funds. It owns the
//! injected store handle and delegates atomicity and isolation to the store's
//! units of work; batches are applied through the same posting step inside one
//! unit of work.

pub mod batch;
pub mod engine;
