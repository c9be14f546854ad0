//! Domain types and the ports the engine consumes.

pub mod account;
pub mod ports;
pub mod transaction;
