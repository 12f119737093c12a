//! Vendor capability implementations for the ledgersync engine.

#[cfg(feature = "quickbooks")]
pub mod quickbooks;
