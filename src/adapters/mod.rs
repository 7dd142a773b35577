//! Concrete adapter implementations for ports.

pub mod file_config_adapter;
pub mod paper_exchange;
pub mod snapshot_source;
#[cfg(feature = "sqlite")]
pub mod sqlite_adapter;
