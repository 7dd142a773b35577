//! Port traits the engine depends on; adapters implement them.

pub mod config_port;
pub mod data_source_port;
pub mod exchange_port;
pub mod order_store_port;
