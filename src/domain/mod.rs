//! Core domain types and logic.

pub mod builtins;
pub mod condition;
pub mod config_validation;
pub mod error;
pub mod exchange_hub;
pub mod expr;
pub mod expr_eval;
pub mod expr_parser;
pub mod order;
pub mod registry;
pub mod scheduler;
pub mod token;
pub mod value;
