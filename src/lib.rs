//! ruletrader: conditional order engine.
//!
//! Operators attach a condition written in a small expression language to
//! each order; the scheduler evaluates pending conditions against live data
//! and submits the orders whose conditions hold.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in [`ports`],
//! concrete implementations in [`adapters`].

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod logging;
pub mod ports;
