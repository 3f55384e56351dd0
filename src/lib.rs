//! Papertrade Simulation Library
//!
//! Live tick aggregation, pluggable strategies, a virtual position ledger and an
//! authenticated event stream with replay for reconnecting clients.

pub mod application;
pub mod auth;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod task_runner;
