//! Lead and transaction lifecycle engine for multi-agency real-estate pipelines.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;
