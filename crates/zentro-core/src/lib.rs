//! Zentro agent core (tools, checkpoints, orchestration, config).

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod tools;
