//! CLI command handlers.

pub mod chat;
pub mod config;
pub mod session;
pub mod tools;
pub mod turn;
