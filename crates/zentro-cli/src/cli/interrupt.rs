//! Ctrl+C handling.
//!
//! The handler only wakes whoever is waiting; the command decides whether
//! that cancels a turn or leaves the chat loop.

use std::fmt;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use tokio::sync::Notify;

static INTERRUPT_NOTIFY: OnceLock<Notify> = OnceLock::new();

#[derive(Debug)]
pub struct InterruptedError;

impl fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for InterruptedError {}

fn notify() -> &'static Notify {
    INTERRUPT_NOTIFY.get_or_init(Notify::new)
}

pub fn init() -> Result<()> {
    ctrlc::set_handler(|| notify().notify_waiters()).context("install Ctrl+C handler")
}

/// Resolves on the next Ctrl+C.
pub async fn interrupted() {
    notify().notified().await;
}
