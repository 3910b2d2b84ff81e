//! Interactive chat on one session.

use std::io::{self, Write};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use zentro_core::core::session::AgentSession;
use zentro_core::error::AgentError;

use crate::cli::commands::turn;
use crate::cli::interrupt::{self, InterruptedError};

pub async fn run(session: &AgentSession, key: &str) -> Result<()> {
    eprintln!("Session {key}. Type /quit or press Ctrl+C at the prompt to leave.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("> ");
        io::stderr().flush()?;
        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            () = interrupt::interrupted() => {
                eprintln!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if matches!(message, "/quit" | "/exit") {
            break;
        }

        match turn::stream(session, key, message).await {
            Ok(()) => {}
            Err(e) if e.is::<InterruptedError>() => eprintln!("(interrupted, turn discarded)"),
            // The session is still usable after a failed turn.
            Err(e) if e.is::<AgentError>() => eprintln!("error: {e:#}"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
