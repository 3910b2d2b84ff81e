//! Run and stream command handlers.

use std::io::{self, Write};

use anyhow::Result;
use futures_util::StreamExt;
use zentro_core::core::events::ReplyChunk;
use zentro_core::core::session::AgentSession;

use crate::cli::interrupt::{self, InterruptedError};

pub async fn run(session: &AgentSession, key: &str, message: &str) -> Result<()> {
    let outcome = tokio::select! {
        result = session.run(key, message) => result?,
        () = interrupt::interrupted() => return Err(InterruptedError.into()),
    };
    println!("{}", outcome.reply);
    Ok(())
}

/// Streams one turn to the terminal. Ctrl+C drops the stream, which
/// cancels the turn.
pub async fn stream(session: &AgentSession, key: &str, message: &str) -> Result<()> {
    let mut replies = session.stream(key, message);
    let mut renderer = ReplyRenderer::default();
    loop {
        let item = tokio::select! {
            item = replies.next() => item,
            () = interrupt::interrupted() => {
                renderer.finish_line();
                return Err(InterruptedError.into());
            }
        };
        let Some(item) = item else {
            return Ok(());
        };
        renderer.render(&item?)?;
    }
}

/// Reply text on stdout, tool activity on stderr.
#[derive(Default)]
struct ReplyRenderer {
    streamed: String,
}

impl ReplyRenderer {
    fn render(&mut self, chunk: &ReplyChunk) -> Result<()> {
        match chunk {
            ReplyChunk::Token { text } => {
                self.streamed.push_str(text);
                print!("{text}");
                io::stdout().flush()?;
            }
            ReplyChunk::ToolStart { name, input } => {
                self.finish_line();
                eprintln!("→ {name} {input}");
            }
            ReplyChunk::ToolEnd { name, output } => match output.error_info() {
                None => eprintln!("← {name} ok"),
                Some((code, message, _)) => eprintln!("← {name} {code}: {message}"),
            },
            ReplyChunk::Completed { reply, .. } => {
                // Deltas are best-effort; fill in whatever did not arrive.
                if let Some(rest) = reply.strip_prefix(self.streamed.as_str()) {
                    print!("{rest}");
                } else {
                    self.finish_line();
                    print!("{reply}");
                }
                println!();
                self.streamed.clear();
            }
        }
        Ok(())
    }

    fn finish_line(&mut self) {
        if !self.streamed.is_empty() && !self.streamed.ends_with('\n') {
            println!();
        }
        self.streamed.clear();
    }
}
