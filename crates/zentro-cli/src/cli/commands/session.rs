//! Session command handlers.

use anyhow::Result;
use zentro_core::core::session::AgentSession;
use zentro_core::core::turn::SessionKey;

pub fn new_session(user_id: i64) {
    println!("{}", SessionKey::generate(user_id));
}

pub async fn history(session: &AgentSession, key: &str, json: bool) -> Result<()> {
    let turns = session.history(key).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&turns)?);
        return Ok(());
    }
    if turns.is_empty() {
        println!("No turns in session {key}");
        return Ok(());
    }

    if let Some(summary) = session.summary(key).await? {
        println!(
            "Session {} (v{}, saved {})",
            summary.session_key, summary.version, summary.saved_at
        );
        if let Some(title) = summary.title {
            println!("Title: {title}");
        }
    }
    for (i, turn) in turns.iter().enumerate() {
        println!();
        println!("### Turn {} ({})", i + 1, turn.started_at);
        for message in turn.messages() {
            println!("{}: {}", message.role, message.content);
        }
    }
    Ok(())
}
