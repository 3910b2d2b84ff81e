//! Tools command handler.

use zentro_core::core::session::AgentSession;
use zentro_core::tools::ToolEffect;

pub fn list(session: &AgentSession) {
    for descriptor in session.catalog().descriptors() {
        let effect = match descriptor.effect {
            ToolEffect::Pure => "read",
            ToolEffect::Impure => "write",
        };
        println!(
            "{:<20} {:<6} {}",
            descriptor.name(),
            effect,
            descriptor.definition.description
        );
    }
}
