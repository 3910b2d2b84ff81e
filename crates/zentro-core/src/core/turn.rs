//! Session keys and the turn data model.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::events::ToolOutput;
use crate::domain::UserId;
use crate::tools::ToolEffect;

/// Key used when a caller does not name a session.
pub const DEFAULT_SESSION_KEY: &str = "api";

const MAX_SESSION_KEY_LEN: usize = 200;

/// Validated session identifier.
///
/// Keys name on-disk state, so path separators, `..`, NUL and control
/// characters are rejected. A `"{user_id}:{rest}"` key carries the acting
/// user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn parse(raw: &str) -> Result<Self, &'static str> {
        if raw.trim().is_empty() {
            return Err("key cannot be empty");
        }
        if raw.len() > MAX_SESSION_KEY_LEN {
            return Err("key is too long");
        }
        if raw.contains('/') || raw.contains('\\') || raw.contains("..") {
            return Err("key cannot contain path separators or '..'");
        }
        if raw.chars().any(char::is_control) {
            return Err("key cannot contain control characters");
        }
        Ok(Self(raw.to_string()))
    }

    /// A fresh `"{user_id}:{uuid}"` key.
    pub fn generate(user_id: UserId) -> Self {
        Self(format!("{user_id}:{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Acting user encoded in the key prefix, if any.
    pub fn user_id(&self) -> Option<UserId> {
        let (prefix, _) = self.0.split_once(':')?;
        prefix.parse().ok()
    }
}

impl Default for SessionKey {
    fn default() -> Self {
        Self(DEFAULT_SESSION_KEY.to_string())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        SessionKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// One recorded tool call. Immutable once appended to a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub output: ToolOutput,
    pub effect: ToolEffect,
    /// True when the call may have mutated domain data: an impure call that
    /// succeeded, or one that failed as `unavailable` (timed out or lost) and
    /// so may have been applied without a reply.
    pub side_effect: bool,
}

impl ToolInvocation {
    pub fn new(id: String, name: String, input: Value, output: ToolOutput, effect: ToolEffect) -> Self {
        let side_effect = effect == ToolEffect::Impure
            && (output.is_ok() || matches!(output.error_info(), Some(("unavailable", ..))));
        Self {
            id,
            name,
            input,
            output,
            effect,
            side_effect,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.output.is_ok()
    }
}

/// One request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub request: Message,
    #[serde(default)]
    pub tool_invocations: Vec<ToolInvocation>,
    pub reply: Message,
    pub started_at: String,
    pub completed_at: String,
}

impl Turn {
    /// Flattens the exchange into chat messages: the user message, one tool
    /// message per invocation, then the assistant reply.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.tool_invocations.len() + 2);
        messages.push(self.request.clone());
        messages.extend(self.tool_invocations.iter().map(|inv| Message {
            role: Role::Tool,
            content: format!("{} {}", inv.name, inv.output.to_json_string()),
        }));
        messages.push(self.reply.clone());
        messages
    }
}

/// Turn being built by the orchestrator. Never persisted as such.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub request: Message,
    pub tool_invocations: Vec<ToolInvocation>,
    pub started_at: String,
}

impl PendingTurn {
    pub fn new(content: &str) -> Self {
        Self {
            request: Message {
                role: Role::User,
                content: content.to_string(),
            },
            tool_invocations: Vec::new(),
            started_at: timestamp(),
        }
    }

    pub fn complete(self, reply: String) -> Turn {
        Turn {
            request: self.request,
            tool_invocations: self.tool_invocations,
            reply: Message {
                role: Role::Assistant,
                content: reply,
            },
            started_at: self.started_at,
            completed_at: timestamp(),
        }
    }
}

/// Current UTC time as RFC 3339 with second precision.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_session_key_user_prefix() {
        let key = SessionKey::parse("12:0f3c9a").unwrap();
        assert_eq!(key.user_id(), Some(12));
        assert_eq!(SessionKey::parse("api").unwrap().user_id(), None);
        assert_eq!(SessionKey::parse("bob:1").unwrap().user_id(), None);
    }

    #[test]
    fn test_session_key_rejects_unsafe_names() {
        for raw in ["", "  ", "../etc", "a/b", "a\\b", "a\0b", "line\nbreak"] {
            assert!(SessionKey::parse(raw).is_err(), "{raw:?}");
        }
        assert!(SessionKey::parse(&"k".repeat(201)).is_err());
    }

    #[test]
    fn test_generated_key_carries_user() {
        let key = SessionKey::generate(5);
        assert_eq!(key.user_id(), Some(5));
        assert_eq!(key.as_str().len(), 2 + 32);
    }

    #[test]
    fn test_side_effect_only_for_successful_impure_calls() {
        let ok = ToolOutput::success(json!({"task_id": 1}));
        let failed = ToolOutput::failure("not_found", "nope", None);
        let call = |output, effect| {
            ToolInvocation::new("c".into(), "t".into(), json!({}), output, effect).side_effect
        };
        assert!(call(ok.clone(), ToolEffect::Impure));
        assert!(!call(failed, ToolEffect::Impure));
        assert!(!call(ok, ToolEffect::Pure));
    }

    #[test]
    fn test_unanswered_impure_call_may_have_side_effect() {
        let timed_out = ToolOutput::failure("unavailable", "no response within 20ms", None);
        let call = |output, effect| {
            ToolInvocation::new("c".into(), "task_create".into(), json!({}), output, effect)
        };
        let impure = call(timed_out.clone(), ToolEffect::Impure);
        assert!(impure.side_effect);
        assert!(!impure.succeeded());
        assert!(!call(timed_out, ToolEffect::Pure).side_effect);
        assert!(!call(ToolOutput::canceled("skipped"), ToolEffect::Impure).side_effect);
    }

    #[test]
    fn test_turn_messages_order() {
        let mut pending = PendingTurn::new("hi");
        pending.tool_invocations.push(ToolInvocation::new(
            "c1".into(),
            "task_get".into(),
            json!({"task_id": 1}),
            ToolOutput::success(json!({})),
            ToolEffect::Pure,
        ));
        let turn = pending.complete("hello".to_string());
        let roles: Vec<Role> = turn.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Tool, Role::Assistant]);
    }
}
