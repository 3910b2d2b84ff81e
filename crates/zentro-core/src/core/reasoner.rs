//! The reasoning step behind the tool loop.
//!
//! The orchestrator only knows the `Reasoner` capability: given the turn so
//! far, propose tool calls or a final reply. Model clients plug in here; the
//! two shipped implementations are deterministic.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::agent::EventSender;
use crate::core::events::{AgentEvent, ToolOutput};
use crate::core::turn::{SessionKey, ToolInvocation, Turn};
use crate::error::ReasonerError;
use crate::tools::ToolDefinition;

/// Everything a reasoner may look at when proposing the next step.
#[derive(Debug, Clone, Copy)]
pub struct TurnContext<'a> {
    pub session_key: &'a SessionKey,
    /// Committed turns, oldest first.
    pub history: &'a [Turn],
    /// The user message being answered.
    pub message: &'a str,
    /// Tool calls already made in this turn, in execution order.
    pub invocations: &'a [ToolInvocation],
    pub tools: &'a [ToolDefinition],
    /// Tool rounds completed so far in this turn.
    pub iteration: usize,
}

/// A proposed tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    ToolCalls(Vec<ToolCall>),
    FinalReply(String),
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Proposes the next step. Implementations may stream reply text through
    /// `events` as `AssistantDelta`s.
    async fn propose(
        &self,
        ctx: &TurnContext<'_>,
        events: &EventSender,
    ) -> Result<Proposal, ReasonerError>;
}

/// Sends `text` as best-effort deltas, one line at a time.
fn stream_text(events: &EventSender, text: &str) {
    for line in text.split_inclusive('\n') {
        events.send_delta(AgentEvent::AssistantDelta {
            text: line.to_string(),
        });
    }
}

/// Turns `/call <tool> <json>` lines into tool calls.
///
/// After the calls ran, the reply summarises their outcomes. A message with
/// no directives gets a short usage reply listing the available tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectiveReasoner;

const DIRECTIVE_PREFIX: &str = "/call";

impl DirectiveReasoner {
    pub fn new() -> Self {
        Self
    }

    fn parse(message: &str) -> Result<Vec<ToolCall>, String> {
        let mut calls = Vec::new();
        for line in message.lines() {
            let Some(rest) = line.trim().strip_prefix(DIRECTIVE_PREFIX) else {
                continue;
            };
            if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
                continue;
            }
            let rest = rest.trim();
            let (name, raw_input) = rest
                .split_once(char::is_whitespace)
                .map_or((rest, ""), |(name, input)| (name, input.trim()));
            if name.is_empty() {
                return Err("`/call` needs a tool name".to_string());
            }
            let input = if raw_input.is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(raw_input)
                    .map_err(|e| format!("Could not read arguments for `{name}`: {e}"))?
            };
            calls.push(ToolCall::new(
                format!("call_{}", calls.len() + 1),
                name,
                input,
            ));
        }
        Ok(calls)
    }

    fn summarize(invocations: &[ToolInvocation]) -> String {
        let mut out = String::new();
        for inv in invocations {
            let line = match &inv.output {
                ToolOutput::Success { data } => format!("{} succeeded: {data}", inv.name),
                ToolOutput::Failure { error } => {
                    format!("{} failed ({}): {}", inv.name, error.code, error.message)
                }
                ToolOutput::Canceled { message } => format!("{} canceled: {message}", inv.name),
            };
            out.push_str(&line);
            out.push('\n');
        }
        out.truncate(out.trim_end().len());
        out
    }

    fn usage(tools: &[ToolDefinition]) -> String {
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        format!(
            "Send `/call <tool> <json>` to run a tool.\nAvailable tools: {}",
            names.join(", ")
        )
    }
}

#[async_trait]
impl Reasoner for DirectiveReasoner {
    async fn propose(
        &self,
        ctx: &TurnContext<'_>,
        events: &EventSender,
    ) -> Result<Proposal, ReasonerError> {
        let reply = if ctx.iteration > 0 {
            Self::summarize(ctx.invocations)
        } else {
            match Self::parse(ctx.message) {
                Ok(calls) if !calls.is_empty() => return Ok(Proposal::ToolCalls(calls)),
                Ok(_) => Self::usage(ctx.tools),
                Err(message) => message,
            }
        };
        stream_text(events, &reply);
        Ok(Proposal::FinalReply(reply))
    }
}

/// Replays a fixed list of proposals, one per tool round.
///
/// Every turn starts the script over. Past the end of the script the reply
/// is `re: <message>` unless a repeating proposal was configured.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReasoner {
    steps: Vec<Proposal>,
    repeat: Option<Proposal>,
    delay: Option<Duration>,
    failure: Option<String>,
}

impl ScriptedReasoner {
    pub fn new(steps: Vec<Proposal>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    /// Proposes `proposal` on every round, forever.
    pub fn repeating(proposal: Proposal) -> Self {
        Self {
            repeat: Some(proposal),
            ..Self::default()
        }
    }

    /// Fails every proposal with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    /// Sleeps before each proposal, standing in for model latency.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn propose(
        &self,
        ctx: &TurnContext<'_>,
        events: &EventSender,
    ) -> Result<Proposal, ReasonerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(ReasonerError(message.clone()));
        }

        let proposal = self
            .steps
            .get(ctx.iteration)
            .or(self.repeat.as_ref())
            .cloned()
            .unwrap_or_else(|| Proposal::FinalReply(format!("re: {}", ctx.message)));
        if let Proposal::FinalReply(text) = &proposal {
            stream_text(events, text);
        }
        Ok(proposal)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::agent::create_event_channel;
    use crate::tools::ToolEffect;

    fn ctx<'a>(
        key: &'a SessionKey,
        message: &'a str,
        invocations: &'a [ToolInvocation],
        iteration: usize,
    ) -> TurnContext<'a> {
        TurnContext {
            session_key: key,
            history: &[],
            message,
            invocations,
            tools: &[],
            iteration,
        }
    }

    #[test]
    fn test_parse_directives() {
        let calls = DirectiveReasoner::parse(
            "please\n/call task_create {\"title\": \"Fix bug\", \"project_id\": 7}\n/call sprint_list",
        )
        .unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "task_create");
        assert_eq!(calls[0].input, json!({"title": "Fix bug", "project_id": 7}));
        assert_eq!(calls[1].id, "call_2");
        assert_eq!(calls[1].input, json!({}));
    }

    #[test]
    fn test_parse_ignores_lookalikes_and_reports_bad_json() {
        assert!(DirectiveReasoner::parse("/caller x").unwrap().is_empty());
        let err = DirectiveReasoner::parse("/call task_get {oops").unwrap_err();
        assert!(err.contains("task_get"));
    }

    #[tokio::test]
    async fn test_directive_reasoner_summarises_after_tools() {
        let (tx, _rx) = create_event_channel();
        let events = EventSender::new(tx);
        let key = SessionKey::default();
        let invocations = vec![ToolInvocation::new(
            "call_1".into(),
            "task_create".into(),
            json!({}),
            ToolOutput::success(json!({"task_id": 42})),
            ToolEffect::Impure,
        )];

        let proposal = DirectiveReasoner
            .propose(&ctx(&key, "/call task_create {}", &invocations, 1), &events)
            .await
            .unwrap();
        assert_eq!(
            proposal,
            Proposal::FinalReply("task_create succeeded: {\"task_id\":42}".to_string())
        );
    }

    #[tokio::test]
    async fn test_scripted_reasoner_steps_then_echoes() {
        let (tx, _rx) = create_event_channel();
        let events = EventSender::new(tx);
        let key = SessionKey::default();
        let call = ToolCall::new("c1", "task_get", json!({"task_id": 40}));
        let reasoner = ScriptedReasoner::new(vec![Proposal::ToolCalls(vec![call.clone()])]);

        let first = reasoner.propose(&ctx(&key, "hi", &[], 0), &events).await.unwrap();
        assert_eq!(first, Proposal::ToolCalls(vec![call]));
        let second = reasoner.propose(&ctx(&key, "hi", &[], 1), &events).await.unwrap();
        assert_eq!(second, Proposal::FinalReply("re: hi".to_string()));
    }
}
