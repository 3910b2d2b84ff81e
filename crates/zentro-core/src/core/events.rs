//! Agent event types for streaming.
//!
//! `AgentEvent` is the orchestrator's internal event contract; `ReplyChunk`
//! is the narrower view handed to `stream` callers. Both are serializable so
//! a web layer can forward them as-is.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolCallError;

/// Events emitted by the orchestrator during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Turn has started processing (prior state resolved).
    TurnStarted { session_key: String },

    /// Incremental text chunk from the reasoner.
    AssistantDelta { text: String },

    /// A tool invocation has started execution.
    ToolStarted {
        id: String,
        name: String,
        input: Value,
    },

    /// A tool invocation has completed.
    ToolCompleted {
        id: String,
        name: String,
        result: ToolOutput,
    },

    /// Complete reply text.
    AssistantCompleted { text: String },

    /// An error aborted the turn.
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    /// The turn was cancelled and discarded.
    Interrupted,

    /// Turn committed at `version`.
    TurnCompleted { reply: String, version: u64 },
}

/// Error categories for `AgentEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Convergence,
    Persistence,
    Reasoner,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Convergence => write!(f, "convergence"),
            ErrorKind::Persistence => write!(f, "persistence"),
            ErrorKind::Reasoner => write!(f, "reasoner"),
        }
    }
}

/// One piece of a streamed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyChunk {
    Token { text: String },
    ToolStart { name: String, input: Value },
    ToolEnd { name: String, output: ToolOutput },
    /// Final chunk: the committed reply and the checkpoint version it was saved at.
    Completed { reply: String, version: u64 },
}

impl ReplyChunk {
    /// Maps an orchestrator event to the caller-facing chunk, if it has one.
    pub fn from_event(event: &AgentEvent) -> Option<Self> {
        match event {
            AgentEvent::AssistantDelta { text } => Some(ReplyChunk::Token { text: text.clone() }),
            AgentEvent::ToolStarted { name, input, .. } => Some(ReplyChunk::ToolStart {
                name: name.clone(),
                input: input.clone(),
            }),
            AgentEvent::ToolCompleted { name, result, .. } => Some(ReplyChunk::ToolEnd {
                name: name.clone(),
                output: result.clone(),
            }),
            AgentEvent::TurnCompleted { reply, version } => Some(ReplyChunk::Completed {
                reply: reply.clone(),
                version: *version,
            }),
            AgentEvent::TurnStarted { .. }
            | AgentEvent::AssistantCompleted { .. }
            | AgentEvent::Error { .. }
            | AgentEvent::Interrupted => None,
        }
    }
}

/// Structured envelope for recorded tool outcomes.
///
/// - Success: `{"ok": true, "data": { ... }}`
/// - Failure: `{"ok": false, "error": { "code": "...", "message": "...", "details": "..." (optional) }}`
/// - Canceled: serializes as failure with `code: "canceled"` but deserializes back to Canceled
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Success { data: Value },
    Failure { error: ToolError },
    /// Execution was abandoned because the turn was cancelled.
    Canceled { message: String },
}

/// Special error code that indicates a canceled operation.
const CANCELED_ERROR_CODE: &str = "canceled";

impl Serialize for ToolOutput {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("ToolOutput", 2)?;
        match self {
            ToolOutput::Success { data } => {
                state.serialize_field("ok", &true)?;
                state.serialize_field("data", data)?;
            }
            ToolOutput::Failure { error } => {
                state.serialize_field("ok", &false)?;
                state.serialize_field("error", error)?;
            }
            ToolOutput::Canceled { message } => {
                let error = ToolError {
                    code: CANCELED_ERROR_CODE.to_string(),
                    message: message.clone(),
                    details: None,
                };
                state.serialize_field("ok", &false)?;
                state.serialize_field("error", &error)?;
            }
        }
        state.end()
    }
}

impl<'de> Deserialize<'de> for ToolOutput {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawToolOutput {
            ok: bool,
            #[serde(default)]
            data: Option<Value>,
            #[serde(default)]
            error: Option<ToolError>,
        }

        let raw = RawToolOutput::deserialize(deserializer)?;

        if raw.ok {
            return Ok(ToolOutput::Success {
                data: raw.data.unwrap_or(Value::Null),
            });
        }
        match raw.error {
            Some(error) if error.code == CANCELED_ERROR_CODE => Ok(ToolOutput::Canceled {
                message: error.message,
            }),
            Some(error) => Ok(ToolOutput::Failure { error }),
            None => Ok(ToolOutput::Failure {
                error: ToolError {
                    code: "unknown".to_string(),
                    message: "Unknown error".to_string(),
                    details: None,
                },
            }),
        }
    }
}

impl ToolOutput {
    pub fn success(data: Value) -> Self {
        ToolOutput::Success { data }
    }

    pub fn failure(
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<String>,
    ) -> Self {
        ToolOutput::Failure {
            error: ToolError {
                code: code.into(),
                message: message.into(),
                details,
            },
        }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        ToolOutput::Canceled {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutput::Success { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            ToolOutput::Success { data } => Some(data),
            ToolOutput::Failure { .. } | ToolOutput::Canceled { .. } => None,
        }
    }

    /// Returns the error code, message and details if this is a failure.
    pub fn error_info(&self) -> Option<(&str, &str, Option<&str>)> {
        match self {
            ToolOutput::Failure { error } => Some((
                error.code.as_str(),
                error.message.as_str(),
                error.details.as_deref(),
            )),
            ToolOutput::Success { .. } | ToolOutput::Canceled { .. } => None,
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"ok":false,"error":{"code":"serialize_error","message":"Failed to serialize tool output"}}"#.to_string()
        })
    }
}

impl From<Result<Value, ToolCallError>> for ToolOutput {
    fn from(result: Result<Value, ToolCallError>) -> Self {
        match result {
            Ok(data) => ToolOutput::success(data),
            Err(err) => ToolOutput::failure(err.code(), err.to_string(), err.details()),
        }
    }
}

/// Error details for a failed tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::DomainError;

    #[test]
    fn test_tool_output_failure_roundtrip() {
        let output = ToolOutput::failure("not_found", "Task 9 not found", Some("hint".to_string()));
        let parsed: ToolOutput = serde_json::from_str(&output.to_json_string()).unwrap();

        let (code, message, details) = parsed.error_info().unwrap();
        assert_eq!(code, "not_found");
        assert_eq!(message, "Task 9 not found");
        assert_eq!(details, Some("hint"));
    }

    #[test]
    fn test_tool_output_canceled_roundtrip() {
        let json_str = ToolOutput::canceled("Turn cancelled").to_json_string();
        assert!(json_str.contains(r#""code":"canceled""#));

        let parsed: ToolOutput = serde_json::from_str(&json_str).unwrap();
        assert!(matches!(parsed, ToolOutput::Canceled { message } if message == "Turn cancelled"));
    }

    #[test]
    fn test_tool_output_from_call_error_keeps_code() {
        let err = ToolCallError::domain("task_get", DomainError::not_found("Task 9 not found"));
        let output = ToolOutput::from(Err(err));
        assert_eq!(output.error_info().unwrap().0, "not_found");
    }

    #[test]
    fn test_event_tagging() {
        let event = AgentEvent::TurnCompleted {
            reply: "done".to_string(),
            version: 3,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "turn_completed", "reply": "done", "version": 3}));
    }

    #[test]
    fn test_reply_chunk_mapping_skips_internal_events() {
        assert!(ReplyChunk::from_event(&AgentEvent::Interrupted).is_none());
        let chunk = ReplyChunk::from_event(&AgentEvent::ToolStarted {
            id: "call_1".to_string(),
            name: "task_get".to_string(),
            input: json!({"task_id": 1}),
        })
        .unwrap();
        assert_eq!(
            serde_json::to_value(chunk).unwrap(),
            json!({"type": "tool_start", "name": "task_get", "input": {"task_id": 1}})
        );
    }
}
