//! Sprint tools.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{ToolContext, ToolDefinition, ToolDescriptor, ToolEffect, bind, encode, parse_input};
use crate::domain::{DomainGateway, ProjectId};
use crate::error::ToolCallError;

pub(super) fn descriptors(gateway: &Arc<dyn DomainGateway>) -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(list_definition(), ToolEffect::Pure, bind(gateway, list)),
        ToolDescriptor::new(
            get_active_definition(),
            ToolEffect::Pure,
            bind(gateway, get_active),
        ),
    ]
}

fn project_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "project_id": {"type": "integer"}
        },
        "required": ["project_id"],
        "additionalProperties": false
    })
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    project_id: ProjectId,
}

pub fn list_definition() -> ToolDefinition {
    ToolDefinition {
        name: "sprint_list".to_string(),
        description: "List the sprints of a project.".to_string(),
        input_schema: project_schema(),
    }
}

async fn list(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "sprint_list";
    let input: ProjectRef = parse_input(TOOL, input)?;
    let sprints = gateway
        .list_sprints(input.project_id)
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    Ok(json!({ "sprints": encode(TOOL, &sprints)? }))
}

pub fn get_active_definition() -> ToolDefinition {
    ToolDefinition {
        name: "sprint_get_active".to_string(),
        description: "Get the active sprint of a project, or null when none is active."
            .to_string(),
        input_schema: project_schema(),
    }
}

async fn get_active(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "sprint_get_active";
    let input: ProjectRef = parse_input(TOOL, input)?;
    let sprint = gateway
        .get_active_sprint(input.project_id)
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    Ok(json!({ "sprint": encode(TOOL, &sprint)? }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InMemoryGateway;

    #[tokio::test]
    async fn test_active_sprint_or_null() {
        let gateway: Arc<dyn DomainGateway> = Arc::new(InMemoryGateway::demo());
        let out = get_active(Arc::clone(&gateway), json!({"project_id": 7}), ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out["sprint"]["name"], "Sprint 14");

        let out = get_active(gateway, json!({"project_id": 8}), ToolContext::default())
            .await
            .unwrap();
        assert!(out["sprint"].is_null());
    }
}
