//! Epic tools.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{ToolContext, ToolDefinition, ToolDescriptor, ToolEffect, bind, encode, parse_input};
use crate::domain::{DomainGateway, EpicId, ProjectId};
use crate::error::ToolCallError;

pub(super) fn descriptors(gateway: &Arc<dyn DomainGateway>) -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(list_definition(), ToolEffect::Pure, bind(gateway, list)),
        ToolDescriptor::new(get_definition(), ToolEffect::Pure, bind(gateway, get)),
    ]
}

pub fn list_definition() -> ToolDefinition {
    ToolDefinition {
        name: "epic_list".to_string(),
        description: "List the epics of a project.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "project_id": {"type": "integer"}
            },
            "required": ["project_id"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
struct ListInput {
    project_id: ProjectId,
}

async fn list(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "epic_list";
    let input: ListInput = parse_input(TOOL, input)?;
    let epics = gateway
        .list_epics(input.project_id)
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    Ok(json!({ "epics": encode(TOOL, &epics)? }))
}

pub fn get_definition() -> ToolDefinition {
    ToolDefinition {
        name: "epic_get".to_string(),
        description: "Get an epic by id.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "epic_id": {"type": "integer"}
            },
            "required": ["epic_id"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
struct GetInput {
    epic_id: EpicId,
}

async fn get(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "epic_get";
    let input: GetInput = parse_input(TOOL, input)?;
    let epic = gateway
        .get_epic(input.epic_id)
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    encode(TOOL, &epic)
}
