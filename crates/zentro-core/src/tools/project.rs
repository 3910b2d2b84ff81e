//! Project tools: create, get, list, members.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    ToolContext, ToolDefinition, ToolDescriptor, ToolEffect, bind, encode, list_limit, parse_input,
};
use crate::domain::{DomainGateway, NewProject, ProjectId, UserId};
use crate::error::ToolCallError;

pub(super) fn descriptors(gateway: &Arc<dyn DomainGateway>) -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(create_definition(), ToolEffect::Impure, bind(gateway, create)),
        ToolDescriptor::new(get_definition(), ToolEffect::Pure, bind(gateway, get)),
        ToolDescriptor::new(list_definition(), ToolEffect::Pure, bind(gateway, list)),
        ToolDescriptor::new(
            members_definition(),
            ToolEffect::Pure,
            bind(gateway, members),
        ),
    ]
}

pub fn create_definition() -> ToolDefinition {
    ToolDefinition {
        name: "project_create".to_string(),
        description: "Create a new project. The current user becomes its owner unless creator_id is given.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "minLength": 1, "maxLength": 200},
                "key": {"type": "string", "maxLength": 20, "description": "Short unique key, e.g. ZEN"},
                "description": {"type": "string"},
                "creator_id": {"type": "integer"}
            },
            "required": ["name"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
struct CreateInput {
    name: String,
    key: Option<String>,
    description: Option<String>,
    creator_id: Option<UserId>,
}

async fn create(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "project_create";
    let input: CreateInput = parse_input(TOOL, input)?;
    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(ToolCallError::invalid_input(TOOL, "name cannot be empty"));
    }

    let project = gateway
        .create_project(NewProject {
            name,
            key: input.key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty()),
            description: input.description,
            creator_id: input.creator_id.or(ctx.user_id),
        })
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;

    Ok(json!({
        "project_id": project.id,
        "name": project.name,
        "key": project.key,
    }))
}

pub fn get_definition() -> ToolDefinition {
    ToolDefinition {
        name: "project_get".to_string(),
        description: "Get a project by id.".to_string(),
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
struct ProjectRef {
    project_id: ProjectId,
}

async fn get(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "project_get";
    let input: ProjectRef = parse_input(TOOL, input)?;
    let project = gateway
        .get_project(input.project_id)
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    encode(TOOL, &project)
}

pub fn list_definition() -> ToolDefinition {
    ToolDefinition {
        name: "project_list".to_string(),
        description: "List projects. With user_id, only projects that user created or belongs to."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "integer"},
                "limit": {"type": "integer", "minimum": 1}
            },
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
struct ListInput {
    user_id: Option<UserId>,
    limit: Option<usize>,
}

async fn list(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "project_list";
    let input: ListInput = parse_input(TOOL, input)?;
    let projects = gateway
        .list_projects(input.user_id, list_limit(input.limit))
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    Ok(json!({ "projects": encode(TOOL, &projects)? }))
}

pub fn members_definition() -> ToolDefinition {
    ToolDefinition {
        name: "project_members_list".to_string(),
        description: "List the members of a project with their roles.".to_string(),
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

async fn members(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "project_members_list";
    let input: ProjectRef = parse_input(TOOL, input)?;
    let members = gateway
        .list_project_members(input.project_id)
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    Ok(json!({ "members": encode(TOOL, &members)? }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InMemoryGateway;

    fn gateway() -> Arc<dyn DomainGateway> {
        Arc::new(InMemoryGateway::demo())
    }

    #[tokio::test]
    async fn test_create_defaults_creator_to_current_user() {
        let gateway = gateway();
        let out = create(
            Arc::clone(&gateway),
            json!({"name": "Infra", "key": "INF"}),
            ToolContext::new(Some(3)),
        )
        .await
        .unwrap();
        assert_eq!(out["project_id"], 9);

        let project = gateway.get_project(9).await.unwrap();
        assert_eq!(project.creator_id, Some(3));
    }

    #[tokio::test]
    async fn test_create_rejects_blank_name() {
        let err = create(gateway(), json!({"name": "   "}), ToolContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[tokio::test]
    async fn test_members_list() {
        let out = members(gateway(), json!({"project_id": 8}), ToolContext::default())
            .await
            .unwrap();
        let roles: Vec<_> = out["members"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(roles, vec!["owner", "viewer"]);
    }
}
