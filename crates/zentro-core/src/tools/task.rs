//! Task tools.
//!
//! Mutating tools (`task_create`, `task_update`, `task_delete`,
//! `task_assign`, `task_unassign`) are classified impure; the rest are pure.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{
    ToolContext, ToolDefinition, ToolDescriptor, ToolEffect, bind, encode, list_limit, parse_input,
};
use crate::domain::{
    DomainGateway, EpicId, NewTask, Priority, ProjectId, SprintId, TaskId, TaskPatch, TaskStatus,
    UserId,
};
use crate::error::{DomainError, ToolCallError};

pub(super) fn descriptors(gateway: &Arc<dyn DomainGateway>) -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(create_definition(), ToolEffect::Impure, bind(gateway, create)),
        ToolDescriptor::new(get_definition(), ToolEffect::Pure, bind(gateway, get)),
        ToolDescriptor::new(update_definition(), ToolEffect::Impure, bind(gateway, update)),
        ToolDescriptor::new(delete_definition(), ToolEffect::Impure, bind(gateway, delete)),
        ToolDescriptor::new(assign_definition(), ToolEffect::Impure, bind(gateway, assign)),
        ToolDescriptor::new(
            unassign_definition(),
            ToolEffect::Impure,
            bind(gateway, unassign),
        ),
        ToolDescriptor::new(list_my_definition(), ToolEffect::Pure, bind(gateway, list_my)),
        ToolDescriptor::new(search_definition(), ToolEffect::Pure, bind(gateway, search)),
        ToolDescriptor::new(stats_definition(), ToolEffect::Pure, bind(gateway, stats)),
    ]
}

fn status_schema() -> Value {
    let names: Vec<&str> = TaskStatus::ALL.iter().map(|s| s.as_str()).collect();
    json!({"type": "string", "enum": names})
}

fn priority_schema() -> Value {
    let names: Vec<&str> = Priority::ALL.iter().map(|p| p.as_str()).collect();
    json!({"type": "string", "enum": names})
}

fn task_ref_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "task_id": {"type": "integer"}
        },
        "required": ["task_id"],
        "additionalProperties": false
    })
}

fn assignment_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "task_id": {"type": "integer"},
            "user_id": {"type": "integer"}
        },
        "required": ["task_id", "user_id"],
        "additionalProperties": false
    })
}

// ============================================================================
// task_create
// ============================================================================

pub fn create_definition() -> ToolDefinition {
    ToolDefinition {
        name: "task_create".to_string(),
        description: "Create a task in a project. The current user is recorded as reporter. \
                      Status defaults to todo, priority to medium."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "project_id": {"type": "integer"},
                "title": {"type": "string", "minLength": 1, "maxLength": 300},
                "description": {"type": "string"},
                "status": status_schema(),
                "priority": priority_schema(),
                "epic_id": {"type": "integer"},
                "sprint_id": {"type": "integer"}
            },
            "required": ["project_id", "title"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
struct CreateInput {
    project_id: ProjectId,
    title: String,
    description: Option<String>,
    status: Option<TaskStatus>,
    priority: Option<Priority>,
    epic_id: Option<EpicId>,
    sprint_id: Option<SprintId>,
}

async fn create(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "task_create";
    let input: CreateInput = parse_input(TOOL, input)?;
    let title = input.title.trim().to_string();
    if title.is_empty() {
        return Err(ToolCallError::invalid_input(TOOL, "title cannot be empty"));
    }

    let task = gateway
        .create_task(NewTask {
            project_id: input.project_id,
            title,
            description: input.description,
            status: input.status.unwrap_or(TaskStatus::Todo),
            priority: input.priority.unwrap_or_default(),
            epic_id: input.epic_id,
            sprint_id: input.sprint_id,
            reporter_id: ctx.user_id,
        })
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;

    Ok(json!({ "task_id": task.id }))
}

// ============================================================================
// task_get / task_delete
// ============================================================================

pub fn get_definition() -> ToolDefinition {
    ToolDefinition {
        name: "task_get".to_string(),
        description: "Get a task by id, including status, priority and assignees.".to_string(),
        input_schema: task_ref_schema(),
    }
}

#[derive(Debug, Deserialize)]
struct TaskRef {
    task_id: TaskId,
}

async fn get(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "task_get";
    let input: TaskRef = parse_input(TOOL, input)?;
    let task = gateway
        .get_task(input.task_id)
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    encode(TOOL, &task)
}

pub fn delete_definition() -> ToolDefinition {
    ToolDefinition {
        name: "task_delete".to_string(),
        description: "Delete a task permanently.".to_string(),
        input_schema: task_ref_schema(),
    }
}

async fn delete(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "task_delete";
    let input: TaskRef = parse_input(TOOL, input)?;
    gateway
        .delete_task(input.task_id)
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    Ok(json!({ "task_id": input.task_id, "deleted": true }))
}

// ============================================================================
// task_update
// ============================================================================

pub fn update_definition() -> ToolDefinition {
    ToolDefinition {
        name: "task_update".to_string(),
        description: "Update fields of a task. Only the given fields change.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "task_id": {"type": "integer"},
                "title": {"type": "string", "minLength": 1, "maxLength": 300},
                "description": {"type": "string"},
                "status": status_schema(),
                "priority": priority_schema(),
                "epic_id": {"type": "integer"},
                "sprint_id": {"type": "integer"},
                "estimate": {"type": "number", "minimum": 0},
                "due_date": {"type": "string", "description": "YYYY-MM-DD"}
            },
            "required": ["task_id"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateInput {
    task_id: TaskId,
    #[serde(flatten)]
    patch: TaskPatch,
}

async fn update(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "task_update";
    let input: UpdateInput = parse_input(TOOL, input)?;
    if input.patch.is_empty() {
        return Err(ToolCallError::invalid_input(TOOL, "no fields to update"));
    }
    if let Some(due_date) = input.patch.due_date.as_deref()
        && chrono::NaiveDate::parse_from_str(due_date, "%Y-%m-%d").is_err()
    {
        return Err(ToolCallError::invalid_input(
            TOOL,
            format!("due_date '{due_date}' is not a YYYY-MM-DD date"),
        ));
    }

    let task = gateway
        .update_task(input.task_id, input.patch)
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    encode(TOOL, &task)
}

// ============================================================================
// task_assign / task_unassign
// ============================================================================

pub fn assign_definition() -> ToolDefinition {
    ToolDefinition {
        name: "task_assign".to_string(),
        description: "Assign a user to a task.".to_string(),
        input_schema: assignment_schema(),
    }
}

#[derive(Debug, Deserialize)]
struct AssignmentInput {
    task_id: TaskId,
    user_id: UserId,
}

async fn assign(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "task_assign";
    let input: AssignmentInput = parse_input(TOOL, input)?;
    gateway
        .assign_task(input.task_id, input.user_id)
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    Ok(json!({ "task_id": input.task_id, "user_id": input.user_id, "assigned": true }))
}

pub fn unassign_definition() -> ToolDefinition {
    ToolDefinition {
        name: "task_unassign".to_string(),
        description: "Remove a user from a task's assignees.".to_string(),
        input_schema: assignment_schema(),
    }
}

async fn unassign(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "task_unassign";
    let input: AssignmentInput = parse_input(TOOL, input)?;
    gateway
        .unassign_task(input.task_id, input.user_id)
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    Ok(json!({ "task_id": input.task_id, "user_id": input.user_id, "assigned": false }))
}

// ============================================================================
// task_list_my / task_search / task_stats_by_status
// ============================================================================

pub fn list_my_definition() -> ToolDefinition {
    ToolDefinition {
        name: "task_list_my".to_string(),
        description: "List tasks assigned to the current user, optionally filtered by status."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "status": status_schema(),
                "limit": {"type": "integer", "minimum": 1}
            },
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
struct ListMyInput {
    status: Option<TaskStatus>,
    limit: Option<usize>,
}

async fn list_my(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "task_list_my";
    let input: ListMyInput = parse_input(TOOL, input)?;
    let Some(user_id) = ctx.user_id else {
        return Err(ToolCallError::domain(
            TOOL,
            DomainError::PermissionDenied("no current user for this session".to_string()),
        ));
    };
    let tasks = gateway
        .list_user_tasks(user_id, input.status, list_limit(input.limit))
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    Ok(json!({ "tasks": encode(TOOL, &tasks)? }))
}

pub fn search_definition() -> ToolDefinition {
    ToolDefinition {
        name: "task_search".to_string(),
        description: "Search a project's tasks by text in title or description.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "project_id": {"type": "integer"},
                "term": {"type": "string", "minLength": 1},
                "limit": {"type": "integer", "minimum": 1}
            },
            "required": ["project_id", "term"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
struct SearchInput {
    project_id: ProjectId,
    term: String,
    limit: Option<usize>,
}

async fn search(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "task_search";
    let input: SearchInput = parse_input(TOOL, input)?;
    let term = input.term.trim();
    if term.is_empty() {
        return Err(ToolCallError::invalid_input(TOOL, "term cannot be empty"));
    }
    let tasks = gateway
        .search_tasks(input.project_id, term, list_limit(input.limit))
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;
    Ok(json!({ "tasks": encode(TOOL, &tasks)? }))
}

pub fn stats_definition() -> ToolDefinition {
    ToolDefinition {
        name: "task_stats_by_status".to_string(),
        description: "Count a project's tasks per status.".to_string(),
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
struct StatsInput {
    project_id: ProjectId,
}

async fn stats(
    gateway: Arc<dyn DomainGateway>,
    input: Value,
    _ctx: ToolContext,
) -> Result<Value, ToolCallError> {
    const TOOL: &str = "task_stats_by_status";
    let input: StatsInput = parse_input(TOOL, input)?;
    let counts = gateway
        .count_tasks_by_status(input.project_id)
        .await
        .map_err(|e| ToolCallError::domain(TOOL, e))?;

    let total: u64 = counts.iter().map(|c| c.count).sum();
    let by_status: Map<String, Value> = counts
        .into_iter()
        .map(|c| (c.status.to_string(), Value::from(c.count)))
        .collect();
    Ok(json!({
        "project_id": input.project_id,
        "counts": by_status,
        "total": total,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InMemoryGateway;

    fn gateway() -> Arc<dyn DomainGateway> {
        Arc::new(InMemoryGateway::demo())
    }

    #[tokio::test]
    async fn test_create_returns_task_id_and_records_reporter() {
        let gateway = gateway();
        let out = create(
            Arc::clone(&gateway),
            json!({"title": "Fix bug", "project_id": 7}),
            ToolContext::new(Some(2)),
        )
        .await
        .unwrap();
        assert_eq!(out, json!({"task_id": 42}));

        let task = gateway.get_task(42).await.unwrap();
        assert_eq!(task.reporter_id, Some(2));
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.priority, Priority::Medium);
    }

    #[tokio::test]
    async fn test_update_requires_a_field() {
        let err = update(gateway(), json!({"task_id": 40}), ToolContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[tokio::test]
    async fn test_update_changes_status() {
        let out = update(
            gateway(),
            json!({"task_id": 41, "status": "in_review", "due_date": "2026-11-02"}),
            ToolContext::default(),
        )
        .await
        .unwrap();
        assert_eq!(out["status"], "in_review");
        assert_eq!(out["due_date"], "2026-11-02");
    }

    #[tokio::test]
    async fn test_update_rejects_bad_date() {
        let err = update(
            gateway(),
            json!({"task_id": 41, "due_date": "next friday"}),
            ToolContext::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[tokio::test]
    async fn test_list_my_needs_current_user() {
        let err = list_my(gateway(), json!({}), ToolContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "permission_denied");

        let out = list_my(gateway(), json!({}), ToolContext::new(Some(2)))
            .await
            .unwrap();
        assert_eq!(out["tasks"][0]["id"], 41);
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive() {
        let out = search(
            gateway(),
            json!({"project_id": 7, "term": "ONBOARDING"}),
            ToolContext::default(),
        )
        .await
        .unwrap();
        assert_eq!(out["tasks"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_counts_and_total() {
        let out = stats(gateway(), json!({"project_id": 7}), ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out["counts"], json!({"in_progress": 1, "done": 1}));
        assert_eq!(out["total"], 2);
    }

    #[tokio::test]
    async fn test_delete_missing_task() {
        let err = delete(gateway(), json!({"task_id": 999}), ToolContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
