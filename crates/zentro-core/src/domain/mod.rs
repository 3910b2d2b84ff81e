//! Domain gateway contract.
//!
//! The project/task business layer lives outside this crate. The agent only
//! talks to it through `DomainGateway`, one async call per operation, each
//! returning a domain object or a typed `DomainError`.

pub mod memory;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

pub use memory::{GatewaySeed, InMemoryGateway};

pub type UserId = i64;
pub type ProjectId = i64;
pub type TaskId = i64;
pub type EpicId = i64;
pub type SprintId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Todo,
    InProgress,
    InReview,
    Done,
    Blocked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Draft,
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::InReview,
        TaskStatus::Done,
        TaskStatus::Blocked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::InReview => "in_review",
            TaskStatus::Done => "done",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::Invalid(format!("unknown task status '{s}'")))
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
    Blocker,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Critical,
        Priority::Blocker,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
            Priority::Blocker => "blocker",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectRole {
    Owner,
    Admin,
    #[default]
    Member,
    Viewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub creator_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user: User,
    pub role: ProjectRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(default)]
    pub epic_id: Option<EpicId>,
    #[serde(default)]
    pub sprint_id: Option<SprintId>,
    #[serde(default)]
    pub reporter_id: Option<UserId>,
    #[serde(default)]
    pub assignee_ids: Vec<UserId>,
    #[serde(default)]
    pub estimate: Option<f64>,
    #[serde(default)]
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epic {
    pub id: EpicId,
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sprint {
    pub id: SprintId,
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: TaskStatus,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProject {
    pub name: String,
    pub key: Option<String>,
    pub description: Option<String>,
    pub creator_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub project_id: ProjectId,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub epic_id: Option<EpicId>,
    pub sprint_id: Option<SprintId>,
    pub reporter_id: Option<UserId>,
}

/// Partial update for a task. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<EpicId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprint_id: Option<SprintId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self == &TaskPatch::default()
    }
}

/// Request/response contract of the project/task business layer.
///
/// Implementations must be safe to call concurrently from many turns.
#[async_trait]
pub trait DomainGateway: Send + Sync {
    async fn create_project(&self, project: NewProject) -> Result<Project, DomainError>;
    async fn get_project(&self, id: ProjectId) -> Result<Project, DomainError>;
    /// Projects visible to `user_id`, or all projects when `None`.
    async fn list_projects(
        &self,
        user_id: Option<UserId>,
        limit: usize,
    ) -> Result<Vec<Project>, DomainError>;
    async fn list_project_members(&self, project_id: ProjectId)
    -> Result<Vec<Member>, DomainError>;

    async fn create_task(&self, task: NewTask) -> Result<Task, DomainError>;
    async fn get_task(&self, id: TaskId) -> Result<Task, DomainError>;
    async fn update_task(&self, id: TaskId, patch: TaskPatch) -> Result<Task, DomainError>;
    async fn delete_task(&self, id: TaskId) -> Result<(), DomainError>;
    async fn assign_task(&self, task_id: TaskId, user_id: UserId) -> Result<(), DomainError>;
    async fn unassign_task(&self, task_id: TaskId, user_id: UserId) -> Result<(), DomainError>;
    async fn list_user_tasks(
        &self,
        user_id: UserId,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, DomainError>;
    async fn search_tasks(
        &self,
        project_id: ProjectId,
        term: &str,
        limit: usize,
    ) -> Result<Vec<Task>, DomainError>;
    async fn count_tasks_by_status(
        &self,
        project_id: ProjectId,
    ) -> Result<Vec<StatusCount>, DomainError>;

    async fn list_epics(&self, project_id: ProjectId) -> Result<Vec<Epic>, DomainError>;
    async fn get_epic(&self, id: EpicId) -> Result<Epic, DomainError>;

    async fn list_sprints(&self, project_id: ProjectId) -> Result<Vec<Sprint>, DomainError>;
    async fn get_active_sprint(&self, project_id: ProjectId)
    -> Result<Option<Sprint>, DomainError>;
}
