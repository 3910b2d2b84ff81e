//! In-memory domain gateway.
//!
//! Backs the CLI and the test suite. State is seeded from a `GatewaySeed`
//! (JSON) and lives behind a single `RwLock`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{
    DomainGateway, Epic, EpicId, Member, NewProject, NewTask, Project, ProjectId, ProjectRole,
    Sprint, SprintId, StatusCount, Task, TaskId, TaskPatch, TaskStatus, User, UserId,
};
use crate::error::DomainError;

const MAX_PROJECT_NAME_LEN: usize = 200;
const MAX_PROJECT_KEY_LEN: usize = 20;
const MAX_TASK_TITLE_LEN: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedMember {
    pub project_id: ProjectId,
    pub user_id: UserId,
    #[serde(default)]
    pub role: ProjectRole,
}

/// Initial gateway contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySeed {
    pub users: Vec<User>,
    pub projects: Vec<Project>,
    pub members: Vec<SeedMember>,
    pub tasks: Vec<Task>,
    pub epics: Vec<Epic>,
    pub sprints: Vec<Sprint>,
    /// Overrides the next task id (defaults to max existing + 1).
    pub next_task_id: Option<TaskId>,
    pub next_project_id: Option<ProjectId>,
}

impl GatewaySeed {
    /// Loads a seed from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read gateway seed from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse gateway seed from {}", path.display()))
    }

    /// A small fixed data set: three users, two projects, a few tasks.
    pub fn demo() -> Self {
        let user = |id: UserId, name: &str| User {
            id,
            email: format!("{}@zentro.dev", name.to_ascii_lowercase()),
            username: Some(name.to_ascii_lowercase()),
            full_name: Some(name.to_string()),
        };
        let task = |id: TaskId, title: &str, status: TaskStatus, assignees: Vec<UserId>| Task {
            id,
            project_id: 7,
            title: title.to_string(),
            description: None,
            status,
            priority: super::Priority::Medium,
            epic_id: Some(1),
            sprint_id: Some(14),
            reporter_id: Some(1),
            assignee_ids: assignees,
            estimate: None,
            due_date: None,
        };

        Self {
            users: vec![user(1, "Alice"), user(2, "Bob"), user(3, "Carol")],
            projects: vec![
                Project {
                    id: 7,
                    name: "Zentro Platform".to_string(),
                    key: Some("ZEN".to_string()),
                    description: Some("Core backend and agent".to_string()),
                    creator_id: Some(1),
                },
                Project {
                    id: 8,
                    name: "Mobile App".to_string(),
                    key: Some("MOB".to_string()),
                    description: None,
                    creator_id: Some(2),
                },
            ],
            members: vec![
                SeedMember {
                    project_id: 7,
                    user_id: 1,
                    role: ProjectRole::Owner,
                },
                SeedMember {
                    project_id: 7,
                    user_id: 2,
                    role: ProjectRole::Member,
                },
                SeedMember {
                    project_id: 8,
                    user_id: 2,
                    role: ProjectRole::Owner,
                },
                SeedMember {
                    project_id: 8,
                    user_id: 3,
                    role: ProjectRole::Viewer,
                },
            ],
            tasks: vec![
                task(40, "Set up CI pipeline", TaskStatus::Done, vec![1]),
                task(41, "Write onboarding docs", TaskStatus::InProgress, vec![2]),
            ],
            epics: vec![Epic {
                id: 1,
                project_id: 7,
                title: "Project agent".to_string(),
                description: None,
                color: Some("#4f46e5".to_string()),
            }],
            sprints: vec![
                Sprint {
                    id: 13,
                    project_id: 7,
                    name: "Sprint 13".to_string(),
                    description: None,
                    is_active: false,
                },
                Sprint {
                    id: 14,
                    project_id: 7,
                    name: "Sprint 14".to_string(),
                    description: None,
                    is_active: true,
                },
            ],
            next_task_id: Some(42),
            next_project_id: None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<UserId, User>,
    projects: BTreeMap<ProjectId, Project>,
    members: BTreeMap<ProjectId, Vec<(UserId, ProjectRole)>>,
    tasks: BTreeMap<TaskId, Task>,
    epics: BTreeMap<EpicId, Epic>,
    sprints: BTreeMap<SprintId, Sprint>,
    next_task_id: TaskId,
    next_project_id: ProjectId,
}

impl State {
    fn from_seed(seed: GatewaySeed) -> Self {
        let mut state = State::default();
        for user in seed.users {
            state.users.insert(user.id, user);
        }
        for project in seed.projects {
            state.projects.insert(project.id, project);
        }
        for member in seed.members {
            state
                .members
                .entry(member.project_id)
                .or_default()
                .push((member.user_id, member.role));
        }
        for task in seed.tasks {
            state.tasks.insert(task.id, task);
        }
        for epic in seed.epics {
            state.epics.insert(epic.id, epic);
        }
        for sprint in seed.sprints {
            state.sprints.insert(sprint.id, sprint);
        }
        state.next_task_id = seed
            .next_task_id
            .unwrap_or_else(|| state.tasks.keys().max().map_or(1, |id| id + 1));
        state.next_project_id = seed
            .next_project_id
            .unwrap_or_else(|| state.projects.keys().max().map_or(1, |id| id + 1));
        state
    }

    fn project(&self, id: ProjectId) -> Result<&Project, DomainError> {
        self.projects
            .get(&id)
            .ok_or_else(|| DomainError::not_found(format!("Project {id} not found")))
    }

    fn user(&self, id: UserId) -> Result<&User, DomainError> {
        self.users
            .get(&id)
            .ok_or_else(|| DomainError::not_found(format!("User {id} not found")))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, DomainError> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| DomainError::not_found(format!("Task {id} not found")))
    }

    fn check_epic(&self, epic_id: EpicId, project_id: ProjectId) -> Result<(), DomainError> {
        let epic = self
            .epics
            .get(&epic_id)
            .ok_or_else(|| DomainError::not_found(format!("Epic {epic_id} not found")))?;
        if epic.project_id != project_id {
            return Err(DomainError::Invalid(format!(
                "Epic {epic_id} does not belong to project {project_id}"
            )));
        }
        Ok(())
    }

    fn check_sprint(&self, sprint_id: SprintId, project_id: ProjectId) -> Result<(), DomainError> {
        let sprint = self
            .sprints
            .get(&sprint_id)
            .ok_or_else(|| DomainError::not_found(format!("Sprint {sprint_id} not found")))?;
        if sprint.project_id != project_id {
            return Err(DomainError::Invalid(format!(
                "Sprint {sprint_id} does not belong to project {project_id}"
            )));
        }
        Ok(())
    }

    fn is_visible_to(&self, project: &Project, user_id: UserId) -> bool {
        project.creator_id == Some(user_id)
            || self
                .members
                .get(&project.id)
                .is_some_and(|members| members.iter().any(|(id, _)| *id == user_id))
    }
}

fn check_title(title: &str, max_len: usize) -> Result<(), DomainError> {
    if title.trim().is_empty() {
        return Err(DomainError::Invalid("title cannot be empty".to_string()));
    }
    if title.chars().count() > max_len {
        return Err(DomainError::Invalid(format!(
            "title exceeds {max_len} characters"
        )));
    }
    Ok(())
}

/// `DomainGateway` over process memory.
#[derive(Debug)]
pub struct InMemoryGateway {
    state: RwLock<State>,
    fail_next: AtomicUsize,
    calls: AtomicUsize,
    latency_ms: AtomicU64,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::from_seed(GatewaySeed::default())
    }
}

impl InMemoryGateway {
    pub fn from_seed(seed: GatewaySeed) -> Self {
        Self {
            state: RwLock::new(State::from_seed(seed)),
            fail_next: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn demo() -> Self {
        Self::from_seed(GatewaySeed::demo())
    }

    /// Makes the next `n` calls fail with `DomainError::Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of gateway calls received so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Delays every later call by `latency` before it touches any data.
    pub fn set_latency(&self, latency: Option<Duration>) {
        let ms = latency.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    async fn enter(&self) -> Result<(), DomainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DomainError::Unavailable(
                "injected gateway failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DomainGateway for InMemoryGateway {
    async fn create_project(&self, project: NewProject) -> Result<Project, DomainError> {
        self.enter().await?;
        if project.name.trim().is_empty() {
            return Err(DomainError::Invalid("name cannot be empty".to_string()));
        }
        if project.name.chars().count() > MAX_PROJECT_NAME_LEN {
            return Err(DomainError::Invalid(format!(
                "name exceeds {MAX_PROJECT_NAME_LEN} characters"
            )));
        }
        let mut state = self.state.write().await;
        if let Some(key) = project.key.as_deref() {
            if key.chars().count() > MAX_PROJECT_KEY_LEN {
                return Err(DomainError::Invalid(format!(
                    "key exceeds {MAX_PROJECT_KEY_LEN} characters"
                )));
            }
            if state
                .projects
                .values()
                .any(|p| p.key.as_deref().is_some_and(|k| k.eq_ignore_ascii_case(key)))
            {
                return Err(DomainError::conflict(format!(
                    "Project key '{key}' already exists"
                )));
            }
        }
        if let Some(creator_id) = project.creator_id {
            state.user(creator_id)?;
        }

        let id = state.next_project_id;
        state.next_project_id += 1;
        let created = Project {
            id,
            name: project.name,
            key: project.key,
            description: project.description,
            creator_id: project.creator_id,
        };
        if let Some(creator_id) = created.creator_id {
            state
                .members
                .entry(id)
                .or_default()
                .push((creator_id, ProjectRole::Owner));
        }
        state.projects.insert(id, created.clone());
        Ok(created)
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project, DomainError> {
        self.enter().await?;
        let state = self.state.read().await;
        state.project(id).cloned()
    }

    async fn list_projects(
        &self,
        user_id: Option<UserId>,
        limit: usize,
    ) -> Result<Vec<Project>, DomainError> {
        self.enter().await?;
        let state = self.state.read().await;
        if let Some(user_id) = user_id {
            state.user(user_id)?;
        }
        Ok(state
            .projects
            .values()
            .filter(|p| user_id.is_none_or(|uid| state.is_visible_to(p, uid)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_project_members(
        &self,
        project_id: ProjectId,
    ) -> Result<Vec<Member>, DomainError> {
        self.enter().await?;
        let state = self.state.read().await;
        state.project(project_id)?;
        let Some(members) = state.members.get(&project_id) else {
            return Ok(Vec::new());
        };
        members
            .iter()
            .map(|(user_id, role)| {
                Ok(Member {
                    user: state.user(*user_id)?.clone(),
                    role: *role,
                })
            })
            .collect()
    }

    async fn create_task(&self, task: NewTask) -> Result<Task, DomainError> {
        self.enter().await?;
        check_title(&task.title, MAX_TASK_TITLE_LEN)?;
        let mut state = self.state.write().await;
        state.project(task.project_id)?;
        if let Some(epic_id) = task.epic_id {
            state.check_epic(epic_id, task.project_id)?;
        }
        if let Some(sprint_id) = task.sprint_id {
            state.check_sprint(sprint_id, task.project_id)?;
        }
        if let Some(reporter_id) = task.reporter_id {
            state.user(reporter_id)?;
        }

        let id = state.next_task_id;
        state.next_task_id += 1;
        let created = Task {
            id,
            project_id: task.project_id,
            title: task.title,
            description: task.description,
            status: task.status,
            priority: task.priority,
            epic_id: task.epic_id,
            sprint_id: task.sprint_id,
            reporter_id: task.reporter_id,
            assignee_ids: Vec::new(),
            estimate: None,
            due_date: None,
        };
        state.tasks.insert(id, created.clone());
        Ok(created)
    }

    async fn get_task(&self, id: TaskId) -> Result<Task, DomainError> {
        self.enter().await?;
        let state = self.state.read().await;
        state
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::not_found(format!("Task {id} not found")))
    }

    async fn update_task(&self, id: TaskId, patch: TaskPatch) -> Result<Task, DomainError> {
        self.enter().await?;
        if let Some(title) = patch.title.as_deref() {
            check_title(title, MAX_TASK_TITLE_LEN)?;
        }
        let mut state = self.state.write().await;
        let project_id = state.task_mut(id)?.project_id;
        if let Some(epic_id) = patch.epic_id {
            state.check_epic(epic_id, project_id)?;
        }
        if let Some(sprint_id) = patch.sprint_id {
            state.check_sprint(sprint_id, project_id)?;
        }

        let task = state.task_mut(id)?;
        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = Some(description);
        }
        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(epic_id) = patch.epic_id {
            task.epic_id = Some(epic_id);
        }
        if let Some(sprint_id) = patch.sprint_id {
            task.sprint_id = Some(sprint_id);
        }
        if let Some(estimate) = patch.estimate {
            task.estimate = Some(estimate);
        }
        if let Some(due_date) = patch.due_date {
            task.due_date = Some(due_date);
        }
        Ok(task.clone())
    }

    async fn delete_task(&self, id: TaskId) -> Result<(), DomainError> {
        self.enter().await?;
        let mut state = self.state.write().await;
        state
            .tasks
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DomainError::not_found(format!("Task {id} not found")))
    }

    async fn assign_task(&self, task_id: TaskId, user_id: UserId) -> Result<(), DomainError> {
        self.enter().await?;
        let mut state = self.state.write().await;
        state.user(user_id)?;
        let task = state.task_mut(task_id)?;
        if !task.assignee_ids.contains(&user_id) {
            task.assignee_ids.push(user_id);
        }
        Ok(())
    }

    async fn unassign_task(&self, task_id: TaskId, user_id: UserId) -> Result<(), DomainError> {
        self.enter().await?;
        let mut state = self.state.write().await;
        state.user(user_id)?;
        let task = state.task_mut(task_id)?;
        task.assignee_ids.retain(|id| *id != user_id);
        Ok(())
    }

    async fn list_user_tasks(
        &self,
        user_id: UserId,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, DomainError> {
        self.enter().await?;
        let state = self.state.read().await;
        state.user(user_id)?;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.assignee_ids.contains(&user_id))
            .filter(|t| status.is_none_or(|s| t.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn search_tasks(
        &self,
        project_id: ProjectId,
        term: &str,
        limit: usize,
    ) -> Result<Vec<Task>, DomainError> {
        self.enter().await?;
        let state = self.state.read().await;
        state.project(project_id)?;
        let needle = term.to_lowercase();
        Ok(state
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .filter(|t| {
                t.title.to_lowercase().contains(&needle)
                    || t.description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_tasks_by_status(
        &self,
        project_id: ProjectId,
    ) -> Result<Vec<StatusCount>, DomainError> {
        self.enter().await?;
        let state = self.state.read().await;
        state.project(project_id)?;
        let mut counts: BTreeMap<TaskStatus, u64> = BTreeMap::new();
        for task in state.tasks.values().filter(|t| t.project_id == project_id) {
            *counts.entry(task.status).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(status, count)| StatusCount { status, count })
            .collect())
    }

    async fn list_epics(&self, project_id: ProjectId) -> Result<Vec<Epic>, DomainError> {
        self.enter().await?;
        let state = self.state.read().await;
        state.project(project_id)?;
        Ok(state
            .epics
            .values()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_epic(&self, id: EpicId) -> Result<Epic, DomainError> {
        self.enter().await?;
        let state = self.state.read().await;
        state
            .epics
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::not_found(format!("Epic {id} not found")))
    }

    async fn list_sprints(&self, project_id: ProjectId) -> Result<Vec<Sprint>, DomainError> {
        self.enter().await?;
        let state = self.state.read().await;
        state.project(project_id)?;
        Ok(state
            .sprints
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_active_sprint(
        &self,
        project_id: ProjectId,
    ) -> Result<Option<Sprint>, DomainError> {
        self.enter().await?;
        let state = self.state.read().await;
        state.project(project_id)?;
        Ok(state
            .sprints
            .values()
            .find(|s| s.project_id == project_id && s.is_active)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;

    fn new_task(project_id: ProjectId, title: &str) -> NewTask {
        NewTask {
            project_id,
            title: title.to_string(),
            description: None,
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            epic_id: None,
            sprint_id: None,
            reporter_id: Some(1),
        }
    }

    #[tokio::test]
    async fn test_demo_seed_allocates_task_42() {
        let gateway = InMemoryGateway::demo();
        let task = gateway.create_task(new_task(7, "Fix bug")).await.unwrap();
        assert_eq!(task.id, 42);
        assert_eq!(task.status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn test_create_task_requires_project() {
        let gateway = InMemoryGateway::demo();
        let err = gateway.create_task(new_task(99, "Orphan")).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_task_rejects_foreign_sprint() {
        let gateway = InMemoryGateway::demo();
        let mut task = new_task(8, "Wrong sprint");
        task.sprint_id = Some(14);
        let err = gateway.create_task(task).await.unwrap_err();
        assert!(matches!(err, DomainError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_duplicate_project_key_conflicts() {
        let gateway = InMemoryGateway::demo();
        let err = gateway
            .create_project(NewProject {
                name: "Another".to_string(),
                key: Some("zen".to_string()),
                description: None,
                creator_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_assign_is_idempotent() {
        let gateway = InMemoryGateway::demo();
        gateway.assign_task(41, 3).await.unwrap();
        gateway.assign_task(41, 3).await.unwrap();
        let task = gateway.get_task(41).await.unwrap();
        assert_eq!(task.assignee_ids, vec![2, 3]);

        gateway.unassign_task(41, 3).await.unwrap();
        let task = gateway.get_task(41).await.unwrap();
        assert_eq!(task.assignee_ids, vec![2]);
    }

    #[tokio::test]
    async fn test_list_projects_filters_by_visibility() {
        let gateway = InMemoryGateway::demo();
        let carol = gateway.list_projects(Some(3), 20).await.unwrap();
        assert_eq!(carol.iter().map(|p| p.id).collect::<Vec<_>>(), vec![8]);

        let all = gateway.list_projects(None, 1).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_count_by_status_groups() {
        let gateway = InMemoryGateway::demo();
        gateway.create_task(new_task(7, "Another")).await.unwrap();
        let counts = gateway.count_tasks_by_status(7).await.unwrap();
        assert_eq!(
            counts,
            vec![
                StatusCount {
                    status: TaskStatus::Todo,
                    count: 1
                },
                StatusCount {
                    status: TaskStatus::InProgress,
                    count: 1
                },
                StatusCount {
                    status: TaskStatus::Done,
                    count: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_fail_next_injects_unavailable() {
        let gateway = InMemoryGateway::demo();
        gateway.fail_next(1);
        assert!(matches!(
            gateway.get_project(7).await,
            Err(DomainError::Unavailable(_))
        ));
        assert!(gateway.get_project(7).await.is_ok());
        assert_eq!(gateway.calls(), 2);
    }

    #[test]
    fn test_seed_parses_partial_json() {
        let seed: GatewaySeed = serde_json::from_str(
            r#"{"projects": [{"id": 3, "name": "Ops"}], "next_task_id": 100}"#,
        )
        .unwrap();
        let state = State::from_seed(seed);
        assert_eq!(state.next_task_id, 100);
        assert_eq!(state.next_project_id, 4);
    }
}
