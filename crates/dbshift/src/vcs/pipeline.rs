//! The push-event-to-migration pipeline.
//!
//! Turns added `.sql` files from a repository push into schema-update issues.
//! Collaborating record services are contracts only; the engine owns none of
//! their storage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::migration::parse_migration_filename;

use super::gitlab::{PushEvent, VcsReader};

/// Principal id of the system bot that authors VCS-driven issues.
pub const SYSTEM_BOT_ID: i64 = 1;

/// Task type applied to every VCS-driven migration.
pub const TASK_TYPE_SCHEMA_UPDATE: &str = "SCHEMA_UPDATE";

/// Issue type applied to every VCS-driven migration.
pub const ISSUE_TYPE_SCHEMA_UPDATE: &str = "dbshift.issue.schema.update";

/// A repository wired to a webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    /// Project id on the VCS side; must match the event's project id.
    pub external_id: String,
    pub webhook_endpoint_id: String,
    pub secret_token: String,
    /// Only files under this directory are considered.
    pub base_directory: String,
    /// Database targeted by files directly under the base directory.
    pub fallback_database: String,
    pub vcs_instance_url: String,
    pub vcs_access_token: String,
}

/// A database registered with a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub id: i64,
    pub instance_id: i64,
    pub project_id: i64,
    pub name: String,
    pub environment_id: i64,
    pub environment_name: String,
}

/// One migration task bound to a database instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreate {
    pub instance_id: i64,
    pub database_id: i64,
    pub name: String,
    pub status: String,
    pub task_type: String,
    pub statement: String,
}

/// A single-environment stage wrapping its tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCreate {
    pub environment_id: i64,
    pub name: String,
    pub tasks: Vec<TaskCreate>,
}

/// A pipeline wrapping its stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCreate {
    pub name: String,
    pub stages: Vec<StageCreate>,
}

/// An issue wrapping one pipeline, authored by the system bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCreate {
    pub project_id: i64,
    pub name: String,
    pub issue_type: String,
    pub description: String,
    pub assignee_id: i64,
    pub pipeline: PipelineCreate,
}

/// A created issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub name: String,
}

/// Looks up repositories by webhook endpoint.
#[async_trait]
pub trait RepositoryService: Send + Sync {
    async fn find_by_webhook_endpoint(&self, endpoint_id: &str) -> Result<Option<Repository>>;
}

/// Looks up databases by project and name.
#[async_trait]
pub trait DatabaseService: Send + Sync {
    async fn find_database(&self, project_id: i64, name: &str) -> Result<Option<DatabaseRecord>>;
}

/// Creates issues.
#[async_trait]
pub trait IssueService: Send + Sync {
    async fn create_issue(&self, create: IssueCreate) -> Result<Issue>;
}

/// The database a pushed file targets: the directory component between the
/// repository base directory and the filename, when present.
pub fn database_from_path(base_directory: &str, path: &str) -> Option<String> {
    let base = base_directory.trim_matches('/');
    let relative = path.strip_prefix(base)?.trim_start_matches('/');
    let mut components: Vec<&str> = relative.split('/').collect();
    components.pop();
    components.first().map(|c| c.to_string())
}

/// Process one authenticated push event.
///
/// Walks every added path under the repository base directory ending in
/// `.sql`, parses the migration filename, fetches the file at the commit SHA,
/// resolves the target database, and submits a task → stage → pipeline →
/// issue chain. Per-file failures log and continue so one bad file never
/// blocks the rest; the return value lists the created-issue messages.
pub async fn process_push_event(
    repository: &Repository,
    event: &PushEvent,
    vcs: &dyn VcsReader,
    databases: &dyn DatabaseService,
    issues: &dyn IssueService,
) -> Result<Vec<String>> {
    let mut created = Vec::new();

    for commit in &event.commits {
        for added in &commit.added {
            if !added.starts_with(&repository.base_directory) || !added.ends_with(".sql") {
                continue;
            }
            let filename = added.rsplit('/').next().unwrap_or(added);

            let parsed = match parse_migration_filename(filename) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(filename, error = %e, "invalid migration filename, ignored");
                    continue;
                }
            };

            let statement = match vcs.read_file(repository, added, &commit.id).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(filename, error = %e, "failed to read file, ignored");
                    continue;
                }
            };

            let database_name = database_from_path(&repository.base_directory, added)
                .unwrap_or_else(|| repository.fallback_database.clone());
            let database = match databases
                .find_database(repository.project_id, &database_name)
                .await
            {
                Ok(Some(database)) => database,
                Ok(None) => {
                    warn!(
                        project_id = repository.project_id,
                        database = %database_name,
                        filename,
                        "project does not contain database, ignored"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(filename, error = %e, "failed to find database, ignored");
                    continue;
                }
            };

            let task = TaskCreate {
                instance_id: database.instance_id,
                database_id: database.id,
                name: parsed.description.clone(),
                status: "PENDING".to_string(),
                task_type: TASK_TYPE_SCHEMA_UPDATE.to_string(),
                statement,
            };
            let stage = StageCreate {
                environment_id: database.environment_id,
                name: database.environment_name.clone(),
                tasks: vec![task],
            };
            let pipeline = PipelineCreate {
                name: format!("Pipeline - {}", commit.title),
                stages: vec![stage],
            };
            let issue_create = IssueCreate {
                project_id: database.project_id,
                name: commit.title.clone(),
                issue_type: ISSUE_TYPE_SCHEMA_UPDATE.to_string(),
                description: commit.message.clone(),
                assignee_id: SYSTEM_BOT_ID,
                pipeline,
            };

            match issues.create_issue(issue_create).await {
                Ok(issue) => {
                    info!(issue = %issue.name, filename, "created schema update issue");
                    created.push(format!(
                        "Created issue '{}' on adding {}",
                        issue.name, filename
                    ));
                }
                Err(e) => {
                    warn!(filename, error = %e, "failed to create schema update issue, ignored");
                }
            }
        }
    }

    Ok(created)
}
