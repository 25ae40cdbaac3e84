//! Seed-file backed implementations of the pipeline's collaborator services.
//!
//! The full record services (projects, issues, pipelines) live outside this
//! server; these implementations are enough to route webhook events and hand
//! created issues to the log.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use dbshift::vcs::{
    DatabaseRecord, DatabaseService, Issue, IssueCreate, IssueService, Repository,
    RepositoryService,
};
use dbshift::{DriverError, Result};

/// Seed data wiring webhook endpoints to repositories and databases.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub repositories: Vec<Repository>,
    #[serde(default)]
    pub databases: Vec<DatabaseRecord>,
}

impl SeedData {
    /// Load seed data from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("cannot read seed file {path:?}: {e}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| DriverError::Config(format!("malformed seed file {path:?}: {e}")))
    }
}

/// Repository lookup over the seed data.
pub struct SeedRepositoryService {
    repositories: Vec<Repository>,
}

impl SeedRepositoryService {
    pub fn new(repositories: Vec<Repository>) -> Self {
        Self { repositories }
    }
}

#[async_trait]
impl RepositoryService for SeedRepositoryService {
    async fn find_by_webhook_endpoint(&self, endpoint_id: &str) -> Result<Option<Repository>> {
        Ok(self
            .repositories
            .iter()
            .find(|r| r.webhook_endpoint_id == endpoint_id)
            .cloned())
    }
}

/// Database lookup over the seed data.
pub struct SeedDatabaseService {
    databases: Vec<DatabaseRecord>,
}

impl SeedDatabaseService {
    pub fn new(databases: Vec<DatabaseRecord>) -> Self {
        Self { databases }
    }
}

#[async_trait]
impl DatabaseService for SeedDatabaseService {
    async fn find_database(&self, project_id: i64, name: &str) -> Result<Option<DatabaseRecord>> {
        Ok(self
            .databases
            .iter()
            .find(|d| d.project_id == project_id && d.name == name)
            .cloned())
    }
}

/// Issue sink that assigns ids and logs; the issue store proper is external.
#[derive(Default)]
pub struct LoggingIssueService {
    next_id: AtomicI64,
}

#[async_trait]
impl IssueService for LoggingIssueService {
    async fn create_issue(&self, create: IssueCreate) -> Result<Issue> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            issue_id = id,
            name = %create.name,
            project_id = create.project_id,
            stages = create.pipeline.stages.len(),
            "created schema update issue"
        );
        Ok(Issue {
            id,
            name: create.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_data_parses_repositories_and_databases() {
        let raw = serde_json::json!({
            "repositories": [{
                "id": 1,
                "project_id": 7,
                "name": "app",
                "external_id": "42",
                "webhook_endpoint_id": "endpoint-1",
                "secret_token": "s3cret",
                "base_directory": "sql",
                "fallback_database": "app",
                "vcs_instance_url": "https://gitlab.example.com",
                "vcs_access_token": "token"
            }],
            "databases": [{
                "id": 11,
                "instance_id": 3,
                "project_id": 7,
                "name": "app",
                "environment_id": 5,
                "environment_name": "Prod"
            }]
        });
        let seed: SeedData = serde_json::from_value(raw).unwrap();
        assert_eq!(seed.repositories.len(), 1);
        assert_eq!(seed.databases.len(), 1);
    }
}
