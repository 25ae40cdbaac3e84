//! GitLab webhook payloads and raw-file retrieval.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

use super::pipeline::Repository;

/// `object_kind` value of a push event.
pub const WEBHOOK_PUSH: &str = "push";

/// A GitLab push event, as delivered to the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub object_kind: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(rename = "user_name", default)]
    pub author_name: String,
    pub project: Project,
    #[serde(default)]
    pub commits: Vec<Commit>,
}

/// The project a push event belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    #[serde(default)]
    pub web_url: String,
    #[serde(rename = "path_with_namespace", default)]
    pub full_path: String,
}

/// One commit in a push event, listing the paths it added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub author: CommitAuthor,
    #[serde(default)]
    pub added: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitAuthor {
    #[serde(default)]
    pub name: String,
}

/// Reads file contents from a VCS at a given commit.
#[async_trait]
pub trait VcsReader: Send + Sync {
    async fn read_file(
        &self,
        repository: &Repository,
        path: &str,
        commit_sha: &str,
    ) -> Result<String>;
}

/// GitLab API client for raw-file retrieval.
pub struct GitlabClient {
    http: reqwest::Client,
}

impl GitlabClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for GitlabClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VcsReader for GitlabClient {
    async fn read_file(
        &self,
        repository: &Repository,
        path: &str,
        commit_sha: &str,
    ) -> Result<String> {
        let url = format!(
            "{}/api/v4/projects/{}/repository/files/{}/raw?ref={}",
            repository.vcs_instance_url.trim_end_matches('/'),
            repository.external_id,
            urlencode(path),
            commit_sha,
        );
        let response = self
            .http
            .get(&url)
            .header("PRIVATE-TOKEN", &repository.vcs_access_token)
            .send()
            .await
            .map_err(|e| DriverError::Internal(format!("failed to fetch {path:?}: {e}")))?;

        if !response.status().is_success() {
            return Err(DriverError::Internal(format!(
                "failed to fetch {path:?}: HTTP {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| DriverError::Internal(format!("failed to read {path:?}: {e}")))
    }
}

/// Percent-encode a repository path for the GitLab files API.
fn urlencode(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
