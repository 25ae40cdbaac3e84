//! Webhook endpoint: `POST /hook/gitlab/{endpoint-id}`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use tracing::{info, warn};

use dbshift::vcs::{
    process_push_event, DatabaseService, IssueService, PushEvent, RepositoryService, VcsReader,
    WEBHOOK_PUSH,
};

/// Services the webhook pipeline collaborates with.
#[derive(Clone)]
pub struct AppState {
    pub repositories: Arc<dyn RepositoryService>,
    pub databases: Arc<dyn DatabaseService>,
    pub issues: Arc<dyn IssueService>,
    pub vcs: Arc<dyn VcsReader>,
}

/// The webhook router.
pub fn webhook_router(state: AppState) -> Router {
    Router::new()
        .route("/hook/gitlab/:id", post(handle_gitlab_push))
        .with_state(state)
}

async fn handle_gitlab_push(
    State(state): State<AppState>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let event: PushEvent = match serde_json::from_str(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "malformatted push event");
            return (StatusCode::BAD_REQUEST, "Malformatted push event".to_string());
        }
    };

    // The webhook is registered for push events only; anything else is noise.
    if event.object_kind != WEBHOOK_PUSH {
        return (
            StatusCode::BAD_REQUEST,
            format!(
                "Invalid webhook event type, got {}, want push",
                event.object_kind
            ),
        );
    }

    let repository = match state
        .repositories
        .find_by_webhook_endpoint(&endpoint_id)
        .await
    {
        Ok(Some(repository)) => repository,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                format!("Endpoint not found: {endpoint_id}"),
            );
        }
        Err(e) => {
            warn!(endpoint_id, error = %e, "failed to find repository");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to respond webhook event for endpoint: {endpoint_id}"),
            );
        }
    };

    let token = headers
        .get("X-Gitlab-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if token != repository.secret_token {
        return (StatusCode::BAD_REQUEST, "Secret token mismatch".to_string());
    }

    if event.project.id.to_string() != repository.external_id {
        return (
            StatusCode::BAD_REQUEST,
            format!(
                "Project mismatch, got {}, want {}",
                event.project.id, repository.external_id
            ),
        );
    }

    info!(
        repository = %repository.name,
        git_ref = %event.git_ref,
        commits = event.commits.len(),
        "processing push event"
    );

    match process_push_event(
        &repository,
        &event,
        state.vcs.as_ref(),
        state.databases.as_ref(),
        state.issues.as_ref(),
    )
    .await
    {
        Ok(messages) => (StatusCode::OK, messages.join("\n")),
        Err(e) => {
            warn!(error = %e, "failed to process push event");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to process push event".to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use dbshift::vcs::{DatabaseRecord, Issue, IssueCreate, Repository};
    use dbshift::{DriverError, Result};

    use super::*;

    struct FakeRepositories {
        repository: Repository,
    }

    #[async_trait]
    impl RepositoryService for FakeRepositories {
        async fn find_by_webhook_endpoint(&self, endpoint_id: &str) -> Result<Option<Repository>> {
            Ok((endpoint_id == self.repository.webhook_endpoint_id)
                .then(|| self.repository.clone()))
        }
    }

    struct FakeDatabases {
        databases: HashMap<(i64, String), DatabaseRecord>,
    }

    #[async_trait]
    impl DatabaseService for FakeDatabases {
        async fn find_database(
            &self,
            project_id: i64,
            name: &str,
        ) -> Result<Option<DatabaseRecord>> {
            Ok(self.databases.get(&(project_id, name.to_string())).cloned())
        }
    }

    #[derive(Default)]
    struct RecordingIssues {
        count: AtomicI64,
        names: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IssueService for RecordingIssues {
        async fn create_issue(&self, create: IssueCreate) -> Result<Issue> {
            let id = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            self.names.lock().unwrap().push(create.name.clone());
            Ok(Issue {
                id,
                name: create.name,
            })
        }
    }

    struct FakeVcs;

    #[async_trait]
    impl VcsReader for FakeVcs {
        async fn read_file(
            &self,
            _repository: &Repository,
            path: &str,
            _commit_sha: &str,
        ) -> Result<String> {
            if path.ends_with(".sql") {
                Ok("ALTER TABLE t ADD COLUMN c INT;".to_string())
            } else {
                Err(DriverError::Internal("not found".to_string()))
            }
        }
    }

    fn repository() -> Repository {
        Repository {
            id: 1,
            project_id: 7,
            name: "app".into(),
            external_id: "42".into(),
            webhook_endpoint_id: "endpoint-1".into(),
            secret_token: "s3cret".into(),
            base_directory: "sql".into(),
            fallback_database: "app".into(),
            vcs_instance_url: "https://gitlab.example.com".into(),
            vcs_access_token: "token".into(),
        }
    }

    fn state(issues: Arc<RecordingIssues>) -> AppState {
        AppState {
            repositories: Arc::new(FakeRepositories {
                repository: repository(),
            }),
            databases: Arc::new(FakeDatabases {
                databases: HashMap::from([(
                    (7, "app".to_string()),
                    DatabaseRecord {
                        id: 11,
                        instance_id: 3,
                        project_id: 7,
                        name: "app".into(),
                        environment_id: 5,
                        environment_name: "Prod".into(),
                    },
                )]),
            }),
            issues,
            vcs: Arc::new(FakeVcs),
        }
    }

    fn push_body(added: &[&str]) -> String {
        serde_json::json!({
            "object_kind": "push",
            "ref": "refs/heads/main",
            "user_name": "dev",
            "project": { "id": 42, "web_url": "", "path_with_namespace": "acme/app" },
            "commits": [{
                "id": "abc123",
                "title": "add migration",
                "message": "add migration",
                "timestamp": "2021-10-12T08:00:00Z",
                "url": "",
                "author": { "name": "dev" },
                "added": added,
            }]
        })
        .to_string()
    }

    fn request(endpoint: &str, token: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/hook/gitlab/{endpoint}"))
            .header("X-Gitlab-Token", token)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn push_with_one_sql_file_creates_one_issue() {
        let issues = Arc::new(RecordingIssues::default());
        let app = webhook_router(state(issues.clone()));

        let response = app
            .oneshot(request(
                "endpoint-1",
                "s3cret",
                push_body(&["sql/0004__add_col.sql", "sql/README.md"]),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(body.lines().count(), 1);
        assert!(body.contains("0004__add_col.sql"));
        assert_eq!(issues.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mismatched_token_is_rejected_without_creating_issues() {
        let issues = Arc::new(RecordingIssues::default());
        let app = webhook_router(state(issues.clone()));

        let response = app
            .oneshot(request(
                "endpoint-1",
                "wrong-token",
                push_body(&["sql/0004__add_col.sql"]),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(issues.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_endpoint_is_not_found() {
        let issues = Arc::new(RecordingIssues::default());
        let app = webhook_router(state(issues));

        let response = app
            .oneshot(request("nope", "s3cret", push_body(&[])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn project_mismatch_is_rejected() {
        let issues = Arc::new(RecordingIssues::default());
        let app = webhook_router(state(issues));

        let mut body: serde_json::Value =
            serde_json::from_str(&push_body(&["sql/0004__add_col.sql"])).unwrap();
        body["project"]["id"] = serde_json::json!(999);

        let response = app
            .oneshot(request("endpoint-1", "s3cret", body.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_push_event_is_rejected() {
        let issues = Arc::new(RecordingIssues::default());
        let app = webhook_router(state(issues));

        let mut body: serde_json::Value =
            serde_json::from_str(&push_body(&["sql/0004__add_col.sql"])).unwrap();
        body["object_kind"] = serde_json::json!("tag_push");

        let response = app
            .oneshot(request("endpoint-1", "s3cret", body.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
