//! VCS integration: webhook payloads and the push-to-migration pipeline.

mod gitlab;
mod pipeline;

pub use gitlab::{Commit, CommitAuthor, GitlabClient, Project, PushEvent, VcsReader, WEBHOOK_PUSH};
pub use pipeline::{
    database_from_path, process_push_event, DatabaseRecord, DatabaseService, Issue, IssueCreate,
    IssueService, PipelineCreate, Repository, RepositoryService, StageCreate, TaskCreate,
    ISSUE_TYPE_SCHEMA_UPDATE, SYSTEM_BOT_ID, TASK_TYPE_SCHEMA_UPDATE,
};
