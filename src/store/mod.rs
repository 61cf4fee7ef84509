//! Store module - persistence boundary
//!
//! The core only needs a handful of operations from its backing store.
//! Two implementations are provided:
//! - `MemoryStore`: process-local, used by tests and single-node setups
//! - `RedisStore`: shared Redis instance
//!
//! Files are append-only. A file's result map is the only part of a file
//! that changes after insertion, and it maps each tool to its latest result.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::models::{
    File, FileId, Permission, Project, ProjectId, ResultId, Submission, SubmissionId, ToolResult,
    User,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} {id} already exists")]
    Duplicate { kind: &'static str, id: String },
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn duplicate(kind: &'static str, id: impl ToString) -> Self {
        Self::Duplicate {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn user(&self, name: &str) -> StoreResult<Option<User>>;

    /// Fails with `Duplicate` if the name is taken
    async fn add_user(&self, user: &User) -> StoreResult<()>;

    async fn set_permission(&self, name: &str, permission: Permission) -> StoreResult<()>;

    async fn projects(&self) -> StoreResult<Vec<Project>>;

    async fn project(&self, id: &ProjectId) -> StoreResult<Option<Project>>;

    async fn add_project(&self, project: &Project) -> StoreResult<()>;

    async fn add_submission(&self, submission: &Submission) -> StoreResult<()>;

    async fn submission(&self, id: &SubmissionId) -> StoreResult<Option<Submission>>;

    /// Persist a file and bump its submission's file count
    async fn add_file(&self, file: &File) -> StoreResult<()>;

    async fn file(&self, id: &FileId) -> StoreResult<Option<File>>;

    /// All files of a submission ordered by number
    async fn files(&self, submission: &SubmissionId) -> StoreResult<Vec<File>>;

    async fn file_count(&self, submission: &SubmissionId) -> StoreResult<u64>;

    /// Persist a result and point its file's entry for that tool at it
    async fn add_result(&self, result: &ToolResult) -> StoreResult<()>;

    async fn result(&self, id: &ResultId) -> StoreResult<Option<ToolResult>>;

    async fn set_test_bundle(&self, project: &ProjectId, file: &FileId) -> StoreResult<()>;

    /// Payload of the project's current test bundle
    async fn test_bundle(&self, project: &ProjectId) -> StoreResult<Option<Vec<u8>>>;
}

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
