//! Redis backed store
//!
//! Records are stored as JSON strings. Relations are kept in Redis sets,
//! lists and hashes:
//! - `intake:projects` set of project ids
//! - `intake:submission:{id}:files` list of file ids in arrival order
//! - `intake:file:{id}:results` hash of tool name -> result id

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use super::{Store, StoreError, StoreResult};
use crate::core::models::{
    File, FileId, Permission, Project, ProjectId, ResultId, Submission, SubmissionId, ToolResult,
    User,
};

/// Redis key layout
pub mod keys {
    use crate::core::models::{FileId, ProjectId, ResultId, SubmissionId};

    pub const PROJECTS: &str = "intake:projects";

    pub fn user(name: &str) -> String {
        format!("intake:user:{}", name)
    }

    pub fn project(id: &ProjectId) -> String {
        format!("intake:project:{}", id)
    }

    pub fn submission(id: &SubmissionId) -> String {
        format!("intake:submission:{}", id)
    }

    pub fn submission_files(id: &SubmissionId) -> String {
        format!("intake:submission:{}:files", id)
    }

    pub fn file(id: &FileId) -> String {
        format!("intake:file:{}", id)
    }

    pub fn file_results(id: &FileId) -> String {
        format!("intake:file:{}:results", id)
    }

    pub fn result(id: &ResultId) -> String {
        format!("intake:result:{}", id)
    }

    pub fn test_bundle(id: &ProjectId) -> String {
        format!("intake:project:{}:tests", id)
    }
}

const CONNECT_RETRIES: u32 = 5;

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut attempt = 0;
        let conn = loop {
            match ConnectionManager::new(client.clone()).await {
                Ok(conn) => break conn,
                Err(e) if attempt < CONNECT_RETRIES => {
                    attempt += 1;
                    warn!(
                        "Failed to connect to Redis: {}. Retrying in 3 seconds ({}/{})...",
                        e, attempt, CONNECT_RETRIES
                    );
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        info!("Connected to Redis at {}", redis_url);
        Ok(Self { conn })
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    async fn set_json_nx<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        kind: &'static str,
        id: impl ToString,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(value)?;
        let created: bool = conn.set_nx(key, json).await?;
        if !created {
            return Err(StoreError::duplicate(kind, id));
        }
        Ok(())
    }

    async fn load_results(&self, file: &mut File) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let entries: HashMap<String, String> = conn.hgetall(keys::file_results(&file.id)).await?;
        for (tool, id) in entries {
            let id = id
                .parse::<ResultId>()
                .map_err(|e| StoreError::Corrupt(format!("result id {:?}: {}", id, e)))?;
            file.results.insert(tool, id);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn user(&self, name: &str) -> StoreResult<Option<User>> {
        self.get_json(&keys::user(name)).await
    }

    async fn add_user(&self, user: &User) -> StoreResult<()> {
        self.set_json_nx(&keys::user(&user.name), user, "user", &user.name)
            .await
    }

    async fn set_permission(&self, name: &str, permission: Permission) -> StoreResult<()> {
        let mut user: User = self
            .user(name)
            .await?
            .ok_or_else(|| StoreError::not_found("user", name))?;
        user.permission = permission;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(keys::user(name), serde_json::to_string(&user)?)
            .await?;
        Ok(())
    }

    async fn projects(&self) -> StoreResult<Vec<Project>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(keys::PROJECTS).await?;
        let mut projects = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id
                .parse::<ProjectId>()
                .map_err(|e| StoreError::Corrupt(format!("project id {:?}: {}", id, e)))?;
            if let Some(project) = self.project(&id).await? {
                projects.push(project);
            }
        }
        projects.sort_by(|a: &Project, b: &Project| a.name.cmp(&b.name));
        Ok(projects)
    }

    async fn project(&self, id: &ProjectId) -> StoreResult<Option<Project>> {
        self.get_json(&keys::project(id)).await
    }

    async fn add_project(&self, project: &Project) -> StoreResult<()> {
        self.set_json_nx(&keys::project(&project.id), project, "project", project.id)
            .await?;
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(keys::PROJECTS, project.id.to_string())
            .await?;
        Ok(())
    }

    async fn add_submission(&self, submission: &Submission) -> StoreResult<()> {
        self.set_json_nx(
            &keys::submission(&submission.id),
            submission,
            "submission",
            submission.id,
        )
        .await
    }

    async fn submission(&self, id: &SubmissionId) -> StoreResult<Option<Submission>> {
        self.get_json(&keys::submission(id)).await
    }

    async fn add_file(&self, file: &File) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(keys::submission(&file.submission)).await?;
        if !exists {
            return Err(StoreError::not_found("submission", file.submission));
        }

        let mut stored = file.clone();
        stored.results.clear();
        let json = serde_json::to_string(&stored)?;
        let created: bool = conn.set_nx(keys::file(&file.id), json).await?;
        if !created {
            return Err(StoreError::duplicate("file", file.id));
        }
        conn.rpush::<_, _, ()>(keys::submission_files(&file.submission), file.id.to_string())
            .await?;
        Ok(())
    }

    async fn file(&self, id: &FileId) -> StoreResult<Option<File>> {
        let Some(mut file) = self.get_json::<File>(&keys::file(id)).await? else {
            return Ok(None);
        };
        self.load_results(&mut file).await?;
        Ok(Some(file))
    }

    async fn files(&self, submission: &SubmissionId) -> StoreResult<Vec<File>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .lrange(keys::submission_files(submission), 0, -1)
            .await?;
        let mut files = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id
                .parse::<FileId>()
                .map_err(|e| StoreError::Corrupt(format!("file id {:?}: {}", id, e)))?;
            if let Some(file) = self.file(&id).await? {
                files.push(file);
            }
        }
        files.sort_by_key(|f: &File| f.number);
        Ok(files)
    }

    async fn file_count(&self, submission: &SubmissionId) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(keys::submission_files(submission)).await?)
    }

    async fn add_result(&self, result: &ToolResult) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(keys::file(&result.file)).await?;
        if !exists {
            return Err(StoreError::not_found("file", result.file));
        }

        let results_key = keys::file_results(&result.file);
        let previous: Option<String> = conn.hget(&results_key, &result.tool).await?;
        let json = serde_json::to_string(result)?;

        redis::pipe()
            .atomic()
            .set(keys::result(&result.id), json)
            .ignore()
            .hset(&results_key, &result.tool, result.id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        if let Some(old) = previous.and_then(|id| id.parse::<ResultId>().ok()) {
            if old != result.id {
                conn.del::<_, ()>(keys::result(&old)).await?;
            }
        }
        Ok(())
    }

    async fn result(&self, id: &ResultId) -> StoreResult<Option<ToolResult>> {
        self.get_json(&keys::result(id)).await
    }

    async fn set_test_bundle(&self, project: &ProjectId, file: &FileId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(keys::file(file)).await?;
        if !exists {
            return Err(StoreError::not_found("file", file));
        }
        conn.set::<_, _, ()>(keys::test_bundle(project), file.to_string())
            .await?;
        Ok(())
    }

    async fn test_bundle(&self, project: &ProjectId) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(keys::test_bundle(project)).await?;
        let Some(id) = id else {
            return Ok(None);
        };
        let id = id
            .parse::<FileId>()
            .map_err(|e| StoreError::Corrupt(format!("file id {:?}: {}", id, e)))?;
        Ok(self.get_json::<File>(&keys::file(&id)).await?.map(|f| f.data))
    }
}

#[cfg(test)]
mod tests {
    use super::keys;
    use crate::core::models::{FileId, SubmissionId};

    #[test]
    fn test_keys_are_namespaced() {
        let sub = SubmissionId::new();
        let file = FileId::new();
        assert_eq!(keys::submission_files(&sub), format!("intake:submission:{}:files", sub));
        assert_eq!(keys::file_results(&file), format!("intake:file:{}:results", file));
        assert!(keys::user("alice").starts_with("intake:user:"));
    }
}
