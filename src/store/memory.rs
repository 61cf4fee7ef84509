//! In-process store backed by hash maps

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{Store, StoreError, StoreResult};
use crate::core::models::{
    File, FileId, Permission, Project, ProjectId, ResultId, Submission, SubmissionId, ToolResult,
    User,
};

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    projects: HashMap<ProjectId, Project>,
    submissions: HashMap<SubmissionId, Submission>,
    files: HashMap<FileId, File>,
    /// Submission -> file ids in insertion order
    submission_files: HashMap<SubmissionId, Vec<FileId>>,
    results: HashMap<ResultId, ToolResult>,
    test_bundles: HashMap<ProjectId, FileId>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user(&self, name: &str) -> StoreResult<Option<User>> {
        Ok(self.read()?.users.get(name).cloned())
    }

    async fn add_user(&self, user: &User) -> StoreResult<()> {
        let mut tables = self.write()?;
        if tables.users.contains_key(&user.name) {
            return Err(StoreError::duplicate("user", &user.name));
        }
        tables.users.insert(user.name.clone(), user.clone());
        Ok(())
    }

    async fn set_permission(&self, name: &str, permission: Permission) -> StoreResult<()> {
        let mut tables = self.write()?;
        let user = tables
            .users
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found("user", name))?;
        user.permission = permission;
        Ok(())
    }

    async fn projects(&self) -> StoreResult<Vec<Project>> {
        let mut projects: Vec<Project> = self.read()?.projects.values().cloned().collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    async fn project(&self, id: &ProjectId) -> StoreResult<Option<Project>> {
        Ok(self.read()?.projects.get(id).cloned())
    }

    async fn add_project(&self, project: &Project) -> StoreResult<()> {
        let mut tables = self.write()?;
        if tables.projects.contains_key(&project.id) {
            return Err(StoreError::duplicate("project", project.id));
        }
        tables.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn add_submission(&self, submission: &Submission) -> StoreResult<()> {
        let mut tables = self.write()?;
        if tables.submissions.contains_key(&submission.id) {
            return Err(StoreError::duplicate("submission", submission.id));
        }
        tables.submissions.insert(submission.id, submission.clone());
        tables.submission_files.entry(submission.id).or_default();
        Ok(())
    }

    async fn submission(&self, id: &SubmissionId) -> StoreResult<Option<Submission>> {
        Ok(self.read()?.submissions.get(id).cloned())
    }

    async fn add_file(&self, file: &File) -> StoreResult<()> {
        let mut tables = self.write()?;
        if !tables.submissions.contains_key(&file.submission) {
            return Err(StoreError::not_found("submission", file.submission));
        }
        if tables.files.contains_key(&file.id) {
            return Err(StoreError::duplicate("file", file.id));
        }
        tables.files.insert(file.id, file.clone());
        tables
            .submission_files
            .entry(file.submission)
            .or_default()
            .push(file.id);
        Ok(())
    }

    async fn file(&self, id: &FileId) -> StoreResult<Option<File>> {
        Ok(self.read()?.files.get(id).cloned())
    }

    async fn files(&self, submission: &SubmissionId) -> StoreResult<Vec<File>> {
        let tables = self.read()?;
        let mut files: Vec<File> = tables
            .submission_files
            .get(submission)
            .map(|ids| ids.iter().filter_map(|id| tables.files.get(id).cloned()).collect())
            .unwrap_or_default();
        files.sort_by_key(|f| f.number);
        Ok(files)
    }

    async fn file_count(&self, submission: &SubmissionId) -> StoreResult<u64> {
        Ok(self
            .read()?
            .submission_files
            .get(submission)
            .map(|ids| ids.len() as u64)
            .unwrap_or(0))
    }

    async fn add_result(&self, result: &ToolResult) -> StoreResult<()> {
        let mut tables = self.write()?;
        let file = tables
            .files
            .get_mut(&result.file)
            .ok_or_else(|| StoreError::not_found("file", result.file))?;
        let replaced = file.results.insert(result.tool.clone(), result.id);
        if let Some(old) = replaced {
            tables.results.remove(&old);
        }
        tables.results.insert(result.id, result.clone());
        Ok(())
    }

    async fn result(&self, id: &ResultId) -> StoreResult<Option<ToolResult>> {
        Ok(self.read()?.results.get(id).cloned())
    }

    async fn set_test_bundle(&self, project: &ProjectId, file: &FileId) -> StoreResult<()> {
        let mut tables = self.write()?;
        if !tables.files.contains_key(file) {
            return Err(StoreError::not_found("file", file));
        }
        tables.test_bundles.insert(*project, *file);
        Ok(())
    }

    async fn test_bundle(&self, project: &ProjectId) -> StoreResult<Option<Vec<u8>>> {
        let tables = self.read()?;
        Ok(tables
            .test_bundles
            .get(project)
            .and_then(|id| tables.files.get(id))
            .map(|f| f.data.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{now_millis, Mode, Modification, FileType};
    use std::collections::BTreeMap;

    fn file(submission: SubmissionId, number: u64) -> File {
        File {
            id: FileId::new(),
            submission,
            number,
            name: "Main.java".into(),
            package: "demo".into(),
            kind: FileType::Source,
            modification: Modification::Saved,
            time: now_millis(),
            data: b"class Main {}".to_vec(),
            results: BTreeMap::new(),
        }
    }

    fn result(file: FileId, tool: &str) -> ToolResult {
        ToolResult {
            id: ResultId::new(),
            file,
            tool: tool.into(),
            stdout: vec![],
            stderr: vec![],
            error: None,
            time: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_user_rejected() {
        let store = MemoryStore::new();
        let user = crate::core::credentials::new_user("alice", "pw", Permission::FILE).unwrap();
        store.add_user(&user).await.unwrap();
        assert!(matches!(
            store.add_user(&user).await,
            Err(StoreError::Duplicate { kind: "user", .. })
        ));
        store.set_permission("alice", Permission::ALL).await.unwrap();
        assert_eq!(store.user("alice").await.unwrap().unwrap().permission, Permission::ALL);
    }

    #[tokio::test]
    async fn test_files_are_counted_per_submission() {
        let store = MemoryStore::new();
        let sub = Submission::new("alice", ProjectId::new(), Mode::FileRemote, now_millis());
        store.add_submission(&sub).await.unwrap();

        for n in [1, 0, 2] {
            store.add_file(&file(sub.id, n)).await.unwrap();
        }

        assert_eq!(store.file_count(&sub.id).await.unwrap(), 3);
        let numbers: Vec<u64> = store.files(&sub.id).await.unwrap().iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_file_for_unknown_submission_rejected() {
        let store = MemoryStore::new();
        let err = store.add_file(&file(SubmissionId::new(), 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "submission", .. }));
    }

    #[tokio::test]
    async fn test_rerun_replaces_result_entry() {
        let store = MemoryStore::new();
        let sub = Submission::new("alice", ProjectId::new(), Mode::FileRemote, now_millis());
        store.add_submission(&sub).await.unwrap();
        let f = file(sub.id, 0);
        store.add_file(&f).await.unwrap();

        let first = result(f.id, "javac");
        let second = result(f.id, "javac");
        store.add_result(&first).await.unwrap();
        store.add_result(&second).await.unwrap();

        let stored = store.file(&f.id).await.unwrap().unwrap();
        assert_eq!(stored.results.len(), 1);
        assert_eq!(stored.results["javac"], second.id);
        assert!(store.result(&first.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bundle_follows_latest_registration() {
        let store = MemoryStore::new();
        let project = ProjectId::new();
        let sub = Submission::new("lecturer", project, Mode::ArchiveTest, now_millis());
        store.add_submission(&sub).await.unwrap();
        assert!(store.test_bundle(&project).await.unwrap().is_none());

        let mut bundle = file(sub.id, 0);
        bundle.data = b"zip bytes".to_vec();
        store.add_file(&bundle).await.unwrap();
        store.set_test_bundle(&project, &bundle.id).await.unwrap();

        assert_eq!(store.test_bundle(&project).await.unwrap(), Some(b"zip bytes".to_vec()));
    }
}
