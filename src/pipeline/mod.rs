//! Tool execution pipeline
//!
//! Files handed over by protocol sessions go into a bounded queue drained by
//! a fixed pool of workers. Per file, by type:
//! - source: staged to disk, compiled, linted, then tested
//! - archive: expanded into its entries, which are processed in order
//! - test: registered as the project's test bundle
//! - everything else is only stored
//!
//! Every tool invocation is recorded as a [`ToolResult`], including a failed
//! compile, which ends processing of that file.

pub mod target;
pub mod tools;

use std::collections::HashSet;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use self::target::Target;
use self::tools::run_tool;
use crate::config::{Config, Stage};
use crate::core::filename;
use crate::core::models::{File, FileId, FileType, Project, ToolResult};
use crate::core::utils::read_zip_entries;
use crate::provision::{ProvisionError, TestProvisioner};
use crate::runner::Runner;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is shut down")]
    Closed,
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("staging failed: {0}")]
    Staging(#[from] std::io::Error),
    #[error("{0} not found")]
    Missing(String),
    #[error("unreadable archive: {0}")]
    Archive(String),
}

/// Sending side of the work queue
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    tx: flume::Sender<File>,
}

impl PipelineHandle {
    /// Queue a persisted file, waiting while the queue is full
    pub async fn submit(&self, file: File) -> Result<(), PipelineError> {
        self.tx.send_async(file).await.map_err(|_| PipelineError::Closed)
    }

    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    runner: Arc<dyn Runner>,
    provisioner: Arc<TestProvisioner>,
    config: Arc<Config>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        runner: Arc<dyn Runner>,
        provisioner: Arc<TestProvisioner>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            runner,
            provisioner,
            config,
        }
    }

    /// Spawn the worker pool. Workers exit once every handle is dropped and
    /// the queue is drained.
    pub fn start(self: Arc<Self>) -> (PipelineHandle, Vec<JoinHandle<()>>) {
        let (tx, rx) = flume::bounded::<File>(self.config.pipeline.queue_capacity);
        let workers = self.config.pipeline.workers;
        info!("Starting {} pipeline workers", workers);

        let handles = (0..workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let pipeline = self.clone();
                tokio::spawn(async move {
                    while let Ok(file) = rx.recv_async().await {
                        let id = file.id;
                        match pipeline.process(file).await {
                            Ok(results) => debug!(
                                "Worker {} processed file {} ({} results)",
                                worker_id,
                                id,
                                results.len()
                            ),
                            Err(e) => error!("Worker {} failed on file {}: {}", worker_id, id, e),
                        }
                    }
                    debug!("Worker {} stopped", worker_id);
                })
            })
            .collect();

        (PipelineHandle { tx }, handles)
    }

    /// Process one persisted file and return the results recorded for it
    pub async fn process(&self, file: File) -> Result<Vec<ToolResult>, PipelineError> {
        match file.kind {
            FileType::Archive => self.expand_archive(&file).await,
            FileType::Test => {
                self.register_tests(&file).await?;
                Ok(Vec::new())
            }
            FileType::Source => self.analyse(&file).await,
            FileType::Executable | FileType::Change => {
                debug!("Nothing to run for {}", file);
                Ok(Vec::new())
            }
        }
    }

    async fn project_of(&self, file: &File) -> Result<Project, PipelineError> {
        let submission = self
            .store
            .submission(&file.submission)
            .await?
            .ok_or_else(|| PipelineError::Missing(format!("submission {}", file.submission)))?;
        self.store
            .project(&submission.project)
            .await?
            .ok_or_else(|| PipelineError::Missing(format!("project {}", submission.project)))
    }

    /// Compile, lint and test a source file
    async fn analyse(&self, file: &File) -> Result<Vec<ToolResult>, PipelineError> {
        let project = self.project_of(file).await?;
        let Some(lang) = self.config.language(&project.lang) else {
            warn!("No tool chain for language {} of project {}", project.lang, project.name);
            return Ok(Vec::new());
        };
        if !file.name.ends_with(&format!(".{}", lang.extension)) {
            debug!("Skipping {}, not a {} source", file, project.lang);
            return Ok(Vec::new());
        }
        if let Err(e) = filename::check(&file.name, &file.package) {
            warn!("Refusing to stage {}: {}", file.id, e);
            return Ok(Vec::new());
        }

        let staging_root = self.config.staging_dir();
        tokio::fs::create_dir_all(&staging_root).await?;
        // Dropping the guard removes the staged tree
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", file.id))
            .tempdir_in(&staging_root)?;
        let target = Target::new(project.id, &file.name, &project.lang, &file.package, staging.path());
        target.save(&file.data).await?;

        let mut results = Vec::new();
        let mut tests_dir: Option<Option<PathBuf>> = None;
        for tool in lang.ordered_tools() {
            if let Some(recorded) = file.results.get(&tool.name) {
                debug!("{} already ran on {}", tool.name, file.id);
                if tool.stage == Stage::Compile {
                    let compiled = self.store.result(recorded).await?;
                    if !compiled.map_or(false, |r| r.is_success()) {
                        info!("{} has a failed compilation on record, skipping remaining tools", file);
                        break;
                    }
                }
                continue;
            }
            if tool.stage == Stage::Test {
                if tests_dir.is_none() {
                    tests_dir = Some(self.tests_for(&project).await);
                }
                if matches!(tests_dir, Some(None)) {
                    continue;
                }
            }

            let tests = tests_dir.as_ref().and_then(|d| d.as_deref());
            let result = run_tool(
                self.runner.as_ref(),
                tool,
                &target,
                tests,
                &self.config.pipeline,
                file.id,
            )
            .await;
            self.store.add_result(&result).await?;

            let failed_compile = tool.stage == Stage::Compile && !result.is_success();
            results.push(result);
            if failed_compile {
                info!("Compilation of {} failed, skipping remaining tools", file);
                break;
            }
        }
        Ok(results)
    }

    /// Unpacked tests of a project, `None` when there are none to run
    async fn tests_for(&self, project: &Project) -> Option<PathBuf> {
        match self.provisioner.ensure(&project.id).await {
            Ok(dir) => Some(dir),
            Err(ProvisionError::NotFound(_)) => {
                debug!("Project {} has no tests", project.name);
                None
            }
            Err(e) => {
                warn!("Skipping tests for project {}: {}", project.name, e);
                None
            }
        }
    }

    /// Persist each entry of an archive as its own file and process it
    async fn expand_archive(&self, archive: &File) -> Result<Vec<ToolResult>, PipelineError> {
        let data = archive.data.clone();
        let limit = self.config.server.max_payload_bytes;
        let entries = tokio::task::spawn_blocking(move || read_zip_entries(Cursor::new(data), limit))
            .await
            .map_err(|e| PipelineError::Archive(e.to_string()))?
            .map_err(|e| PipelineError::Archive(format!("{:#}", e)))?;

        let existing: HashSet<(FileType, i64)> = self
            .store
            .files(&archive.submission)
            .await?
            .into_iter()
            .map(|f| (f.kind, f.time))
            .collect();

        let mut files = Vec::new();
        for (name, data) in entries {
            let parsed = match filename::parse(&name) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Skipping archive entry: {}", e);
                    continue;
                }
            };
            if existing.contains(&(parsed.kind, parsed.time)) {
                debug!("Archive entry {} already stored", name);
                continue;
            }
            let file = File {
                id: FileId::new(),
                submission: archive.submission,
                number: parsed.number,
                name: parsed.name,
                package: parsed.package,
                kind: parsed.kind,
                modification: parsed.modification,
                time: parsed.time,
                data,
                results: Default::default(),
            };
            self.store.add_file(&file).await?;
            files.push(file);
        }
        files.sort_by_key(|f| f.number);
        info!("Expanded archive {} into {} files", archive.id, files.len());

        let mut results = Vec::new();
        for file in &files {
            match file.kind {
                FileType::Source => match self.analyse(file).await {
                    Ok(mut r) => results.append(&mut r),
                    Err(e) => error!("Failed to process {}: {}", file, e),
                },
                _ => debug!("Stored {}", file),
            }
        }
        Ok(results)
    }

    async fn register_tests(&self, file: &File) -> Result<(), PipelineError> {
        let project = self.project_of(file).await?;
        self.store.set_test_bundle(&project.id, &file.id).await?;
        self.provisioner.invalidate(&project.id).await;
        info!("Registered {} as test bundle of project {}", file.id, project.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::sample_config;
    use crate::core::models::{
        now_millis, Mode, Modification, ProjectId, ResultId, Submission, SubmissionId, ToolError, ToolErrorKind,
    };
    use crate::core::utils::testing::make_zip;
    use crate::runner::testing::FakeRunner;
    use crate::runner::ProcessError;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        runner: Arc<FakeRunner>,
        provisioner: Arc<TestProvisioner>,
        pipeline: Arc<Pipeline>,
    }

    fn fixture(runner: FakeRunner) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(sample_config(dir.path()));
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(runner);
        let provisioner = Arc::new(TestProvisioner::new(store.clone(), config.tests_dir()));
        let pipeline = Arc::new(Pipeline::new(store.clone(), runner.clone(), provisioner.clone(), config));
        Fixture {
            _dir: dir,
            store,
            runner,
            provisioner,
            pipeline,
        }
    }

    async fn project(store: &MemoryStore) -> Project {
        let project = Project {
            id: ProjectId::new(),
            name: "Triangle".into(),
            lang: "java".into(),
        };
        store.add_project(&project).await.unwrap();
        project
    }

    async fn submission(store: &MemoryStore, project: &Project, mode: Mode) -> Submission {
        let sub = Submission::new("student", project.id, mode, now_millis());
        store.add_submission(&sub).await.unwrap();
        sub
    }

    async fn source(store: &MemoryStore, sub: &Submission, number: u64) -> File {
        let file = File {
            id: FileId::new(),
            submission: sub.id,
            number,
            name: "Triangle.java".into(),
            package: "shapes".into(),
            kind: FileType::Source,
            modification: Modification::Saved,
            time: now_millis(),
            data: b"class Triangle {}".to_vec(),
            results: BTreeMap::new(),
        };
        store.add_file(&file).await.unwrap();
        file
    }

    async fn add_tests(fx: &Fixture, project: &Project) {
        let sub = submission(&fx.store, project, Mode::ArchiveTest).await;
        let mut bundle = File::archive(sub.id, 0, make_zip(&[("testing/AllTests.java", b"class AllTests {}")]));
        bundle.kind = FileType::Test;
        fx.store.add_file(&bundle).await.unwrap();
        fx.pipeline.process(bundle).await.unwrap();
    }

    #[tokio::test]
    async fn test_source_runs_compile_lint_test_in_order() {
        let fx = fixture(FakeRunner::new());
        let project = project(&fx.store).await;
        add_tests(&fx, &project).await;
        let sub = submission(&fx.store, &project, Mode::FileRemote).await;
        let file = source(&fx.store, &sub, 0).await;

        let results = fx.pipeline.process(file.clone()).await.unwrap();

        assert_eq!(fx.runner.programs(), vec!["javac", "lint", "junit"]);
        assert!(results.iter().all(|r| r.is_success()));
        let stored = fx.store.file(&file.id).await.unwrap().unwrap();
        let tools: Vec<&str> = stored.results.keys().map(String::as_str).collect();
        assert_eq!(tools, vec!["javac", "junit", "lint"]);

        let junit = &fx.runner.calls()[2];
        assert!(junit.args.iter().any(|a| a.ends_with(&project.id.to_string())));
        assert!(junit.args.contains(&"shapes.Triangle".to_string()));
    }

    #[tokio::test]
    async fn test_compile_failure_is_recorded_and_stops() {
        let fx = fixture(FakeRunner::new().fail(
            "javac",
            ProcessError::End {
                program: "javac".into(),
                message: "exited with status 1".into(),
                exit_code: Some(1),
            },
        ));
        let project = project(&fx.store).await;
        let sub = submission(&fx.store, &project, Mode::FileRemote).await;
        let file = source(&fx.store, &sub, 0).await;

        let results = fx.pipeline.process(file.clone()).await.unwrap();

        assert_eq!(fx.runner.programs(), vec!["javac"]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error.as_ref().map(|e| e.kind), Some(ToolErrorKind::End));
        let stored = fx.store.file(&file.id).await.unwrap().unwrap();
        assert_eq!(stored.results["javac"], results[0].id);
    }

    #[tokio::test]
    async fn test_recorded_compile_failure_still_stops() {
        let fx = fixture(FakeRunner::new());
        let project = project(&fx.store).await;
        let sub = submission(&fx.store, &project, Mode::FileRemote).await;
        let file = source(&fx.store, &sub, 0).await;
        let failed = ToolResult {
            id: ResultId::new(),
            file: file.id,
            tool: "javac".into(),
            stdout: Vec::new(),
            stderr: b"Triangle.java:1: error".to_vec(),
            error: Some(ToolError {
                kind: ToolErrorKind::End,
                message: "exited with status 1".into(),
            }),
            time: now_millis(),
        };
        fx.store.add_result(&failed).await.unwrap();
        let file = fx.store.file(&file.id).await.unwrap().unwrap();

        let results = fx.pipeline.process(file.clone()).await.unwrap();

        assert!(results.is_empty());
        assert!(fx.runner.calls().is_empty());
        let stored = fx.store.file(&file.id).await.unwrap().unwrap();
        assert_eq!(stored.results.len(), 1);
    }

    #[tokio::test]
    async fn test_recorded_compile_success_continues() {
        let fx = fixture(FakeRunner::new());
        let project = project(&fx.store).await;
        let sub = submission(&fx.store, &project, Mode::FileRemote).await;
        let file = source(&fx.store, &sub, 0).await;
        let compiled = ToolResult {
            id: ResultId::new(),
            file: file.id,
            tool: "javac".into(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            error: None,
            time: now_millis(),
        };
        fx.store.add_result(&compiled).await.unwrap();
        let file = fx.store.file(&file.id).await.unwrap().unwrap();

        fx.pipeline.process(file).await.unwrap();

        assert_eq!(fx.runner.programs(), vec!["lint"]);
    }

    #[tokio::test]
    async fn test_names_outside_the_staging_tree_are_refused() {
        let fx = fixture(FakeRunner::new());
        let project = project(&fx.store).await;
        let sub = submission(&fx.store, &project, Mode::FileRemote).await;
        let mut file = source(&fx.store, &sub, 0).await;
        file.name = "../../../outside/Pwn.java".into();
        file.package = String::new();

        assert!(fx.pipeline.process(file).await.unwrap().is_empty());
        assert!(fx.runner.calls().is_empty());

        let archive = File::archive(
            sub.id,
            1,
            make_zip(&[
                ("x\\..\\Pwn.java_1000000_0_c", b"class Pwn {}"),
                ("a-b_Pwn.java_2000000_1_c", b"class Pwn {}"),
                ("Triangle.java_3000000_2_c", b"class Triangle {}"),
            ]),
        );
        fx.store.add_file(&archive).await.unwrap();
        fx.pipeline.process(archive).await.unwrap();

        let names: Vec<String> = fx
            .store
            .files(&sub.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|f| f.kind == FileType::Source)
            .map(|f| format!("{}/{}", f.package, f.name))
            .collect();
        assert!(!names.iter().any(|n| n.contains("Pwn")), "{:?}", names);
        assert_eq!(fx.runner.programs(), vec!["javac", "lint"]);
        let root = fx._dir.path().parent().unwrap();
        assert!(!root.join("outside").join("Pwn.java").exists());
    }

    #[tokio::test]
    async fn test_tests_skipped_without_bundle() {
        let fx = fixture(FakeRunner::new());
        let project = project(&fx.store).await;
        let sub = submission(&fx.store, &project, Mode::FileRemote).await;
        let file = source(&fx.store, &sub, 0).await;

        fx.pipeline.process(file).await.unwrap();

        assert_eq!(fx.runner.programs(), vec!["javac", "lint"]);
        assert_eq!(fx.provisioner.unpack_count(), 0);
    }

    #[tokio::test]
    async fn test_non_source_files_are_only_stored() {
        let fx = fixture(FakeRunner::new());
        let project = project(&fx.store).await;
        let sub = submission(&fx.store, &project, Mode::FileRemote).await;
        let mut file = source(&fx.store, &sub, 0).await;
        file.kind = FileType::Change;

        assert!(fx.pipeline.process(file).await.unwrap().is_empty());
        assert!(fx.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_archive_is_expanded_in_order() {
        let fx = fixture(FakeRunner::new());
        let project = project(&fx.store).await;
        let sub = submission(&fx.store, &project, Mode::ArchiveRemote).await;
        let zip = make_zip(&[
            ("shapes_Triangle.java_2000000_1_c", b"class Triangle { int a; }"),
            ("shapes_Triangle.java_1000000_0_c", b"class Triangle {}"),
            ("notes.txt_3000000_2_c", b"todo"),
            ("garbage", b"?"),
        ]);
        let archive = File::archive(sub.id, 0, zip);
        fx.store.add_file(&archive).await.unwrap();

        let results = fx.pipeline.process(archive.clone()).await.unwrap();

        // Two sources, each compiled and linted
        assert_eq!(results.len(), 4);
        let files = fx.store.files(&sub.id).await.unwrap();
        let expanded: Vec<(u64, FileType)> = files
            .iter()
            .filter(|f| f.id != archive.id)
            .map(|f| (f.number, f.kind))
            .collect();
        assert_eq!(
            expanded,
            vec![(0, FileType::Source), (1, FileType::Source), (2, FileType::Change)]
        );

        // A second pass finds everything already stored
        let again = fx.pipeline.process(archive).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(fx.store.files(&sub.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_new_bundle_invalidates_provisioned_tests() {
        let fx = fixture(FakeRunner::new());
        let project = project(&fx.store).await;
        add_tests(&fx, &project).await;
        fx.provisioner.ensure(&project.id).await.unwrap();
        add_tests(&fx, &project).await;
        fx.provisioner.ensure(&project.id).await.unwrap();
        assert_eq!(fx.provisioner.unpack_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_provision_once() {
        let fx = fixture(FakeRunner::new());
        let project = project(&fx.store).await;
        add_tests(&fx, &project).await;

        let first = submission(&fx.store, &project, Mode::FileRemote).await;
        let second = submission(&fx.store, &project, Mode::FileRemote).await;
        let a = source(&fx.store, &first, 0).await;
        let b = source(&fx.store, &second, 0).await;

        let (handle, workers) = fx.pipeline.clone().start();
        handle.submit(a.clone()).await.unwrap();
        handle.submit(b.clone()).await.unwrap();
        drop(handle);
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(fx.provisioner.unpack_count(), 1);
        assert!(fx.provisioner.dir(&project.id).join("testing/AllTests.java").exists());
        for file in [a, b] {
            let stored = fx.store.file(&file.id).await.unwrap().unwrap();
            assert_eq!(stored.results.len(), 3);
            for id in stored.results.values() {
                assert!(fx.store.result(id).await.unwrap().unwrap().is_success());
            }
        }
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let fx = fixture(FakeRunner::new());
        let (handle, workers) = fx.pipeline.clone().start();
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }
        let file = File::archive(SubmissionId::new(), 0, vec![]);
        assert!(matches!(handle.submit(file).await, Err(PipelineError::Closed)));
    }
}
