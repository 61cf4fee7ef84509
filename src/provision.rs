//! Test asset provisioning
//!
//! A project's test bundle is unpacked into `<tests_dir>/<project id>` the
//! first time any pipeline worker needs it. Provisioning is rare, so one
//! lock covers every project and unpacks are strictly serialized.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::models::ProjectId;
use crate::core::utils::extract_zip;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("project {0} has no test bundle")]
    NotFound(ProjectId),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("failed to unpack tests for project {project}: {message}")]
    Unpack { project: ProjectId, message: String },
}

pub struct TestProvisioner {
    store: Arc<dyn Store>,
    root: PathBuf,
    provisioned: Mutex<HashMap<ProjectId, bool>>,
    unpacks: AtomicUsize,
}

impl TestProvisioner {
    pub fn new(store: Arc<dyn Store>, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            root: root.into(),
            provisioned: Mutex::new(HashMap::new()),
            unpacks: AtomicUsize::new(0),
        }
    }

    pub fn dir(&self, project: &ProjectId) -> PathBuf {
        self.root.join(project.to_string())
    }

    /// Make sure the project's tests are unpacked and return their directory
    pub async fn ensure(&self, project: &ProjectId) -> Result<PathBuf, ProvisionError> {
        let mut provisioned = self.provisioned.lock().await;
        let dir = self.dir(project);
        if provisioned.get(project).copied().unwrap_or(false) {
            return Ok(dir);
        }

        let bundle = self
            .store
            .test_bundle(project)
            .await?
            .ok_or(ProvisionError::NotFound(*project))?;

        let target = dir.clone();
        let unpacked = tokio::task::spawn_blocking(move || unpack(&bundle, &target))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);

        match unpacked {
            Ok(count) => {
                self.unpacks.fetch_add(1, Ordering::SeqCst);
                provisioned.insert(*project, true);
                info!("Provisioned {} test files for project {} in {}", count, project, dir.display());
                Ok(dir)
            }
            Err(e) => {
                warn!("Provisioning project {} failed: {:#}", project, e);
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to clean up {}: {}", dir.display(), cleanup);
                    }
                }
                Err(ProvisionError::Unpack {
                    project: *project,
                    message: format!("{:#}", e),
                })
            }
        }
    }

    /// Forget a project's tests so the next caller unpacks the current bundle
    pub async fn invalidate(&self, project: &ProjectId) {
        self.provisioned.lock().await.remove(project);
    }

    /// Number of completed unpacks since startup
    pub fn unpack_count(&self) -> usize {
        self.unpacks.load(Ordering::SeqCst)
    }
}

fn unpack(bundle: &[u8], target: &Path) -> anyhow::Result<usize> {
    if target.exists() {
        std::fs::remove_dir_all(target)?;
    }
    std::fs::create_dir_all(target)?;
    extract_zip(Cursor::new(bundle), target)
}
