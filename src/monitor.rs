//! In-flight submission monitor
//!
//! Tracks which submissions are being processed right now. The active set
//! is loaded from `<base_dir>/<file_name>` at startup, flushed periodically
//! while it changes, and flushed one last time when shutdown is signalled,
//! so an external tool can find work that was interrupted.
//!
//! All events travel through one ordered channel, so a `done` can never be
//! applied before the `busy` it pairs with.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::models::SubmissionId;
use crate::shutdown::Shutdown;

enum Event {
    Busy(SubmissionId),
    Done(SubmissionId),
    Snapshot(oneshot::Sender<BTreeSet<SubmissionId>>),
}

#[derive(Debug, Clone)]
pub struct MonitorHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl MonitorHandle {
    pub fn busy(&self, id: SubmissionId) {
        if self.tx.send(Event::Busy(id)).is_err() {
            warn!("Monitor stopped, submission {} not tracked", id);
        }
    }

    pub fn done(&self, id: SubmissionId) {
        if self.tx.send(Event::Done(id)).is_err() {
            debug!("Monitor stopped before submission {} finished", id);
        }
    }

    /// Mark a submission busy until the returned guard is dropped
    pub fn track(&self, id: SubmissionId) -> ActiveGuard {
        self.busy(id);
        ActiveGuard {
            handle: self.clone(),
            id,
        }
    }

    /// Current active set, empty once the monitor has stopped
    pub async fn snapshot(&self) -> BTreeSet<SubmissionId> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Event::Snapshot(tx)).is_err() {
            return BTreeSet::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn is_active(&self, id: &SubmissionId) -> bool {
        self.snapshot().await.contains(id)
    }
}

/// Marks its submission done on drop
#[derive(Debug)]
pub struct ActiveGuard {
    handle: MonitorHandle,
    id: SubmissionId,
}

impl ActiveGuard {
    pub fn id(&self) -> SubmissionId {
        self.id
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.handle.done(self.id);
    }
}

pub struct Monitor {
    path: PathBuf,
    flush_interval: Duration,
    /// Submission -> number of sessions working on it. Entries reloaded
    /// at start have no session and leave on their first `done`.
    active: HashMap<SubmissionId, usize>,
    dirty: bool,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Monitor {
    /// Create a monitor seeded with the set persisted at `path`
    pub fn load(path: impl Into<PathBuf>, flush_interval: Duration) -> anyhow::Result<(Self, MonitorHandle)> {
        let path = path.into();
        let active = read_active(&path)?;
        if !active.is_empty() {
            warn!(
                "{} submissions were still active at last shutdown: {:?}",
                active.len(),
                active
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            path,
            flush_interval,
            // Left over from the last run with no live session behind them
            active: active.into_iter().map(|id| (id, 0)).collect(),
            dirty: false,
            rx,
        };
        Ok((monitor, MonitorHandle { tx }))
    }

    pub fn active(&self) -> BTreeSet<SubmissionId> {
        self.active.keys().copied().collect()
    }

    /// Process events until shutdown, then flush and return the final set
    pub async fn run(mut self, mut shutdown: Shutdown) -> BTreeSet<SubmissionId> {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.apply(event),
                    None => break,
                },
                _ = ticker.tick() => {
                    if self.dirty {
                        self.flush().await;
                    }
                }
                _ = shutdown.wait() => {
                    info!("Monitor received shutdown signal");
                    break;
                }
            }
        }

        // Events sent before the signal still count
        while let Ok(event) = self.rx.try_recv() {
            self.apply(event);
        }
        self.flush().await;
        self.active()
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::Busy(id) => {
                *self.active.entry(id).or_insert(0) += 1;
                self.dirty = true;
                debug!("Submission {} busy", id);
            }
            Event::Done(id) => {
                if let Some(count) = self.active.get_mut(&id) {
                    if *count <= 1 {
                        self.active.remove(&id);
                    } else {
                        *count -= 1;
                    }
                    self.dirty = true;
                    debug!("Submission {} done", id);
                }
            }
            Event::Snapshot(reply) => {
                let _ = reply.send(self.active());
            }
        }
    }

    /// Failures are logged, the loop keeps running
    async fn flush(&mut self) {
        let path = self.path.clone();
        let active = self.active();
        let written = tokio::task::spawn_blocking(move || write_active(&path, &active))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);
        match written {
            Ok(()) => {
                self.dirty = false;
                debug!("Flushed {} active submissions to {}", self.active.len(), self.path.display());
            }
            Err(e) => error!("Failed to persist active submissions: {:#}", e),
        }
    }
}

fn read_active(path: &Path) -> anyhow::Result<BTreeSet<SubmissionId>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    if content.trim().is_empty() {
        return Ok(BTreeSet::new());
    }
    let map: BTreeMap<SubmissionId, bool> = serde_json::from_str(&content)
        .with_context(|| format!("Malformed active submission file {}", path.display()))?;
    Ok(map.into_iter().filter(|(_, busy)| *busy).map(|(id, _)| id).collect())
}

fn write_active(path: &Path, active: &BTreeSet<SubmissionId>) -> anyhow::Result<()> {
    let map: BTreeMap<String, bool> = active.iter().map(|id| (id.to_string(), true)).collect();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, &map)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}
