//! Execution signals from workers back to the scheduler.
//!
//! In-process workers push through a [`SignalSender`]. Out-of-process
//! workers (or `grove signal`) drop one JSON file per signal into the
//! signals directory; the scheduler drains both on every tick.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{TaskId, WorkerId};
use crate::util::sanitize_component;
use crate::{glog_debug, glog_warn, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Worker picked up the workspace.
    Started,
    Success,
    Failure,
    /// Operator asked to withdraw the task.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSignal {
    pub task_id: TaskId,
    pub result: SignalKind,
    #[serde(default)]
    pub summary: Option<String>,
    /// Signals from a previous attempt's worker are ignored.
    #[serde(default)]
    pub worker: Option<WorkerId>,
    #[serde(default = "Utc::now")]
    pub sent_at: DateTime<Utc>,
}

impl ExecutionSignal {
    fn new(task_id: TaskId, result: SignalKind) -> Self {
        Self {
            task_id,
            result,
            summary: None,
            worker: None,
            sent_at: Utc::now(),
        }
    }

    pub fn started(task_id: impl Into<TaskId>) -> Self {
        Self::new(task_id.into(), SignalKind::Started)
    }

    pub fn success(task_id: impl Into<TaskId>, summary: impl Into<String>) -> Self {
        Self::new(task_id.into(), SignalKind::Success).with_summary(summary)
    }

    pub fn failure(task_id: impl Into<TaskId>, summary: impl Into<String>) -> Self {
        Self::new(task_id.into(), SignalKind::Failure).with_summary(summary)
    }

    pub fn cancel(task_id: impl Into<TaskId>) -> Self {
        Self::new(task_id.into(), SignalKind::Cancel)
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn from_worker(mut self, worker: WorkerId) -> Self {
        self.worker = Some(worker);
        self
    }
}

/// Cloneable handle for pushing signals into a running scheduler.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: Sender<ExecutionSignal>,
}

impl SignalSender {
    pub(crate) fn new(tx: Sender<ExecutionSignal>) -> Self {
        Self { tx }
    }

    pub fn send(&self, signal: ExecutionSignal) -> Result<()> {
        self.tx.send(signal).map_err(|_| Error::ChannelClosed)
    }

    pub fn started(&self, task_id: &TaskId) -> Result<()> {
        self.send(ExecutionSignal::started(task_id.clone()))
    }

    pub fn success(&self, task_id: &TaskId, summary: &str) -> Result<()> {
        self.send(ExecutionSignal::success(task_id.clone(), summary))
    }

    pub fn failure(&self, task_id: &TaskId, summary: &str) -> Result<()> {
        self.send(ExecutionSignal::failure(task_id.clone(), summary))
    }
}

/// Everything currently queued on the channel, without waiting.
pub(crate) fn drain_channel(rx: &Receiver<ExecutionSignal>) -> Vec<ExecutionSignal> {
    rx.try_iter().collect()
}

/// Write `signal` into `dir` atomically (temp file + rename).
pub fn write_signal_file(dir: &Path, signal: &ExecutionSignal) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let name = format!(
        "{}-{}-{}",
        signal.sent_at.format("%Y%m%dT%H%M%S%.6f"),
        sanitize_component(signal.task_id.as_str()),
        &Uuid::new_v4().simple().to_string()[..8]
    );
    let temp_path = dir.join(format!(".{}.tmp", name));
    let final_path = dir.join(format!("{}.json", name));
    fs::write(&temp_path, serde_json::to_string_pretty(signal)?)?;
    fs::rename(&temp_path, &final_path)?;
    glog_debug!("Signal file written: {}", final_path.display());
    Ok(final_path)
}

/// Read and remove every signal file in `dir`, oldest first.
///
/// Never fails: a file that cannot be read or parsed is moved aside to a
/// unique `*.bad` name and the rest of the directory is still drained.
pub fn drain_signal_files(dir: &Path) -> Vec<ExecutionSignal> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut paths: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect(),
        Err(e) => {
            glog_warn!("Cannot read signal directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };
    paths.sort();

    let mut signals = Vec::with_capacity(paths.len());
    for path in paths {
        let parsed = fs::read_to_string(&path)
            .map_err(Error::from)
            .and_then(|raw| serde_json::from_str::<ExecutionSignal>(&raw).map_err(Error::from));
        match parsed {
            Ok(signal) => {
                // Replays of a consumed signal are rejected by the status checks.
                if let Err(e) = fs::remove_file(&path) {
                    glog_warn!("Failed to remove signal file {}: {}", path.display(), e);
                }
                signals.push(signal);
            }
            Err(e) => {
                glog_warn!("Discarding bad signal file {}: {}", path.display(), e);
                quarantine(&path);
            }
        }
    }
    signals.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
    signals
}

/// Rename `path` to `<stem>.<random>.bad` so it is not read again.
fn quarantine(path: &Path) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let target = path.with_file_name(format!(
        "{}.{}.bad",
        stem,
        &Uuid::new_v4().simple().to_string()[..8]
    ));
    if let Err(e) = fs::rename(path, &target) {
        glog_warn!("Failed to quarantine signal file {}: {}", path.display(), e);
    }
}
