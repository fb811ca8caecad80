//! Durable backing stores for the coordination registry.
//!
//! The default store is an append-only JSON-lines journal: every registry
//! write appends the full entry, and replay keeps the last line for each
//! `(task, attempt)`. Compaction rewrites the journal as a snapshot using
//! the temp-file + backup + rename sequence.
//!
//! A running scheduler and `grove compact` may share one journal, so every
//! append and every rewrite happens under a `<journal>.lock` file. Appends
//! reopen the journal when compaction has replaced it, and compaction
//! re-reads the file so records from other processes survive.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::core::TaskId;
use crate::error::Result;
use crate::registry::RegistryEntry;
use crate::{glog_debug, glog_warn};

/// Persistence seam behind [`super::CoordinationRegistry`].
pub trait RegistryStore: Send + Sync {
    /// Replay every persisted entry, one per `(task, attempt)`.
    fn load(&self) -> Result<Vec<RegistryEntry>>;

    /// Durably record the new state of one entry.
    fn append(&self, entry: &RegistryEntry) -> Result<()>;

    /// Replace the persisted log with a snapshot holding `entries` plus any
    /// newer records another writer persisted. Returns the records kept.
    fn compact(&self, entries: &[RegistryEntry]) -> Result<usize>;
}

/// Keep the last record per `(task, attempt)`, in first-seen order.
fn latest_per_attempt(records: Vec<RegistryEntry>) -> Vec<RegistryEntry> {
    let mut position: HashMap<(TaskId, u32), usize> = HashMap::new();
    let mut out: Vec<RegistryEntry> = Vec::new();
    for record in records {
        let key = (record.task_id.clone(), record.attempt);
        match position.get(&key) {
            Some(&i) => out[i] = record,
            None => {
                position.insert(key, out.len());
                out.push(record);
            }
        }
    }
    out
}

const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(2);
/// A lock this old was left behind by a crashed writer.
const LOCK_STALE: Duration = Duration::from_secs(30);

/// Cross-process guard; the lock file is removed on drop.
struct JournalLock {
    path: PathBuf,
}

impl JournalLock {
    fn acquire(journal: &Path) -> Result<Self> {
        let path = journal.with_extension("jsonl.lock");
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path) {
                        glog_warn!("Removing stale journal lock {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= LOCK_WAIT {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::WouldBlock,
                            format!("journal lock {} is held by another process", path.display()),
                        )
                        .into());
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn is_stale(path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age >= LOCK_STALE)
    }
}

impl Drop for JournalLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            glog_warn!("Failed to remove journal lock {}: {}", self.path.display(), e);
        }
    }
}

/// Whether `file` is still the file at `path`. False once a rename has
/// replaced the path or the path is gone.
#[cfg(unix)]
fn still_at_path(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(open), Ok(current)) => open.dev() == current.dev() && open.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_at_path(_file: &File, _path: &Path) -> bool {
    false
}

/// JSON-lines journal on disk.
pub struct JournalStore {
    path: PathBuf,
    writer: Mutex<Option<File>>,
}

impl JournalStore {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        glog_debug!("JournalStore::new path={}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_append(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?)
    }

    fn read_records(&self) -> Result<Vec<RegistryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;
        let last = lines.len().saturating_sub(1);

        let mut records = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RegistryEntry>(line) {
                Ok(entry) => records.push(entry),
                // A crash mid-append can leave a torn final line.
                Err(e) if i == last => {
                    glog_warn!("Ignoring truncated journal tail in {}: {}", self.path.display(), e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    }
}

impl RegistryStore for JournalStore {
    fn load(&self) -> Result<Vec<RegistryEntry>> {
        if !self.path.exists() {
            glog_debug!("Journal not found, starting empty");
            return Ok(Vec::new());
        }
        let entries = latest_per_attempt(self.read_records()?);
        glog_debug!("Journal replayed: {} entries", entries.len());
        Ok(entries)
    }

    fn append(&self, entry: &RegistryEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let _lock = JournalLock::acquire(&self.path)?;
        if guard.as_ref().is_some_and(|file| !still_at_path(file, &self.path)) {
            glog_debug!("Journal replaced on disk, reopening {}", self.path.display());
            *guard = None;
        }
        if guard.is_none() {
            *guard = Some(self.open_append()?);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(line.as_bytes())?;
            file.sync_data()?;
        }
        Ok(())
    }

    fn compact(&self, entries: &[RegistryEntry]) -> Result<usize> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let _lock = JournalLock::acquire(&self.path)?;
        *guard = None;

        // Records on disk are at least as new as the caller's view.
        let mut records = entries.to_vec();
        records.extend(self.read_records()?);
        let snapshot = latest_per_attempt(records);

        let mut contents = String::new();
        for entry in &snapshot {
            contents.push_str(&serde_json::to_string(entry)?);
            contents.push('\n');
        }

        if self.path.exists() {
            let backup_path = self.path.with_extension("jsonl.bak");
            glog_debug!("Creating journal backup: {}", backup_path.display());
            fs::copy(&self.path, &backup_path)?;
        }

        let temp_path = self.path.with_extension("jsonl.tmp");
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, &self.path)?;
        glog_debug!("Journal compacted to {} entries", snapshot.len());

        *guard = Some(self.open_append()?);
        Ok(snapshot.len())
    }
}

/// Non-durable store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<RegistryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes recorded so far.
    pub fn write_count(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl RegistryStore for MemoryStore {
    fn load(&self) -> Result<Vec<RegistryEntry>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(latest_per_attempt(records))
    }

    fn append(&self, entry: &RegistryEntry) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(())
    }

    fn compact(&self, entries: &[RegistryEntry]) -> Result<usize> {
        *self.records.lock().unwrap_or_else(|e| e.into_inner()) = entries.to_vec();
        Ok(entries.len())
    }
}
