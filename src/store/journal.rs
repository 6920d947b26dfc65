//! Durable log behind the result store.
//!
//! The store appends every state change here before it becomes visible,
//! so an acknowledged capture survives a crash. The log preserves
//! insertion order; replaying it from the top rebuilds the store.
//!
//! Persistence technology is a seam: races that need a file get the
//! JSON-lines [`FileLog`], tests get [`MemoryLog`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, TimingError};
use crate::types::{Bib, Racer, RecordId, ResultRecord, SubmissionState};

/// One appended store mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    /// A racer registered or re-registered (imports update in place).
    Racer(Racer),
    /// A record committed, with its full initial contents.
    Commit(ResultRecord),
    /// A racer assigned to an existing record.
    Assign { id: RecordId, bib: Bib },
    /// A submission-state transition.
    Transition { id: RecordId, state: SubmissionState, attempts: u32 },
    /// A correction: `old` superseded by the freshly committed `new`.
    Supersede { old: RecordId, new: ResultRecord },
    /// Reconciliation flagged a record for manual review.
    Review { id: RecordId },
}

/// Append-ordered durable storage for one race session.
#[async_trait::async_trait]
pub trait DurableLog: Send + Sync + 'static {
    /// Append one entry; must be durable before returning.
    async fn append(&self, entry: &LogEntry) -> Result<()>;

    /// All entries in append order, for rebuilding the store on open.
    async fn replay(&self) -> Result<Vec<LogEntry>>;
}

/// JSON-lines log file, one entry per line.
pub struct FileLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLog {
    /// Open (or create) the log file at `path`.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await
            .map_err(|e| TimingError::storage(format!("open {}", path.display()), Box::new(e)))?;
        Ok(FileLog { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl DurableLog for FileLog {
    async fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| TimingError::storage("journal append", Box::new(e)))?;
        // The commit contract is durability, not buffering.
        file.sync_data()
            .await
            .map_err(|e| TimingError::storage("journal sync", Box::new(e)))?;
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<LogEntry>> {
        let file = File::open(&self.path)
            .await
            .map_err(|e| TimingError::storage(format!("replay {}", self.path.display()), Box::new(e)))?;

        let mut entries = Vec::new();
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| TimingError::storage("journal read", Box::new(e)))?
        {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        debug!(entries = entries.len(), path = %self.path.display(), "replayed journal");
        Ok(entries)
    }
}

/// In-memory log for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryLog {
    entries: std::sync::Mutex<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DurableLog for MemoryLog {
    async fn append(&self, entry: &LogEntry) -> Result<()> {
        self.entries.lock().expect("journal lock poisoned").push(entry.clone());
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<LogEntry>> {
        Ok(self.entries.lock().expect("journal lock poisoned").clone())
    }
}
