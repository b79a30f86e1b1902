use crate::source::file_id::FileId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

/// Offset bookkeeping for one physical file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub path: PathBuf,
    /// Bytes handed to the spooler so far
    pub offset: u64,
    #[serde(default)]
    pub mtime: Option<DateTime<Utc>>,
    /// Last time the crawler matched this file
    pub last_seen: DateTime<Utc>,
    /// Number of truncations observed; a lower offset is only accepted with a higher generation
    #[serde(default)]
    pub generation: u64,
    /// Owned by a running harvester; never persisted
    #[serde(skip)]
    pub active: bool,
}

impl FileState {
    pub fn new(path: PathBuf, offset: u64, mtime: Option<DateTime<Utc>>) -> Self {
        Self {
            path,
            offset,
            mtime,
            last_seen: Utc::now(),
            generation: 0,
            active: false,
        }
    }
}

/// Per-file state shared between a harvester, the crawler and the registry writer
pub type SharedFileState = Arc<Mutex<FileState>>;

/// Live offsets of every file harvested during this run.
///
/// The outer lock is only taken to add or remove entries; harvesters update
/// their own entry through its per-file mutex.
#[derive(Debug, Clone, Default)]
pub struct OffsetTable {
    entries: Arc<RwLock<HashMap<FileId, SharedFileState>>>,
}

impl OffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) the entry for `id` and mark it active
    pub fn activate(&self, id: FileId, mut state: FileState) -> SharedFileState {
        state.active = true;
        let shared = Arc::new(Mutex::new(state));
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(id, shared.clone());
        }
        shared
    }

    pub fn entry(&self, id: &FileId) -> Option<SharedFileState> {
        self.entries.read().ok()?.get(id).cloned()
    }

    pub fn get(&self, id: &FileId) -> Option<FileState> {
        let entry = self.entry(id)?;
        let guard = entry.lock().ok()?;
        Some(guard.clone())
    }

    /// Copy of every entry, taking each per-file lock briefly
    pub fn snapshot(&self) -> Vec<(FileId, FileState)> {
        let entries: Vec<(FileId, SharedFileState)> = match self.entries.read() {
            Ok(entries) => entries.iter().map(|(id, s)| (*id, s.clone())).collect(),
            Err(_) => return Vec::new(),
        };

        entries
            .into_iter()
            .filter_map(|(id, shared)| shared.lock().ok().map(|s| (id, s.clone())))
            .collect()
    }

    /// Drop inactive entries whose offset has been captured in `flushed`
    pub fn remove_flushed(&self, flushed: &[(FileId, FileState)]) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        for (id, captured) in flushed {
            if captured.active {
                continue;
            }
            let unchanged = entries
                .get(id)
                .and_then(|shared| shared.lock().ok().map(|s| !s.active && *s == *captured))
                .unwrap_or(false);
            if unchanged {
                entries.remove(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
