use super::state::FileState;
use crate::source::file_id::FileId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry file '{path}' is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("registry file '{path}' has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("failed to write registry '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// On-disk form of the registry
#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    files: Vec<RegistryEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryEntry {
    #[serde(flatten)]
    id: FileId,
    #[serde(flatten)]
    state: FileState,
}

/// Durable mapping from file identity to the offset already shipped.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    files: HashMap<FileId, FileState>,
}

impl Registry {
    /// An empty registry that will be flushed to `path`
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            files: HashMap::new(),
        }
    }

    /// Read the registry at `path`. A missing file yields an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No registry found, starting empty");
                return Ok(Self::empty(path));
            }
            Err(e) => return Err(e.into()),
        };

        let stored: RegistryFile = serde_json::from_reader(BufReader::new(file))
            .map_err(|source| RegistryError::Corrupt {
                path: path.clone(),
                source,
            })?;

        if stored.version != CURRENT_VERSION {
            return Err(RegistryError::UnsupportedVersion {
                path,
                version: stored.version,
            });
        }

        let files: HashMap<FileId, FileState> = stored
            .files
            .into_iter()
            .map(|entry| (entry.id, entry.state))
            .collect();

        info!(
            path = %path.display(),
            files = files.len(),
            updated_at = %stored.updated_at,
            "Loaded registry"
        );

        Ok(Self { path, files })
    }

    /// Like [`Registry::load`], but an unreadable registry degrades to an empty one
    pub fn load_or_empty(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(&path) {
            Ok(registry) => registry,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable registry, starting empty");
                Self::empty(path)
            }
        }
    }

    /// Make sure the registry directory exists and is writable
    pub fn ensure_dir(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &FileId) -> Option<&FileState> {
        self.files.get(id)
    }

    /// Upsert an entry. A stored offset is never lowered here; use [`Registry::reset`]
    /// when a truncation has been detected.
    pub fn update(
        &mut self,
        id: FileId,
        offset: u64,
        path: &Path,
        mtime: Option<DateTime<Utc>>,
    ) -> bool {
        let now = Utc::now();
        match self.files.get_mut(&id) {
            Some(state) => {
                if offset < state.offset {
                    debug!(
                        file_id = %id,
                        stored = state.offset,
                        offered = offset,
                        "Refusing to lower registry offset without truncation"
                    );
                    return false;
                }
                state.offset = offset;
                state.path = path.to_path_buf();
                state.mtime = mtime;
                state.last_seen = now;
                true
            }
            None => {
                let mut state = FileState::new(path.to_path_buf(), offset, mtime);
                state.last_seen = now;
                self.files.insert(id, state);
                true
            }
        }
    }

    /// Record a truncation: the offset goes back to 0 and the generation advances
    pub fn reset(&mut self, id: FileId, generation: u64) {
        if let Some(state) = self.files.get_mut(&id) {
            state.offset = 0;
            state.generation = generation.max(state.generation + 1);
        }
    }

    /// Merge a live snapshot from the offset table
    pub fn apply(&mut self, id: FileId, live: &FileState) {
        if let Some(stored) = self.files.get(&id) {
            if live.generation > stored.generation {
                self.reset(id, live.generation);
            }
        }
        if self.update(id, live.offset, &live.path, live.mtime) {
            if let Some(stored) = self.files.get_mut(&id) {
                stored.last_seen = live.last_seen;
                stored.generation = live.generation;
            }
        }
    }

    /// Remove entries not seen within `max_age`, except those in `active`
    pub fn prune(&mut self, max_age: Duration, active: &[FileId]) -> usize {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };
        let before = self.files.len();
        self.files
            .retain(|id, state| active.contains(id) || state.last_seen >= cutoff);
        let removed = before - self.files.len();
        if removed > 0 {
            info!(removed, "Pruned stale registry entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FileId, &FileState)> {
        self.files.iter()
    }

    /// Atomically persist the table: write a temp file, sync it, rename over the old one
    pub fn flush(&self) -> Result<()> {
        let mut files: Vec<RegistryEntry> = self
            .files
            .iter()
            .map(|(id, state)| RegistryEntry {
                id: *id,
                state: state.clone(),
            })
            .collect();
        files.sort_by(|a, b| a.id.cmp(&b.id));

        let stored = RegistryFile {
            version: CURRENT_VERSION,
            updated_at: Utc::now(),
            files,
        };

        atomic_write(&self.path, &stored).map_err(|source| RegistryError::Write {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), files = self.files.len(), "Registry flushed");
        Ok(())
    }
}

fn atomic_write(path: &Path, stored: &RegistryFile) -> std::io::Result<()> {
    let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, stored)?;
    writer.flush()?;

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    Ok(())
}
