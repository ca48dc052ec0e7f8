use crate::{Result, SnapshotStore, StateError};
use fleetsim_core::{PersistedState, STATE_FORMAT_VERSION};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Suffix of the previous-generation copy kept next to the state file
pub const BACKUP_SUFFIX: &str = ".bak";

/// Snapshot store backed by a single JSON file
///
/// Writes go to a temporary file in the same directory, are flushed to disk
/// and only then renamed over the target, so the committed file is always
/// either the old or the new generation. The previous generation is copied
/// to `<path>.bak` first.
pub struct FileStateStore {
    path: PathBuf,
    backup_path: PathBuf,
}

impl FileStateStore {
    /// Create a store for `path`, creating its parent directory if needed
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                StateError::io_error(
                    format!("Failed to create state directory {}: {}", parent.display(), e),
                    Some(Box::new(e)),
                )
            })?;
        }

        let mut backup = path.clone().into_os_string();
        backup.push(BACKUP_SUFFIX);

        info!("Using state file at: {}", path.display());

        Ok(Self {
            path,
            backup_path: PathBuf::from(backup),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    /// Copy the committed file to the backup slot.
    ///
    /// Only a parseable generation is copied, so a damaged primary never
    /// overwrites a good backup.
    fn backup_current(&self) {
        let current = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        if parse_snapshot(&current).is_err() {
            warn!(
                "Not backing up unreadable state file {}",
                self.path.display()
            );
            return;
        }
        if let Err(e) = fs::write(&self.backup_path, &current) {
            warn!(
                "Failed to write state backup {}: {}",
                self.backup_path.display(),
                e
            );
        }
    }
}

impl SnapshotStore for FileStateStore {
    fn save(&self, snapshot: &PersistedState) -> Result<()> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        let dir = self.dir();

        // Removed on drop unless persisted
        let mut tmp = tempfile::Builder::new()
            .prefix("state-")
            .suffix(".json.tmp")
            .tempfile_in(dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;

        self.backup_current();

        tmp.persist(&self.path)?;

        // Persist the rename itself; not every platform can open a directory
        if let Ok(d) = fs::File::open(dir) {
            let _ = d.sync_all();
        }

        debug!(
            clusters = snapshot.clusters.len(),
            ports = snapshot.proxy_ports.len(),
            "Saved fleet snapshot to {}",
            self.path.display()
        );
        Ok(())
    }

    fn load(&self) -> Result<PersistedState> {
        let primary = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No state file at {}, starting empty", self.path.display());
                return Ok(PersistedState::default());
            }
            Err(e) => return Err(e.into()),
        };

        let primary_err = match parse_snapshot(&primary) {
            Ok(state) => return Ok(state),
            Err(e) => e,
        };

        warn!(
            "State file {} is unreadable ({}), trying backup {}",
            self.path.display(),
            primary_err,
            self.backup_path.display()
        );

        let backup = fs::read(&self.backup_path).map_err(|e| {
            StateError::corrupt(self.path.display().to_string(), &primary_err, e.to_string())
        })?;

        match parse_snapshot(&backup) {
            Ok(state) => {
                warn!(
                    clusters = state.clusters.len(),
                    "Restored fleet snapshot from backup {}",
                    self.backup_path.display()
                );
                Ok(state)
            }
            Err(backup_err) => Err(StateError::corrupt(
                self.path.display().to_string(),
                primary_err,
                backup_err,
            )),
        }
    }
}

fn parse_snapshot(bytes: &[u8]) -> std::result::Result<PersistedState, String> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err("file is empty".to_string());
    }
    let state: PersistedState = fleetsim_core::from_json_slice(bytes).map_err(|e| e.to_string())?;
    if state.version != STATE_FORMAT_VERSION {
        warn!(
            "State file format version {} differs from {}, loading anyway",
            state.version, STATE_FORMAT_VERSION
        );
    }
    Ok(state)
}
