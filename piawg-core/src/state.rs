//! Persisted on-disk state
//!
//! The reconciler is a short-lived process; everything that must survive
//! between invocations (auth token, region cache, keypair, port-forward
//! lease, last run record) lives as a separate versioned JSON file under
//! one state directory. Files are written atomically (temp + rename) with
//! mode 0600 so a crash mid-write can never leave a corrupt or
//! world-readable artifact. Losing any file only forces re-derivation on
//! the next run, so corrupt or stale-format files are discarded rather
//! than treated as fatal.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// Format version stamped into every state file
pub const STATE_VERSION: u32 = 1;

/// Current time as unix seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Handle to the fixed state directory
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory if needed, owner-only access
    pub fn ensure(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::set_permissions(&self.root, fs::Permissions::from_mode(0o700))?;
        Ok(())
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Load a state file. Missing, unreadable, or unparsable files all
    /// come back as `None`; prior state is a cache, never a dependency.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.path(name);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = name, "no stored state");
                return None;
            }
            Err(e) => {
                warn!(file = name, error = %e, "failed to read state file, discarding");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(file = name, error = %e, "corrupt state file, discarding");
                None
            }
        }
    }

    /// Atomically replace a state file with mode 0600
    pub fn store<T: Serialize>(&self, name: &str, value: &T) -> std::io::Result<()> {
        self.ensure()?;
        let path = self.path(name);
        let tmp = self.path(&format!("{name}.tmp"));

        let contents = serde_json::to_vec_pretty(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        file.write_all(&contents)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        debug!(file = name, "state file written");
        Ok(())
    }

    /// Write raw bytes (used for non-JSON artifacts like the provider CA)
    pub fn store_raw(&self, name: &str, contents: &[u8]) -> std::io::Result<()> {
        self.ensure()?;
        let tmp = self.path(&format!("{name}.tmp"));
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, self.path(name))?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> std::io::Result<()> {
        match fs::remove_file(self.path(name)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Write a file outside the state dir (the wg-quick config artifact)
/// with the same atomic temp + rename and 0600 discipline.
pub fn write_restricted(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}
