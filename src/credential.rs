//! Ephemeral secret material for a single job.
//!
//! The [`CredentialStore`] writes private keys and uploaded blobs to
//! uniquely named files and hands back a [`ScopedFile`] guard. The guard
//! deletes its file when released or dropped, so every exit path of the
//! owning job cleans up, including panics and early returns.

use crate::config::ServerConfig;
use crate::error::{ErrorContext, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Owner-only read/write/execute.
const SECRET_MODE: u32 = 0o700;

/// Handle to a materialized private key.
pub type KeyFileHandle = ScopedFile;

/// Creates job-owned secret files under restricted directories.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    key_dir: PathBuf,
    upload_dir: PathBuf,
}

impl CredentialStore {
    /// Create a store rooted at explicit directories.
    pub fn new(key_dir: impl Into<PathBuf>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
            upload_dir: upload_dir.into(),
        }
    }

    /// Create a store using the data directory layout from configuration.
    pub fn from_config(server: &ServerConfig) -> Self {
        Self::new(server.keyfile_dir(), server.upload_dir())
    }

    /// Create both directories; the key directory is restricted to its owner.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.key_dir)
            .with_context(|| format!("creating key directory {}", self.key_dir.display()))?;
        fs::set_permissions(&self.key_dir, fs::Permissions::from_mode(SECRET_MODE))?;
        fs::create_dir_all(&self.upload_dir)
            .with_context(|| format!("creating upload directory {}", self.upload_dir.display()))?;
        Ok(())
    }

    /// Write `private_key` to a fresh file, or return an empty handle when
    /// password authentication is used instead.
    pub fn materialize(&self, private_key: Option<&str>) -> Result<KeyFileHandle> {
        match private_key {
            Some(text) if !text.is_empty() => {
                let path = self.key_dir.join(Uuid::new_v4().simple().to_string());
                write_secret(&path, text.as_bytes())?;
                debug!(path = %path.display(), "Materialized private key");
                Ok(ScopedFile::new(path))
            }
            _ => Ok(ScopedFile::empty()),
        }
    }

    /// Stage uploaded bytes so they can be copied to remote hosts.
    pub fn stage_upload(&self, data: &[u8]) -> Result<ScopedFile> {
        let path = self.upload_dir.join(Uuid::new_v4().to_string());
        write_secret(&path, data)?;
        debug!(path = %path.display(), size = data.len(), "Staged upload");
        Ok(ScopedFile::new(path))
    }
}

/// Create `path` with owner-only permissions and write `data` to it.
pub(crate) fn write_secret(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(SECRET_MODE)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::set_permissions(path, fs::Permissions::from_mode(SECRET_MODE))?;
    Ok(())
}

/// A file that is deleted when the guard is released or dropped.
#[derive(Debug, Default)]
pub struct ScopedFile {
    path: Option<PathBuf>,
}

impl ScopedFile {
    /// Take ownership of an existing file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A handle that owns nothing.
    pub fn empty() -> Self {
        Self { path: None }
    }

    /// Path of the owned file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_none()
    }

    /// Delete the owned file. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(path) = self.path.take() {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Released scoped file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scoped file"),
            }
        }
    }
}

impl Drop for ScopedFile {
    fn drop(&mut self) {
        self.release();
    }
}
