//! Persisted digest document

use super::{DigestError, UsageDigest};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Owns the digest file and serializes read-modify-write cycles on it
pub struct DigestStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DigestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read the document; a missing file is an empty digest
    pub fn try_load(&self) -> Result<UsageDigest, DigestError> {
        if !self.path.exists() {
            return Ok(UsageDigest::default());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| DigestError::Read {
            path: self.path.clone(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Read the document, treating any failure as an empty digest
    pub fn load(&self) -> UsageDigest {
        let _guard = self.guard();
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> UsageDigest {
        match self.try_load() {
            Ok(digest) => digest,
            Err(e) => {
                tracing::warn!("Resetting usage digest, could not load {:?}: {}", self.path, e);
                UsageDigest::default()
            }
        }
    }

    /// Write the document atomically
    pub fn save(&self, digest: &UsageDigest) -> Result<(), DigestError> {
        let _guard = self.guard();
        self.save_unlocked(digest)
    }

    fn save_unlocked(&self, digest: &UsageDigest) -> Result<(), DigestError> {
        let write_err = |source| DigestError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let content = serde_json::to_string_pretty(digest)?;
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "usage_digest.json".to_string());
        let tmp = self
            .path
            .with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        std::fs::write(&tmp, content).map_err(write_err)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(write_err(e));
        }

        tracing::debug!("Saved usage digest to {:?}", self.path);
        Ok(())
    }

    /// Load, transform and save while holding the store lock.
    ///
    /// `f` returns `Some` to replace the stored digest. The digest in effect
    /// afterwards is returned.
    pub fn update<F>(&self, f: F) -> Result<UsageDigest, DigestError>
    where
        F: FnOnce(&UsageDigest) -> Result<Option<UsageDigest>, DigestError>,
    {
        let _guard = self.guard();
        let current = self.load_unlocked();
        match f(&current)? {
            Some(replacement) => {
                self.save_unlocked(&replacement)?;
                Ok(replacement)
            }
            None => Ok(current),
        }
    }
}
