//! Filesystem persistence adapter.
//!
//! Each key is stored as `{base_path}/{sanitized-key}.json`. Writes go to a
//! temporary file that is synced and renamed over the target, so a reader
//! never observes a half-written record.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use jobtrack_core::{Error, PersistenceAdapter, Result};

/// Directory-backed key/value store.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `base_path`. The directory is created lazily
    /// on the first write.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", file_name_for(key)))
    }
}

/// Map a storage key to a safe file stem.
///
/// Anything outside `[A-Za-z0-9_-]` becomes `_`, so `jobtrack:scrape` is
/// stored as `jobtrack_scrape.json`.
fn file_name_for(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn storage_err(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::Storage(format!("{action}({}): {e}", path.display()))
}

impl PersistenceAdapter for FileStore {
    fn write(&self, key: &str, value: &str) -> Result<()> {
        let full_path = self.full_path(key);
        debug!(key, full_path = %full_path.display(), size = value.len(), "file_store: write");

        fs::create_dir_all(&self.base_path).map_err(|e| {
            warn!(base_path = %self.base_path.display(), error = %e, "file_store: create_dir_all failed");
            storage_err("create_dir_all", &self.base_path, e)
        })?;

        // Atomic write: temp file + rename
        let temp_path = full_path.with_extension("json.tmp");
        let mut file =
            fs::File::create(&temp_path).map_err(|e| storage_err("create", &temp_path, e))?;
        file.write_all(value.as_bytes())
            .map_err(|e| storage_err("write", &temp_path, e))?;
        file.sync_all()
            .map_err(|e| storage_err("sync", &temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, &full_path).map_err(|e| {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "file_store: rename failed");
            storage_err("rename", &full_path, e)
        })
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        let full_path = self.full_path(key);
        match fs::read_to_string(&full_path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err("read", &full_path, e)),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key);
        match fs::remove_file(&full_path) {
            Ok(()) => {
                debug!(key, "file_store: removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("remove", &full_path, e)),
        }
    }
}
