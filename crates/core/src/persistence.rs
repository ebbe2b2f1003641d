//! Small JSON state files that survive restarts.
//!
//! Missing or corrupt files load as `None` so a bad file never blocks startup;
//! writes go to a sibling temp file first and are renamed into place.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Typed handle on one JSON file.
#[derive(Debug, Clone)]
pub struct JsonStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned,
{
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads the stored value.
    ///
    /// Returns `None` when the file is missing or cannot be parsed.
    #[must_use]
    pub fn load(&self) -> Option<T> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No state file found, starting fresh");
            return None;
        }
        match self.load_raw() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to load state file, starting fresh"
                );
                None
            }
        }
    }

    /// Loads without the missing/corrupt fallback.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or parsed.
    pub fn load_raw(&self) -> Result<T, PersistenceError> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Writes `value`, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns an error if the directory, temp file or rename fails.
    pub fn save(&self, value: &T) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, value)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), "Saved state file");
        Ok(())
    }

    /// Deletes the file if it exists.
    ///
    /// # Errors
    /// Returns an error if removal fails.
    pub fn clear(&self) -> Result<(), PersistenceError> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            debug!(path = %self.path.display(), "Cleared state file");
        }
        Ok(())
    }
}
