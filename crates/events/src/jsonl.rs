//! Append-only JSON-lines file shared by the audit and error sinks.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::audit::AuditError;

#[derive(Debug)]
pub(crate) struct JsonlFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlFile {
    /// Open `path` for appending, creating parent directories as needed.
    pub(crate) fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `value` and append it as a single line.
    ///
    /// The line is written with one `write_all` so concurrent processes
    /// appending to the same file do not interleave within a record.
    pub(crate) fn append<T: Serialize>(&self, value: &T) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = self.file.lock().map_err(|_| AuditError::Poisoned)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}
