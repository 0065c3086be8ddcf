//! Lease documents as files in a shared directory.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{LeaseBackend, LeaseError};

/// Stores each lease as `<dir>/<name>`.
///
/// Every write goes to a temporary file first. Exclusive creation then
/// hard-links it into place (which fails if the target exists) and
/// replacement renames it over the target, so readers only ever see a
/// complete document.
#[derive(Debug, Clone)]
pub struct FsLeaseBackend {
    dir: PathBuf,
}

impl FsLeaseBackend {
    /// Use `dir` for lease files, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LeaseError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn write_temp(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, LeaseError> {
        let temp = self
            .dir
            .join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(temp)
    }
}

impl LeaseBackend for FsLeaseBackend {
    fn create_new(&self, name: &str, bytes: &[u8]) -> Result<bool, LeaseError> {
        let temp = self.write_temp(name, bytes)?;
        let linked = fs::hard_link(&temp, self.path(name));
        let _ = fs::remove_file(&temp);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, LeaseError> {
        match fs::read(self.path(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn replace(&self, name: &str, bytes: &[u8]) -> Result<(), LeaseError> {
        let temp = self.write_temp(name, bytes)?;
        if let Err(e) = fs::rename(&temp, self.path(name)) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }

    fn quarantine(&self, name: &str, suffix: &str) -> Result<bool, LeaseError> {
        match fs::rename(self.path(name), self.path(&format!("{name}{suffix}"))) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn restore(&self, from: &str, to: &str) -> Result<bool, LeaseError> {
        match fs::hard_link(self.path(from), self.path(to)) {
            Ok(()) => {
                fs::remove_file(self.path(from))?;
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::AlreadyExists | ErrorKind::NotFound) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, name: &str) -> Result<bool, LeaseError> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
