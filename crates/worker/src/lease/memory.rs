use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{LeaseBackend, LeaseError};

/// In-memory lease storage for tests.
#[derive(Debug, Default)]
pub struct MemoryLeaseBackend {
    docs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw bytes, bypassing exclusivity. Used to plant corrupt or
    /// foreign documents.
    pub fn insert_raw(&self, name: &str, bytes: &[u8]) {
        if let Ok(mut docs) = self.docs.lock() {
            docs.insert(name.to_string(), bytes.to_vec());
        }
    }

    /// Names of all stored documents, sorted.
    pub fn names(&self) -> Vec<String> {
        self.docs
            .lock()
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl LeaseBackend for MemoryLeaseBackend {
    fn create_new(&self, name: &str, bytes: &[u8]) -> Result<bool, LeaseError> {
        let mut docs = self.docs.lock().map_err(|_| LeaseError::Poisoned)?;
        if docs.contains_key(name) {
            return Ok(false);
        }
        docs.insert(name.to_string(), bytes.to_vec());
        Ok(true)
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, LeaseError> {
        let docs = self.docs.lock().map_err(|_| LeaseError::Poisoned)?;
        Ok(docs.get(name).cloned())
    }

    fn replace(&self, name: &str, bytes: &[u8]) -> Result<(), LeaseError> {
        let mut docs = self.docs.lock().map_err(|_| LeaseError::Poisoned)?;
        docs.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn quarantine(&self, name: &str, suffix: &str) -> Result<bool, LeaseError> {
        let mut docs = self.docs.lock().map_err(|_| LeaseError::Poisoned)?;
        match docs.remove(name) {
            Some(bytes) => {
                docs.insert(format!("{name}{suffix}"), bytes);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn restore(&self, from: &str, to: &str) -> Result<bool, LeaseError> {
        let mut docs = self.docs.lock().map_err(|_| LeaseError::Poisoned)?;
        if docs.contains_key(to) {
            return Ok(false);
        }
        match docs.remove(from) {
            Some(bytes) => {
                docs.insert(to.to_string(), bytes);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove(&self, name: &str) -> Result<bool, LeaseError> {
        let mut docs = self.docs.lock().map_err(|_| LeaseError::Poisoned)?;
        Ok(docs.remove(name).is_some())
    }
}
