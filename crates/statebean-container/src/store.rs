//! Secondary storage for passivated contexts.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::SessionId;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current encoding of [`PassivatedState`].
pub const PASSIVATION_FORMAT: u16 = 1;

/// What gets written when a context is passivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassivatedState {
    pub format: u16,
    /// Context version at passivation time
    pub version: u64,
    pub bean_state: Value,
}

impl PassivatedState {
    pub fn new(version: u64, bean_state: Value) -> Self {
        Self {
            format: PASSIVATION_FORMAT,
            version,
            bean_state,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let state: PassivatedState = serde_json::from_slice(data)?;
        if state.format != PASSIVATION_FORMAT {
            return Err(BeanError::Passivation(format!(
                "unsupported passivation format {}",
                state.format
            )));
        }
        Ok(state)
    }
}

/// Byte store keyed by session id.
///
/// `delete` of a missing id succeeds; `load` of a missing id fails with
/// `Passivation`.
pub trait PassivationStore: Send + Sync {
    fn store(&self, id: SessionId, data: &[u8]) -> Result<()>;

    fn load(&self, id: SessionId) -> Result<Vec<u8>>;

    fn delete(&self, id: SessionId) -> Result<()>;

    fn contains(&self, id: SessionId) -> bool;

    fn clear(&self) -> Result<()>;
}

/// In-memory store, the default when no passivation directory is configured.
#[derive(Debug, Default)]
pub struct MemoryPassivationStore {
    entries: Mutex<HashMap<SessionId, Vec<u8>>>,
}

impl MemoryPassivationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl PassivationStore for MemoryPassivationStore {
    fn store(&self, id: SessionId, data: &[u8]) -> Result<()> {
        self.entries.lock().insert(id, data.to_vec());
        Ok(())
    }

    fn load(&self, id: SessionId) -> Result<Vec<u8>> {
        self.entries
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| BeanError::Passivation(format!("no passivated state for {}", id)))
    }

    fn delete(&self, id: SessionId) -> Result<()> {
        self.entries.lock().remove(&id);
        Ok(())
    }

    fn contains(&self, id: SessionId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }
}

/// One `<session id>.json` file per passivated context.
#[derive(Debug)]
pub struct FilePassivationStore {
    dir: PathBuf,
}

impl FilePassivationStore {
    /// Opens (creating if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            BeanError::Deployment(format!(
                "cannot create passivation directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        debug!("Passivation store opened at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl PassivationStore for FilePassivationStore {
    fn store(&self, id: SessionId, data: &[u8]) -> Result<()> {
        // Write then rename so a crash never leaves a truncated file behind
        let tmp = self.dir.join(format!("{}.json.tmp", id));
        fs::write(&tmp, data)
            .and_then(|_| fs::rename(&tmp, self.path(id)))
            .map_err(|e| BeanError::Passivation(format!("cannot write state of {}: {}", id, e)))
    }

    fn load(&self, id: SessionId) -> Result<Vec<u8>> {
        fs::read(self.path(id))
            .map_err(|e| BeanError::Passivation(format!("cannot read state of {}: {}", id, e)))
    }

    fn delete(&self, id: SessionId) -> Result<()> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BeanError::Passivation(format!(
                "cannot delete state of {}: {}",
                id, e
            ))),
        }
    }

    fn contains(&self, id: SessionId) -> bool {
        self.path(id).is_file()
    }

    fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_state = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".json") || n.ends_with(".json.tmp"))
                .unwrap_or(false);
            if is_state {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
