use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cursor::SyncCursor;
use crate::device::Device;
use crate::error::StateError;

/// Everything the sync engine persists between passes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStateData {
    /// Last device id handed out; local ids are always positive
    #[serde(default)]
    pub last_device_id: i64,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub cursors: Vec<SyncCursor>,
}

/// Device and cursor state, shared by every concurrent pass.
///
/// All mutations go through [`StateFile::transaction`], which runs against a
/// copy and only swaps it in once it has been written to disk. A failed
/// closure or a failed write leaves the previous state untouched.
#[derive(Debug)]
pub struct StateFile {
    path: Option<PathBuf>,
    data: Mutex<SyncStateData>,
}

impl StateFile {
    /// State that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(SyncStateData::default()),
        }
    }

    /// Open (or start) the state file at `path`.
    ///
    /// A leftover `.partial` file from an interrupted write is removed.
    pub fn open(path: &Path) -> Result<Self, StateError> {
        let partial = partial_path(path);
        if partial.exists() && std::fs::remove_file(&partial).is_ok() {
            warn!(path = %partial.display(), "removed partial state file");
        }

        let data = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| StateError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
            serde_json::from_str(&content).map_err(|e| StateError::ParseFailed {
                path: path.to_path_buf(),
                source: e,
            })?
        } else {
            SyncStateData::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            data: Mutex::new(data),
        })
    }

    /// Read a consistent view of the state
    pub fn read<T>(&self, f: impl FnOnce(&SyncStateData) -> T) -> T {
        f(&self.data.lock())
    }

    /// Apply `f` atomically: either all of its changes land, or none do
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut SyncStateData) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let mut guard = self.data.lock();
        let mut draft = guard.clone();
        let value = f(&mut draft)?;

        if let Some(path) = &self.path {
            write_atomically(path, &draft)?;
            debug!(path = %path.display(), "state persisted");
        }

        *guard = draft;
        Ok(value)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn write_atomically(path: &Path, data: &SyncStateData) -> Result<(), StateError> {
    let json = serde_json::to_string_pretty(data)?;
    let partial = partial_path(path);

    std::fs::write(&partial, json).map_err(|e| StateError::WriteFailed {
        path: partial.clone(),
        source: e,
    })?;
    std::fs::rename(&partial, path).map_err(|e| StateError::WriteFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use tempfile::tempdir;

    #[test]
    fn open_missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let state = StateFile::open(&dir.path().join("state.json")).unwrap();
        assert!(state.read(|d| d.devices.is_empty()));
    }

    #[test]
    fn transaction_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = StateFile::open(&path).unwrap();
        state
            .transaction(|d| {
                d.cursors.push(SyncCursor::zero(1, DeviceId(4)));
                d.cursors[0].episodes_timestamp = 99;
                Ok(())
            })
            .unwrap();

        let reopened = StateFile::open(&path).unwrap();
        assert_eq!(reopened.read(|d| d.cursors[0].episodes_timestamp), 99);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let state = StateFile::in_memory();
        let result: Result<(), _> = state.transaction(|d| {
            d.last_device_id = 10;
            Err(StateError::SystemUser(1))
        });

        assert!(result.is_err());
        assert_eq!(state.read(|d| d.last_device_id), 0);
    }

    #[test]
    fn open_cleans_up_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(dir.path().join("state.json.partial"), b"{ half").unwrap();

        StateFile::open(&path).unwrap();

        assert!(!dir.path().join("state.json.partial").exists());
    }

    #[test]
    fn corrupt_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            StateFile::open(&path),
            Err(StateError::ParseFailed { .. })
        ));
    }
}
