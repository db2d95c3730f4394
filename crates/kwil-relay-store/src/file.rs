//! JSON file snapshot store.
//!
//! Writes go to `<file>.tmp`, are fsynced, then renamed over the live file,
//! after which the parent directory is fsynced so the rename itself is
//! durable.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use kwil_relay_types::{RelayError, Result};

use crate::{LedgerSnapshot, SnapshotStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "ledger.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_temp(&self, temp_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = File::create(temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<LedgerSnapshot>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(RelayError::Ledger(format!(
                    "read ledger {} failed: {}",
                    self.path.display(),
                    err
                )));
            }
        };
        let snapshot = serde_json::from_slice::<LedgerSnapshot>(&bytes).map_err(|err| {
            RelayError::Ledger(format!(
                "parse ledger {} failed: {}",
                self.path.display(),
                err
            ))
        })?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        if let Some(parent) = &parent {
            fs::create_dir_all(parent).map_err(|err| {
                RelayError::Ledger(format!(
                    "create ledger dir {} failed: {}",
                    parent.display(),
                    err
                ))
            })?;
        }

        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|err| RelayError::Ledger(format!("serialize ledger failed: {}", err)))?;

        let temp_path = self.temp_path();
        if let Err(err) = self.write_temp(&temp_path, &bytes) {
            let _ = fs::remove_file(&temp_path);
            return Err(RelayError::Ledger(format!(
                "write ledger temp {} failed: {}",
                temp_path.display(),
                err
            )));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(RelayError::Ledger(format!(
                "rename ledger temp {} -> {} failed: {}",
                temp_path.display(),
                self.path.display(),
                err
            )));
        }

        #[cfg(unix)]
        {
            let dir = parent.unwrap_or_else(|| PathBuf::from("."));
            File::open(&dir)
                .and_then(|d| d.sync_all())
                .map_err(|err| {
                    RelayError::Ledger(format!(
                        "sync ledger dir {} failed: {}",
                        dir.display(),
                        err
                    ))
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{batch, tx_info};
    use crate::Ledger;

    #[test]
    fn test_missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::load(dir.path().join("state.json")).unwrap();
        assert!(ledger.is_empty());
        assert_eq!(ledger.last_synced_height(), 0);
    }

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut ledger = Ledger::load(&path).unwrap();
        ledger.append(batch(3)).unwrap();
        ledger.append(batch(4)).unwrap();
        ledger.mark_result(3, tx_info(0)).unwrap();
        drop(ledger);

        assert!(!dir.path().join("nested").join("state.json.tmp").exists());

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["lastBlock"], 4);
        assert_eq!(raw["pending"], serde_json::json!([3, 4]));
        assert_eq!(raw["rewards"][0]["result"]["accountNonce"], 7);

        let reloaded = Ledger::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.record(3).unwrap().result, Some(tx_info(0)));
    }

    #[test]
    fn test_corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{\"lastBlock\": 1, \"rewa").unwrap();

        let err = Ledger::load(&path).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_failed_rename_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in the target's place makes the rename fail.
        let path = dir.path().join("state.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        let store = FileSnapshotStore::new(&path);
        let err = store.save(&LedgerSnapshot::default()).unwrap_err();

        assert!(err.is_fatal());
        assert!(!store.temp_path().exists());
    }
}
