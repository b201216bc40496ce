use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use checkin_common::identity::SessionIdentity;

use crate::security::{remove_file_if_exists, write_private_file};

/// Durable home of the signed-in identity.
pub trait IdentityStorage: Send + Sync {
    /// `Ok(None)` when nothing is stored. A stored record that cannot be
    /// read back is an error.
    fn load(&self) -> Result<Option<SessionIdentity>>;
    fn save(&self, identity: &SessionIdentity) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Identity persisted as one JSON file, readable only by the owner.
#[derive(Debug, Clone)]
pub struct FileIdentityStorage {
    path: PathBuf,
}

impl FileIdentityStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStorage for FileIdentityStorage {
    fn load(&self) -> Result<Option<SessionIdentity>> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error).with_context(|| format!("failed to read `{}`", self.path.display()))
            }
        };
        let identity = serde_json::from_slice(&contents)
            .with_context(|| format!("corrupt identity record in `{}`", self.path.display()))?;
        Ok(Some(identity))
    }

    fn save(&self, identity: &SessionIdentity) -> Result<()> {
        let contents = serde_json::to_vec_pretty(identity).context("failed to serialize identity")?;
        write_private_file(&self.path, &contents)
    }

    fn clear(&self) -> Result<()> {
        remove_file_if_exists(&self.path)
    }
}

/// In-process storage, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryIdentityStorage {
    record: Mutex<Option<String>>,
}

impl MemoryIdentityStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored record, as it would appear on disk.
    pub fn raw(&self) -> Option<String> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_raw(&self, record: impl Into<String>) {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.into());
    }
}

impl IdentityStorage for MemoryIdentityStorage {
    fn load(&self) -> Result<Option<SessionIdentity>> {
        match self.raw() {
            Some(record) => serde_json::from_str(&record).map(Some).context("corrupt identity record"),
            None => Ok(None),
        }
    }

    fn save(&self, identity: &SessionIdentity) -> Result<()> {
        let record = serde_json::to_string(identity).context("failed to serialize identity")?;
        self.set_raw(record);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}

impl<S: IdentityStorage + ?Sized> IdentityStorage for std::sync::Arc<S> {
    fn load(&self) -> Result<Option<SessionIdentity>> {
        (**self).load()
    }

    fn save(&self, identity: &SessionIdentity) -> Result<()> {
        (**self).save(identity)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_storage_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileIdentityStorage::new(tmp.path().join("nested").join("session.json"));
        assert!(storage.load().unwrap().is_none());

        let identity = SessionIdentity::new("staff01").with_field("email", "staff01@example.com");
        storage.save(&identity).unwrap();
        assert_eq!(storage.load().unwrap(), Some(identity));

        storage.clear().unwrap();
        assert!(storage.load().unwrap().is_none());
        assert!(!storage.path().exists());
    }

    #[test]
    fn clear_without_record_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileIdentityStorage::new(tmp.path().join("session.json"));
        storage.clear().unwrap();
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.json");
        fs::write(&path, "{not json").unwrap();

        let error = FileIdentityStorage::new(&path).load().unwrap_err();
        assert!(format!("{error:#}").contains("corrupt identity record"));
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let storage = FileIdentityStorage::new(tmp.path().join("session.json"));
        storage.save(&SessionIdentity::new("staff01")).unwrap();

        let mode = fs::metadata(storage.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn memory_storage_round_trip() {
        let storage = MemoryIdentityStorage::new();
        let identity = SessionIdentity::new("staff02");
        storage.save(&identity).unwrap();
        assert_eq!(storage.load().unwrap(), Some(identity));
        storage.clear().unwrap();
        assert_eq!(storage.raw(), None);
    }
}
