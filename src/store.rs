use std::{
    collections::BTreeMap,
    fs,
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::{
    consts::{KEYRING_SERVICE, STORE_KEY_ACCESS, STORE_KEY_USER},
    error::StoreError,
};

/// Key-value persistence that survives process restarts.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Read("Memory store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Write("Memory store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Write("Memory store lock poisoned".to_string()))?;
        entries.clear();
        Ok(())
    }
}

/// JSON object on disk, owner-readable only.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|error| StoreError::Read(format!("{}: {error}", self.path.display())))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content)
            .map_err(|error| StoreError::Corrupt(format!("{}: {error}", self.path.display())))
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|error| StoreError::Write(format!("create {parent:?}: {error}")))?;
        }
        let content = serde_json::to_string_pretty(entries)
            .map_err(|error| StoreError::Write(format!("serialize: {error}")))?;
        fs::write(&self.path, content)
            .map_err(|error| StoreError::Write(format!("{}: {error}", self.path.display())))?;
        restrict_file_permissions(&self.path);
        Ok(())
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Write("File store lock poisoned".to_string()))?;
        let mut entries = match self.read_all() {
            Ok(entries) => entries,
            Err(StoreError::Corrupt(detail)) => {
                tracing::warn!(%detail, "credential file corrupt, starting fresh");
                BTreeMap::new()
            }
            Err(error) => return Err(error),
        };
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Write("File store lock poisoned".to_string()))?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(StoreError::Write(format!(
                "{}: {error}",
                self.path.display()
            ))),
        }
    }
}

/// OS credential vault, one entry per key under a service name.
pub struct KeyringStore {
    service: String,
    keys: Vec<String>,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(KEYRING_SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            keys: vec![STORE_KEY_ACCESS.to_string(), STORE_KEY_USER.to_string()],
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new(&self.service, key)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entry = self
            .entry(key)
            .map_err(|error| StoreError::Read(format!("keyring entry {key}: {error}")))?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(StoreError::Read(format!("keyring entry {key}: {error}"))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)
            .and_then(|entry| entry.set_password(value))
            .map_err(|error| StoreError::Write(format!("keyring entry {key}: {error}")))
    }

    fn clear(&self) -> Result<(), StoreError> {
        for key in &self.keys {
            let entry = self
                .entry(key)
                .map_err(|error| StoreError::Write(format!("keyring entry {key}: {error}")))?;
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(error) => {
                    return Err(StoreError::Write(format!("keyring entry {key}: {error}")))
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn restrict_file_permissions(path: &Path) {
    if path.exists() {
        if let Err(error) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            tracing::debug!(?path, %error, "failed to restrict file permissions");
        }
    }
}
