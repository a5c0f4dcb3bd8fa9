//! Persistent agent identity.
//!
//! The commander assigns each agent a UUID with `SET_UUID`; the agent keeps
//! it as the whole text content of one file so it survives restarts. No file
//! means no identity (the nil UUID).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Failures reading or writing the identity file.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("cannot read agent UUID file {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("agent UUID file {} does not hold a valid UUID: {source}", .path.display())]
    Parse { path: PathBuf, source: uuid::Error },

    #[error("cannot write agent UUID file {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("cannot delete agent UUID file {}: {source}", .path.display())]
    Delete { path: PathBuf, source: io::Error },
}

/// The identity file on disk.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted UUID, or the nil UUID when no file exists.
    ///
    /// A file that exists but cannot be read or parsed is an error.
    pub fn load(&self) -> Result<Uuid, IdentityError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Uuid::nil()),
            Err(source) => {
                return Err(IdentityError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        info!(path = %self.path.display(), "Reading agent UUID file");
        Uuid::parse_str(text.trim()).map_err(|source| IdentityError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Persist `id`, replacing any previous identity.
    pub fn store(&self, id: Uuid) -> Result<(), IdentityError> {
        info!(path = %self.path.display(), %id, "Creating agent UUID file");
        let write_err = |source| IdentityError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(&self.path, id.hyphenated().to_string()).map_err(write_err)
    }

    /// Remove the identity file. Returns whether a file was actually removed.
    pub fn delete(&self) -> Result<bool, IdentityError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Deleted agent UUID file");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(IdentityError::Delete {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_nil_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("agent.uuid"));
        assert!(store.load().unwrap().is_nil());
    }

    #[test]
    fn stored_identity_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/agent.uuid");
        let id = Uuid::new_v4();

        IdentityStore::new(&path).store(id).unwrap();

        // a fresh store, as after a restart
        let reloaded = IdentityStore::new(&path);
        assert_eq!(reloaded.load().unwrap(), id);
        assert_eq!(reloaded.load().unwrap(), id);
        assert_eq!(fs::read_to_string(&path).unwrap(), id.to_string());
    }

    #[test]
    fn store_overwrites_previous_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("agent.uuid"));
        store.store(Uuid::new_v4()).unwrap();
        let second = Uuid::new_v4();
        store.store(second).unwrap();
        assert_eq!(store.load().unwrap(), second);
    }

    #[test]
    fn tolerates_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.uuid");
        let id = Uuid::new_v4();
        fs::write(&path, format!("{id}\n")).unwrap();
        assert_eq!(IdentityStore::new(path).load().unwrap(), id);
    }

    #[test]
    fn garbage_content_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.uuid");
        fs::write(&path, "not-a-uuid").unwrap();
        assert!(matches!(
            IdentityStore::new(path).load(),
            Err(IdentityError::Parse { .. })
        ));
    }

    #[test]
    fn delete_reports_whether_anything_was_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("agent.uuid"));
        store.store(Uuid::new_v4()).unwrap();

        assert!(store.delete().unwrap());
        assert!(!store.delete().unwrap());
        assert!(store.load().unwrap().is_nil());
    }
}
