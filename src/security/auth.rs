//! Authentication backends
//!
//! Backends are tried in order at login. Write operations default to
//! [`AuthError::ReadOnly`] so a read-only backend is simply skipped when the
//! security manager looks for one that can apply a change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use super::User;

/// First uid handed to users created through the bridge
const FIRST_UID: u32 = 1000;

/// Backend errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Backend {0} is read-only")]
    ReadOnly(String),

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("User already exists: {0}")]
    UserExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("{0}")]
    Other(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// A source of user identities
pub trait AuthBackend {
    fn name(&self) -> &str;

    /// The user, if `username` and `password` match
    fn login(&self, username: &str, password: &str) -> AuthResult<Option<User>>;

    fn create_user(&mut self, _username: &str, _password: &str, _privileged: bool) -> AuthResult<()> {
        Err(AuthError::ReadOnly(self.name().to_string()))
    }

    fn remove_user(&mut self, _username: &str) -> AuthResult<()> {
        Err(AuthError::ReadOnly(self.name().to_string()))
    }

    fn set_priv(&mut self, _username: &str, _privileged: bool) -> AuthResult<()> {
        Err(AuthError::ReadOnly(self.name().to_string()))
    }

    fn set_password(&mut self, _username: &str, _password: &str) -> AuthResult<()> {
        Err(AuthError::ReadOnly(self.name().to_string()))
    }
}

/// One user as stored in the user file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub uid: u32,
    pub home: String,
    #[serde(default)]
    pub boot_option: u8,
    #[serde(default)]
    pub privileged: bool,
}

impl UserRecord {
    fn to_user(&self) -> User {
        User::new(&self.username, self.uid, self.home.clone())
            .with_boot_option(self.boot_option)
            .with_privileged(self.privileged)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserFile {
    #[serde(default)]
    users: Vec<UserRecord>,
}

/// Write-capable backend over a TOML user file
///
/// Without a path the users live in memory only.
#[derive(Debug)]
pub struct UserFileBackend {
    path: Option<PathBuf>,
    home_root: String,
    users: BTreeMap<String, UserRecord>,
}

impl UserFileBackend {
    pub const NAME: &'static str = "userfile";

    pub fn in_memory(home_root: impl Into<String>) -> Self {
        Self {
            path: None,
            home_root: home_root.into(),
            users: BTreeMap::new(),
        }
    }

    /// Load users from `path`; a missing file starts empty and is created on first change
    pub fn open(path: &Path, home_root: impl Into<String>) -> AuthResult<Self> {
        let mut backend = Self::in_memory(home_root);
        backend.path = Some(path.to_path_buf());

        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let file: UserFile = toml::from_str(&contents)?;
            for mut record in file.users {
                record.username = record.username.to_uppercase();
                backend.users.insert(record.username.clone(), record);
            }
            info!("Loaded {} users from {}", backend.users.len(), path.display());
        } else {
            debug!("User file {} not found, starting empty", path.display());
        }

        Ok(backend)
    }

    /// Add a user record directly, as when seeding from configuration
    pub fn insert(&mut self, mut record: UserRecord) {
        record.username = record.username.to_uppercase();
        self.users.insert(record.username.clone(), record);
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn save(&self) -> AuthResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = UserFile {
            users: self.users.values().cloned().collect(),
        };
        let contents = toml::to_string_pretty(&file)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn record_mut(&mut self, username: &str) -> AuthResult<&mut UserRecord> {
        let key = username.to_uppercase();
        self.users
            .get_mut(&key)
            .ok_or(AuthError::UnknownUser(key))
    }

    fn next_uid(&self) -> u32 {
        self.users
            .values()
            .map(|r| r.uid + 1)
            .max()
            .unwrap_or(FIRST_UID)
            .max(FIRST_UID)
    }
}

impl AuthBackend for UserFileBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn login(&self, username: &str, password: &str) -> AuthResult<Option<User>> {
        Ok(self
            .users
            .get(&username.to_uppercase())
            .filter(|record| record.password == password)
            .map(UserRecord::to_user))
    }

    fn create_user(&mut self, username: &str, password: &str, privileged: bool) -> AuthResult<()> {
        let key = username.to_uppercase();
        if self.users.contains_key(&key) {
            return Err(AuthError::UserExists(key));
        }

        let record = UserRecord {
            home: format!("{}/{}", self.home_root.trim_end_matches('/'), key),
            username: key.clone(),
            password: password.to_string(),
            uid: self.next_uid(),
            boot_option: 0,
            privileged,
        };
        self.users.insert(key, record);
        self.save()
    }

    fn remove_user(&mut self, username: &str) -> AuthResult<()> {
        let key = username.to_uppercase();
        if self.users.remove(&key).is_none() {
            return Err(AuthError::UnknownUser(key));
        }
        self.save()
    }

    fn set_priv(&mut self, username: &str, privileged: bool) -> AuthResult<()> {
        self.record_mut(username)?.privileged = privileged;
        self.save()
    }

    fn set_password(&mut self, username: &str, password: &str) -> AuthResult<()> {
        self.record_mut(username)?.password = password.to_string();
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_login_is_case_insensitive() {
        let mut backend = UserFileBackend::in_memory("/home");
        backend.create_user("syst", "secret", true).unwrap();

        let user = backend.login("Syst", "secret").unwrap().unwrap();
        assert_eq!(user.username(), "SYST");
        assert_eq!(user.home(), "/home/SYST");
        assert_eq!(user.uid(), FIRST_UID);
        assert!(user.is_admin());

        assert!(backend.login("SYST", "wrong").unwrap().is_none());
        assert!(backend.login("nobody", "").unwrap().is_none());
    }

    #[test]
    fn test_admin_operations() {
        let mut backend = UserFileBackend::in_memory("/home/");
        backend.create_user("alice", "", false).unwrap();
        backend.create_user("bob", "pw", false).unwrap();
        assert!(matches!(
            backend.create_user("ALICE", "", false),
            Err(AuthError::UserExists(_))
        ));

        backend.set_priv("bob", true).unwrap();
        let bob = backend.login("bob", "pw").unwrap().unwrap();
        assert!(bob.is_admin());
        assert_eq!(bob.uid(), FIRST_UID + 1);

        backend.set_password("bob", "new").unwrap();
        assert!(backend.login("bob", "pw").unwrap().is_none());
        assert!(backend.login("bob", "new").unwrap().is_some());

        backend.remove_user("alice").unwrap();
        assert!(matches!(
            backend.remove_user("alice"),
            Err(AuthError::UnknownUser(_))
        ));
        assert_eq!(backend.user_count(), 1);
    }

    #[test]
    fn test_changes_persist_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.toml");

        let mut backend = UserFileBackend::open(&path, "/home").unwrap();
        assert_eq!(backend.user_count(), 0);
        backend.create_user("syst", "secret", true).unwrap();

        let reopened = UserFileBackend::open(&path, "/home").unwrap();
        let user = reopened.login("syst", "secret").unwrap().unwrap();
        assert!(user.is_admin());
    }
}
