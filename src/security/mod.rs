//! Security module - who is logged in at each Econet address
//!
//! Provides:
//! - Users and sessions keyed by network.station
//! - A chain of pluggable authentication backends
//! - Idle-session housekeeping and admin-only user management

mod auth;
mod manager;

pub use auth::*;
pub use manager::*;

use std::time::Instant;
use thiserror::Error;

use crate::protocol::EconetAddr;

/// Security errors surfaced to callers
#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("{0} is not logged in")]
    NotLoggedIn(EconetAddr),

    #[error("Permission denied for {0}")]
    PermissionDenied(EconetAddr),

    #[error("Authentication failed for {0}")]
    AuthenticationFailed(String),

    #[error("No authentication backend accepted the operation")]
    NoBackend,

    #[error("Backend error: {0}")]
    Backend(#[from] AuthError),
}

pub type SecurityResult<T> = Result<T, SecurityError>;

/// An authenticated user, built by a backend on each login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    username: String,
    uid: u32,
    home: String,
    boot_option: u8,
    privileged: bool,
    current_dir: Option<String>,
    library_dir: Option<String>,
}

impl User {
    pub fn new(username: &str, uid: u32, home: impl Into<String>) -> Self {
        Self {
            username: username.to_uppercase(),
            uid,
            home: home.into(),
            boot_option: 0,
            privileged: false,
            current_dir: None,
            library_dir: None,
        }
    }

    pub fn with_boot_option(mut self, boot_option: u8) -> Self {
        self.boot_option = boot_option;
        self
    }

    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    pub fn boot_option(&self) -> u8 {
        self.boot_option
    }

    pub fn set_boot_option(&mut self, boot_option: u8) {
        self.boot_option = boot_option;
    }

    pub fn is_admin(&self) -> bool {
        self.privileged
    }

    pub fn set_privileged(&mut self, privileged: bool) {
        self.privileged = privileged;
    }

    /// Current directory, the home directory until changed
    pub fn current_dir(&self) -> &str {
        self.current_dir.as_deref().unwrap_or(&self.home)
    }

    pub fn set_current_dir(&mut self, dir: impl Into<String>) {
        self.current_dir = Some(dir.into());
    }

    /// Library directory, `default` until changed
    pub fn library_dir<'a>(&'a self, default: &'a str) -> &'a str {
        self.library_dir.as_deref().unwrap_or(default)
    }

    pub fn set_library_dir(&mut self, dir: impl Into<String>) {
        self.library_dir = Some(dir.into());
    }
}

/// A logged-in user at one Econet address
#[derive(Debug, Clone)]
pub struct Session {
    login_time: Instant,
    idle_time: Instant,
    provider: String,
    user: User,
}

impl Session {
    pub fn new(user: User, provider: impl Into<String>, now: Instant) -> Self {
        Self {
            login_time: now,
            idle_time: now,
            provider: provider.into(),
            user,
        }
    }

    pub fn login_time(&self) -> Instant {
        self.login_time
    }

    pub fn idle_time(&self) -> Instant {
        self.idle_time
    }

    /// Name of the backend that authenticated this session
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn user_mut(&mut self) -> &mut User {
        &mut self.user
    }

    pub fn touch(&mut self, now: Instant) {
        self.idle_time = now;
    }
}
