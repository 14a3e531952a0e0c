//! Session manager

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{AuthBackend, AuthResult, SecurityError, SecurityResult, Session, User};
use crate::protocol::EconetAddr;

/// Default idle time before a session is logged out
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(3600);

/// Default library directory for new sessions
pub const DEFAULT_LIBRARY_PATH: &str = "/Library";

/// Tracks one session per Econet address and the backends that authenticate them
pub struct SecurityManager {
    backends: Vec<Box<dyn AuthBackend>>,
    sessions: HashMap<EconetAddr, Session>,
    max_idle: Duration,
    library_path: String,
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE, DEFAULT_LIBRARY_PATH)
    }
}

impl SecurityManager {
    pub fn new(max_idle: Duration, library_path: impl Into<String>) -> Self {
        Self {
            backends: Vec::new(),
            sessions: HashMap::new(),
            max_idle,
            library_path: library_path.into(),
        }
    }

    /// Append a backend; earlier backends are asked first
    pub fn add_backend(&mut self, backend: Box<dyn AuthBackend>) {
        debug!("Added authentication backend {}", backend.name());
        self.backends.push(backend);
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    pub fn max_idle(&self) -> Duration {
        self.max_idle
    }

    pub fn library_path(&self) -> &str {
        &self.library_path
    }

    /// Authenticate `username` at `addr` against the backend chain
    ///
    /// The first backend returning a user wins. Backend errors are logged and
    /// the chain continues. An existing session at `addr` is replaced.
    pub fn login(&mut self, addr: EconetAddr, username: &str, password: &str) -> SecurityResult<&User> {
        self.login_at(addr, username, password, Instant::now())
    }

    pub fn login_at(
        &mut self,
        addr: EconetAddr,
        username: &str,
        password: &str,
        now: Instant,
    ) -> SecurityResult<&User> {
        let username = username.to_uppercase();
        let mut accepted = None;

        for backend in &self.backends {
            match backend.login(&username, password) {
                Ok(Some(user)) => {
                    accepted = Some((user, backend.name().to_string()));
                    break;
                }
                Ok(None) => {}
                Err(e) => warn!(backend = backend.name(), "Login check failed: {}", e),
            }
        }

        let Some((user, provider)) = accepted else {
            info!("Login failed for {} at {}", username, addr);
            return Err(SecurityError::AuthenticationFailed(username));
        };

        info!("{} logged in at {} via {}", user.username(), addr, provider);
        if let Some(previous) = self.sessions.insert(addr, Session::new(user, provider, now)) {
            debug!("Replaced session for {} at {}", previous.user().username(), addr);
        }

        self.sessions
            .get(&addr)
            .map(Session::user)
            .ok_or(SecurityError::NotLoggedIn(addr))
    }

    /// End the session at `addr`
    pub fn logout(&mut self, addr: EconetAddr) -> SecurityResult<Session> {
        let session = self
            .sessions
            .remove(&addr)
            .ok_or(SecurityError::NotLoggedIn(addr))?;
        info!("{} logged out at {}", session.user().username(), addr);
        Ok(session)
    }

    pub fn is_logged_in(&self, addr: EconetAddr) -> bool {
        self.sessions.contains_key(&addr)
    }

    pub fn session(&self, addr: EconetAddr) -> Option<&Session> {
        self.sessions.get(&addr)
    }

    pub fn user(&self, addr: EconetAddr) -> Option<&User> {
        self.sessions.get(&addr).map(Session::user)
    }

    pub fn user_mut(&mut self, addr: EconetAddr) -> Option<&mut User> {
        self.sessions.get_mut(&addr).map(Session::user_mut)
    }

    /// Library directory for the user at `addr`
    pub fn library_dir(&self, addr: EconetAddr) -> Option<&str> {
        self.user(addr).map(|u| u.library_dir(&self.library_path))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Record activity from `addr`; false if nobody is logged in there
    pub fn touch(&mut self, addr: EconetAddr) -> bool {
        self.touch_at(addr, Instant::now())
    }

    pub fn touch_at(&mut self, addr: EconetAddr, now: Instant) -> bool {
        match self.sessions.get_mut(&addr) {
            Some(session) => {
                session.touch(now);
                true
            }
            None => false,
        }
    }

    /// Log out every session idle for longer than the limit
    pub fn house_keeping(&mut self) -> Vec<EconetAddr> {
        self.house_keeping_at(Instant::now())
    }

    pub fn house_keeping_at(&mut self, now: Instant) -> Vec<EconetAddr> {
        let expired: Vec<EconetAddr> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.idle_time()) > self.max_idle)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in &expired {
            info!("Session at {} idle too long", addr);
            let _ = self.logout(*addr);
        }
        expired
    }

    fn require_admin(&self, actor: EconetAddr) -> SecurityResult<()> {
        match self.user(actor) {
            Some(user) if user.is_admin() => Ok(()),
            _ => Err(SecurityError::PermissionDenied(actor)),
        }
    }

    /// Apply `op` to the first backend that accepts it
    fn apply<F>(&mut self, what: &str, mut op: F) -> SecurityResult<()>
    where
        F: FnMut(&mut dyn AuthBackend) -> AuthResult<()>,
    {
        let mut last_error = None;

        for backend in self.backends.iter_mut() {
            match op(backend.as_mut()) {
                Ok(()) => {
                    info!("{} applied by {}", what, backend.name());
                    return Ok(());
                }
                Err(e) => {
                    debug!(backend = backend.name(), "{} not applied: {}", what, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map_or(SecurityError::NoBackend, SecurityError::Backend))
    }

    pub fn create_user(
        &mut self,
        actor: EconetAddr,
        username: &str,
        password: &str,
        privileged: bool,
    ) -> SecurityResult<()> {
        self.require_admin(actor)?;
        let username = username.to_uppercase();
        self.apply(&format!("Create user {}", username), |b| {
            b.create_user(&username, password, privileged)
        })
    }

    pub fn remove_user(&mut self, actor: EconetAddr, username: &str) -> SecurityResult<()> {
        self.require_admin(actor)?;
        let username = username.to_uppercase();
        self.apply(&format!("Remove user {}", username), |b| b.remove_user(&username))
    }

    /// Change a user's privilege, including any live sessions of theirs
    pub fn set_priv(&mut self, actor: EconetAddr, username: &str, privileged: bool) -> SecurityResult<()> {
        self.require_admin(actor)?;
        let username = username.to_uppercase();
        self.apply(&format!("Set privilege for {}", username), |b| {
            b.set_priv(&username, privileged)
        })?;

        for session in self.sessions.values_mut() {
            if session.user().username() == username {
                session.user_mut().set_privileged(privileged);
            }
        }
        Ok(())
    }

    /// Change the password of the user logged in at `addr`
    pub fn change_password(&mut self, addr: EconetAddr, old: &str, new: &str) -> SecurityResult<()> {
        let session = self
            .sessions
            .get(&addr)
            .ok_or(SecurityError::NotLoggedIn(addr))?;
        let username = session.user().username().to_string();
        let provider = session.provider().to_string();

        let backend = self
            .backends
            .iter_mut()
            .find(|b| b.name() == provider)
            .ok_or(SecurityError::NoBackend)?;

        if backend.login(&username, old)?.is_none() {
            return Err(SecurityError::AuthenticationFailed(username));
        }
        backend.set_password(&username, new)?;
        info!("Password changed for {}", username);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{AuthError, UserFileBackend};

    /// Accepts nobody
    struct DenyAll;

    impl AuthBackend for DenyAll {
        fn name(&self) -> &str {
            "deny"
        }

        fn login(&self, _username: &str, _password: &str) -> AuthResult<Option<User>> {
            Ok(None)
        }
    }

    /// Accepts exactly one username with any password
    struct OnlyUser(&'static str);

    impl AuthBackend for OnlyUser {
        fn name(&self) -> &str {
            "only"
        }

        fn login(&self, username: &str, _password: &str) -> AuthResult<Option<User>> {
            Ok((username == self.0).then(|| User::new(username, 1, "/home")))
        }
    }

    /// Fails every lookup
    struct Broken;

    impl AuthBackend for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn login(&self, _username: &str, _password: &str) -> AuthResult<Option<User>> {
            Err(AuthError::Other("directory unreachable".to_string()))
        }
    }

    fn station(n: u8) -> EconetAddr {
        EconetAddr::new(1, n)
    }

    fn with_admin() -> SecurityManager {
        let mut backend = UserFileBackend::in_memory("/home");
        backend.create_user("syst", "sys", true).unwrap();
        backend.create_user("guest", "", false).unwrap();

        let mut manager = SecurityManager::default();
        manager.add_backend(Box::new(backend));
        manager.login(station(1), "syst", "sys").unwrap();
        manager.login(station(2), "guest", "").unwrap();
        manager
    }

    #[test]
    fn test_login_uses_first_accepting_backend() {
        let mut manager = SecurityManager::default();
        manager.add_backend(Box::new(DenyAll));
        manager.add_backend(Box::new(OnlyUser("X")));

        let user = manager.login(station(5), "x", "anything").unwrap();
        assert_eq!(user.username(), "X");
        assert_eq!(manager.session(station(5)).unwrap().provider(), "only");

        assert!(matches!(
            manager.login(station(6), "Y", ""),
            Err(SecurityError::AuthenticationFailed(_))
        ));
        assert!(!manager.is_logged_in(station(6)));
    }

    #[test]
    fn test_backend_error_continues_chain() {
        let mut manager = SecurityManager::default();
        manager.add_backend(Box::new(Broken));
        manager.add_backend(Box::new(OnlyUser("X")));

        manager.login(station(5), "X", "").unwrap();
        assert_eq!(manager.session(station(5)).unwrap().provider(), "only");
    }

    #[test]
    fn test_logout() {
        let mut manager = with_admin();
        assert_eq!(manager.session_count(), 2);

        let session = manager.logout(station(2)).unwrap();
        assert_eq!(session.user().username(), "GUEST");
        assert!(matches!(
            manager.logout(station(2)),
            Err(SecurityError::NotLoggedIn(_))
        ));
    }

    #[test]
    fn test_relogin_replaces_session() {
        let mut manager = with_admin();
        manager.login(station(2), "syst", "sys").unwrap();
        assert_eq!(manager.user(station(2)).unwrap().username(), "SYST");
        assert_eq!(manager.session_count(), 2);
    }

    #[test]
    fn test_house_keeping_evicts_idle_sessions() {
        let mut manager = SecurityManager::new(Duration::from_secs(60), DEFAULT_LIBRARY_PATH);
        manager.add_backend(Box::new(OnlyUser("X")));

        let start = Instant::now();
        manager.login_at(station(1), "X", "", start).unwrap();
        manager.login_at(station(2), "X", "", start).unwrap();
        assert!(manager.touch_at(station(2), start + Duration::from_secs(50)));
        assert!(!manager.touch_at(station(3), start));

        let evicted = manager.house_keeping_at(start + Duration::from_secs(90));
        assert_eq!(evicted, vec![station(1)]);
        assert!(!manager.is_logged_in(station(1)));
        assert!(manager.is_logged_in(station(2)));
    }

    #[test]
    fn test_admin_operations_require_privilege() {
        let mut manager = with_admin();

        assert!(matches!(
            manager.create_user(station(2), "eve", "", true),
            Err(SecurityError::PermissionDenied(_))
        ));
        assert!(matches!(
            manager.remove_user(station(9), "guest"),
            Err(SecurityError::PermissionDenied(_))
        ));

        manager.create_user(station(1), "alice", "pw", false).unwrap();
        manager.login(station(3), "alice", "pw").unwrap();

        manager.set_priv(station(1), "guest", true).unwrap();
        assert!(manager.user(station(2)).unwrap().is_admin());

        manager.remove_user(station(1), "alice").unwrap();
        assert!(matches!(
            manager.remove_user(station(1), "alice"),
            Err(SecurityError::Backend(AuthError::UnknownUser(_)))
        ));
    }

    #[test]
    fn test_read_only_backends_are_skipped() {
        let mut backend = UserFileBackend::in_memory("/home");
        backend.create_user("syst", "sys", true).unwrap();

        let mut manager = SecurityManager::default();
        manager.add_backend(Box::new(DenyAll));
        manager.add_backend(Box::new(backend));
        manager.login(station(1), "syst", "sys").unwrap();

        manager.create_user(station(1), "bob", "", false).unwrap();
        manager.login(station(4), "bob", "").unwrap();
        assert_eq!(manager.session(station(4)).unwrap().provider(), UserFileBackend::NAME);

        let mut read_only = SecurityManager::default();
        read_only.add_backend(Box::new(OnlyUser("SYST")));
        read_only.login(station(1), "syst", "").unwrap();
        read_only.user_mut(station(1)).unwrap().set_privileged(true);
        assert!(matches!(
            read_only.create_user(station(1), "bob", "", false),
            Err(SecurityError::Backend(AuthError::ReadOnly(_)))
        ));
    }

    #[test]
    fn test_change_password() {
        let mut manager = with_admin();

        assert!(matches!(
            manager.change_password(station(2), "wrong", "new"),
            Err(SecurityError::AuthenticationFailed(_))
        ));
        manager.change_password(station(2), "", "new").unwrap();
        assert!(matches!(
            manager.change_password(station(7), "", "x"),
            Err(SecurityError::NotLoggedIn(_))
        ));

        manager.logout(station(2)).unwrap();
        assert!(manager.login(station(2), "guest", "").is_err());
        manager.login(station(2), "guest", "new").unwrap();
    }

    #[test]
    fn test_library_dir_defaults_to_configured_path() {
        let mut manager = with_admin();
        assert_eq!(manager.library_dir(station(1)), Some(DEFAULT_LIBRARY_PATH));
        manager.user_mut(station(1)).unwrap().set_library_dir("/Lib2");
        assert_eq!(manager.library_dir(station(1)), Some("/Lib2"));
        assert_eq!(manager.library_dir(station(9)), None);
    }
}
