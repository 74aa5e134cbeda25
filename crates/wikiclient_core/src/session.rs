use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Result, WikiError};

pub const SESSION_COOKIE_KEY: &str = "sessionCookie";
pub const AUTH_FLAG_KEY: &str = "isLoggedIn";
pub const USERNAME_KEY: &str = "username";

/// Opaque key-value secret storage supplied by the host application.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| WikiError::Store("memory store lock poisoned".to_string()))
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten on every mutation.
#[derive(Debug)]
pub struct FileSecretStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|error| {
            WikiError::Store(format!("failed to read {}: {error}", self.path.display()))
        })?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|error| {
            WikiError::Store(format!("failed to parse {}: {error}", self.path.display()))
        })
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                WikiError::Store(format!("failed to create {}: {error}", parent.display()))
            })?;
        }
        let rendered = serde_json::to_string_pretty(map)
            .map_err(|error| WikiError::Store(format!("failed to serialize session: {error}")))?;
        fs::write(&self.path, rendered).map_err(|error| {
            WikiError::Store(format!("failed to write {}: {error}", self.path.display()))
        })
    }

    fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| WikiError::Store("file store lock poisoned".to_string()))?;
        let mut map = self.read_map()?;
        let before = map.clone();
        mutate(&mut map);
        if map == before {
            return Ok(());
        }
        self.write_map(&map)
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| WikiError::Store("file store lock poisoned".to_string()))?;
        Ok(self.read_map()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|map| {
            map.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|map| {
            map.remove(key);
        })
    }
}

/// The three session keys the client persists, over an injected [`SecretStore`].
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn SecretStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySecretStore::new()))
    }

    pub fn cookie(&self) -> Result<Option<String>> {
        self.store.get(SESSION_COOKIE_KEY)
    }

    /// Store `cookie` unless it is already the stored value. Returns whether a write
    /// happened.
    pub fn replace_cookie(&self, cookie: &str) -> Result<bool> {
        if self.cookie()?.as_deref() == Some(cookie) {
            return Ok(false);
        }
        self.store.set(SESSION_COOKIE_KEY, cookie)?;
        Ok(true)
    }

    pub fn clear_cookie(&self) -> Result<()> {
        self.store.remove(SESSION_COOKIE_KEY)
    }

    pub fn is_authenticated(&self) -> Result<bool> {
        Ok(self.store.get(AUTH_FLAG_KEY)?.as_deref() == Some("true"))
    }

    pub fn username(&self) -> Result<Option<String>> {
        self.store.get(USERNAME_KEY)
    }

    pub fn mark_authenticated(&self, username: &str) -> Result<()> {
        self.store.set(AUTH_FLAG_KEY, "true")?;
        self.store.set(USERNAME_KEY, username)
    }

    /// Drop cookie, auth flag and username together. Every key is attempted even when
    /// an earlier removal fails; the first failure is returned.
    pub fn clear(&self) -> Result<()> {
        let mut first_error = None;
        for key in [SESSION_COOKIE_KEY, AUTH_FLAG_KEY, USERNAME_KEY] {
            if let Err(error) = self.store.remove(key) {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use crate::error::{Result, WikiError};

    use super::{
        AUTH_FLAG_KEY, FileSecretStore, MemorySecretStore, SESSION_COOKIE_KEY, SecretStore,
        SessionStore, USERNAME_KEY,
    };

    #[test]
    fn replace_cookie_skips_identical_value() {
        let session = SessionStore::in_memory();
        assert!(session.replace_cookie("DokuWiki=abc").expect("store"));
        assert!(!session.replace_cookie("DokuWiki=abc").expect("store"));
        assert!(session.replace_cookie("DokuWiki=def").expect("store"));
        assert_eq!(
            session.cookie().expect("read").as_deref(),
            Some("DokuWiki=def")
        );
    }

    #[test]
    fn clear_removes_all_three_keys() {
        let store = Arc::new(MemorySecretStore::new());
        let session = SessionStore::new(store.clone());
        session.replace_cookie("DokuWiki=abc").expect("cookie");
        session.mark_authenticated("alice").expect("auth");
        assert!(session.is_authenticated().expect("flag"));

        session.clear().expect("clear");
        for key in [SESSION_COOKIE_KEY, AUTH_FLAG_KEY, USERNAME_KEY] {
            assert_eq!(store.get(key).expect("get"), None, "{key} should be gone");
        }
        assert!(!session.is_authenticated().expect("flag"));
    }

    /// Memory store whose removal of one key always fails.
    struct StuckKeyStore {
        inner: MemorySecretStore,
        stuck_key: &'static str,
    }

    impl SecretStore for StuckKeyStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            if key == self.stuck_key {
                return Err(WikiError::Store(format!("cannot remove {key}")));
            }
            self.inner.remove(key)
        }
    }

    #[test]
    fn clear_attempts_every_key_when_one_removal_fails() {
        let store = Arc::new(StuckKeyStore {
            inner: MemorySecretStore::new(),
            stuck_key: SESSION_COOKIE_KEY,
        });
        let session = SessionStore::new(store.clone());
        session.replace_cookie("DokuWiki=abc").expect("cookie");
        session.mark_authenticated("prev").expect("auth");

        let error = session.clear().expect_err("cookie removal fails");
        assert!(error.to_string().contains("cannot remove sessionCookie"));
        assert!(!session.is_authenticated().expect("flag"));
        assert_eq!(session.username().expect("user"), None);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("state").join("session.json");

        let first = FileSecretStore::new(&path);
        first.set(USERNAME_KEY, "bob").expect("set");
        first.set(AUTH_FLAG_KEY, "true").expect("set");

        let second = FileSecretStore::new(&path);
        assert_eq!(second.get(USERNAME_KEY).expect("get").as_deref(), Some("bob"));
        second.remove(USERNAME_KEY).expect("remove");
        assert_eq!(first.get(USERNAME_KEY).expect("get"), None);
        assert_eq!(first.get(AUTH_FLAG_KEY).expect("get").as_deref(), Some("true"));
    }

    #[test]
    fn file_store_reports_corrupt_file() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("session.json");
        std::fs::write(&path, "{not json").expect("write");
        let error = FileSecretStore::new(&path)
            .get(USERNAME_KEY)
            .expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }
}
