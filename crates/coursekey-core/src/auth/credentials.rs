//! Credential store for the access/refresh pair.
//!
//! Values are held in memory behind a single lock and written through to a
//! [`CredentialBackend`] so they survive restarts. Every write bumps a
//! generation counter; the transport records the generation it sent a request
//! with so the refresh coordinator can tell when a credential was already
//! superseded.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const KEYRING_SERVICE: &str = "coursekey";
const KEYRING_USER: &str = "session-credentials";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Credential file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
}

/// Transport-security flags applied to stored credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoragePolicy {
    /// Only attach credentials to `https` URLs.
    pub secure: bool,
    pub same_site: SameSite,
}

impl StoragePolicy {
    pub const DEVELOPMENT: Self = Self {
        secure: false,
        same_site: SameSite::Lax,
    };

    pub const PRODUCTION: Self = Self {
        secure: true,
        same_site: SameSite::Strict,
    };

    pub fn allows(&self, url: &reqwest::Url) -> bool {
        !self.secure || url.scheme() == "https"
    }
}

/// Access and refresh values issued together by a login.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access: String,
    pub refresh: String,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialPair { access: <redacted>, refresh: <redacted> }")
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl StoredCredential {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// On-disk shape of the credential pair.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub access: Option<StoredCredential>,
    pub refresh: Option<StoredCredential>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: SameSite,
}

impl StoredCredentials {
    fn live_access(&self) -> Option<&str> {
        self.access
            .as_ref()
            .filter(|c| !c.is_expired())
            .map(|c| c.value.as_str())
    }

    fn live_refresh(&self) -> Option<&str> {
        self.refresh
            .as_ref()
            .filter(|c| !c.is_expired())
            .map(|c| c.value.as_str())
    }

    fn is_empty(&self) -> bool {
        self.access.is_none() && self.refresh.is_none()
    }
}

/// Unexpired credential values as returned by [`CredentialStore::get`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access", &self.access.as_ref().map(|_| "<redacted>"))
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// The access value together with the generation it was read at.
#[derive(Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub access: Option<String>,
}

pub trait CredentialBackend: Send + Sync {
    fn load(&self) -> Result<Option<StoredCredentials>, StoreError>;
    fn save(&self, credentials: &StoredCredentials) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// JSON file in the cache directory, readable only by the owner.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CredentialBackend for FileBackend {
    fn load(&self) -> Result<Option<StoredCredentials>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn save(&self, credentials: &StoredCredentials) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(credentials)?;

        // Write then rename so a crash never leaves half a pair on disk
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// OS keychain entry holding the serialized pair.
pub struct KeyringBackend;

impl KeyringBackend {
    fn entry() -> Result<Entry, StoreError> {
        Ok(Entry::new(KEYRING_SERVICE, KEYRING_USER)?)
    }
}

impl CredentialBackend for KeyringBackend {
    fn load(&self) -> Result<Option<StoredCredentials>, StoreError> {
        match Self::entry()?.get_password() {
            Ok(secret) => Ok(Some(serde_json::from_str(&secret)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, credentials: &StoredCredentials) -> Result<(), StoreError> {
        let secret = serde_json::to_string(credentials)?;
        Self::entry()?.set_password(&secret)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match Self::entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local backend; nothing outlives the store.
#[derive(Default)]
pub struct MemoryBackend {
    saved: Mutex<Option<StoredCredentials>>,
}

impl CredentialBackend for MemoryBackend {
    fn load(&self) -> Result<Option<StoredCredentials>, StoreError> {
        Ok(self
            .saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, credentials: &StoredCredentials) -> Result<(), StoreError> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(credentials.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

struct Inner {
    credentials: StoredCredentials,
    generation: u64,
}

pub struct CredentialStore {
    backend: Box<dyn CredentialBackend>,
    policy: StoragePolicy,
    access_ttl: Duration,
    refresh_ttl: Duration,
    inner: RwLock<Inner>,
    /// Generation last written to the backend. Serializes backend I/O.
    persisted: Mutex<u64>,
}

impl CredentialStore {
    /// Open a store, restoring whatever the backend persisted earlier.
    pub fn new(
        backend: Box<dyn CredentialBackend>,
        policy: StoragePolicy,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        let credentials = match backend.load() {
            Ok(Some(stored)) => {
                debug!("Restored stored credentials");
                stored
            }
            Ok(None) => StoredCredentials::default(),
            Err(e) => {
                warn!(error = %e, "Failed to load stored credentials, starting signed out");
                StoredCredentials::default()
            }
        };

        Self {
            backend,
            policy,
            access_ttl,
            refresh_ttl,
            inner: RwLock::new(Inner {
                credentials,
                generation: 0,
            }),
            persisted: Mutex::new(0),
        }
    }

    pub fn in_memory(policy: StoragePolicy) -> Self {
        Self::new(
            Box::new(MemoryBackend::default()),
            policy,
            Duration::days(1),
            Duration::days(7),
        )
    }

    pub fn policy(&self) -> StoragePolicy {
        self.policy
    }

    /// Store a freshly issued pair, replacing any previous one.
    pub fn set(&self, pair: &CredentialPair) -> Result<(), StoreError> {
        let credentials = StoredCredentials {
            access: Some(StoredCredential::new(&pair.access, self.access_ttl)),
            refresh: Some(StoredCredential::new(&pair.refresh, self.refresh_ttl)),
            secure: self.policy.secure,
            same_site: self.policy.same_site,
        };
        self.write(|inner| {
            inner.credentials = credentials;
            true
        })
        .map(|_| ())
    }

    /// Install a refreshed access value, but only if the refresh credential
    /// used to obtain it is still the stored one.
    ///
    /// Returns `Ok(false)` without writing when the pair was replaced or
    /// cleared while the refresh was in flight.
    pub fn replace_access(
        &self,
        expected_refresh: &str,
        access: &str,
        rotated_refresh: Option<&str>,
    ) -> Result<bool, StoreError> {
        let access = StoredCredential::new(access, self.access_ttl);
        let rotated = rotated_refresh.map(|r| StoredCredential::new(r, self.refresh_ttl));
        self.write(|inner| {
            let matches = inner
                .credentials
                .refresh
                .as_ref()
                .is_some_and(|r| r.value == expected_refresh);
            if !matches {
                return false;
            }
            inner.credentials.access = Some(access);
            if let Some(rotated) = rotated {
                inner.credentials.refresh = Some(rotated);
            }
            true
        })
    }

    /// Unexpired values, or `None` when neither is present.
    pub fn get(&self) -> Option<Credentials> {
        let inner = self.read();
        let access = inner.credentials.live_access().map(str::to_string);
        let refresh = inner.credentials.live_refresh().map(str::to_string);
        if access.is_none() && refresh.is_none() {
            None
        } else {
            Some(Credentials { access, refresh })
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.read().credentials.live_access().map(str::to_string)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read().credentials.live_refresh().map(str::to_string)
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.read();
        Snapshot {
            generation: inner.generation,
            access: inner.credentials.live_access().map(str::to_string),
        }
    }

    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Remove both values. Clearing an empty store changes nothing.
    pub fn clear(&self) -> Result<bool, StoreError> {
        self.write(|inner| {
            if inner.credentials.is_empty() {
                return false;
            }
            inner.credentials = StoredCredentials::default();
            true
        })
    }

    /// End the session: remove both values and advance the generation even
    /// when the store was already empty, so a failure observed at an earlier
    /// generation is recognizably stale. Returns the new generation.
    pub fn revoke(&self) -> u64 {
        let generation = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            inner.credentials = StoredCredentials::default();
            inner.generation += 1;
            inner.generation
        };
        if let Err(e) = self.persist(generation, &StoredCredentials::default()) {
            warn!(error = %e, "Failed to remove persisted credentials");
        }
        generation
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `update` under the write lock and persist if it reports a change.
    /// The in-memory state is authoritative even when persisting fails.
    fn write<F>(&self, update: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Inner) -> bool,
    {
        let (generation, credentials) = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if !update(&mut inner) {
                return Ok(false);
            }
            inner.generation += 1;
            (inner.generation, inner.credentials.clone())
        };
        self.persist(generation, &credentials)?;
        Ok(true)
    }

    /// Write `credentials` to the backend unless a later generation already
    /// landed there. Runs outside the state lock so readers never wait on
    /// file or keychain I/O.
    fn persist(&self, generation: u64, credentials: &StoredCredentials) -> Result<(), StoreError> {
        let mut persisted = self.persisted.lock().unwrap_or_else(PoisonError::into_inner);
        if *persisted > generation {
            debug!(generation, latest = *persisted, "Skipping superseded credential write");
            return Ok(());
        }
        if credentials.is_empty() {
            self.backend.clear()?;
        } else {
            self.backend.save(credentials)?;
        }
        *persisted = generation;
        Ok(())
    }
}
