//! Authentication module for managing sessions and credentials.
//!
//! This module provides:
//! - `CredentialStore`: persisted access/refresh pair with expiry metadata
//! - `RefreshCoordinator`: single-flight renewal of the access credential
//! - `SessionManager`: login/logout/registration flows and the current identity
//!
//! Session teardown is reported as a `SessionEvent` rather than performed as
//! navigation, so hosts decide how to send the user back to login.

pub mod credentials;
pub mod refresh;
pub mod session;

pub use credentials::{
    CredentialBackend, CredentialPair, CredentialStore, Credentials, FileBackend, KeyringBackend,
    MemoryBackend, SameSite, StoragePolicy, StoreError,
};
pub use refresh::{RefreshCoordinator, RefreshOutcome};
pub use session::{
    SessionError, SessionErrorKind, SessionEvent, SessionManager, SessionState, TeardownReason,
};
