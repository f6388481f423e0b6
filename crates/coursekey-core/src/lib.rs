//! Core library for coursekey.
//!
//! Provides the credential lifecycle used by the course catalog dashboard:
//!
//! - [`auth::CredentialStore`]: persisted access/refresh credential pair
//! - [`api::Transport`]: authorizing request dispatch with retry-once semantics
//! - [`auth::RefreshCoordinator`]: single-flight credential refresh
//! - [`auth::SessionManager`]: login, logout, registration and identity

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiError, ApiRequest, Authorization, Transport};
pub use auth::{
    CredentialPair, CredentialStore, SessionError, SessionEvent, SessionManager, SessionState,
};
pub use config::Config;
pub use models::{Identity, RegistrationProfile, Role};
