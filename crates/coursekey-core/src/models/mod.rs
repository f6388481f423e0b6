//! Data models exchanged with the identity service.
//!
//! - `Identity`, `Role`: the authenticated principal returned by `/auth/me`
//! - Auth payloads: login, refresh, registration and password reset bodies

pub mod auth;
pub mod identity;

pub use auth::{
    ForgotPasswordRequest, LoginRequest, MessageResponse, RefreshRequest, RefreshResponse,
    RegistrationProfile, TokenPairResponse,
};
pub use identity::{Identity, Role};
