//! REST transport for the course catalog identity service.
//!
//! This module provides the `Transport` through which every outbound call is
//! dispatched, the `HttpSend` port it sends through, and `ApiError`.
//!
//! Authorized requests carry the stored access credential as a bearer token.
//! Authorization failures are recovered by the refresh coordinator in
//! [`crate::auth`].

pub mod client;
pub mod error;
pub mod request;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake;

pub use client::{HttpRequest, HttpResponse, HttpSend, ReqwestSender};
pub use error::ApiError;
pub use request::{ApiRequest, Authorization};
pub use transport::{RateLimitPolicy, Transport};
