//! Authorizing request transport.
//!
//! Every outbound call goes through [`Transport::send`]. Bearer requests carry
//! the stored access credential; a 401 hands over to the refresh coordinator
//! and the request is replayed at most once with the credential it returns.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::auth::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::auth::SessionState;

use super::client::{HttpResponse, HttpSend};
use super::request::parse_base_url;
use super::{ApiError, ApiRequest, Authorization};

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RATE_LIMIT_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }
}

/// A request on its way out, tracking whether it was already replayed.
struct InFlight<'a> {
    request: &'a ApiRequest,
    retried: bool,
}

impl InFlight<'_> {
    fn may_refresh(&self) -> bool {
        !self.retried && self.request.authorization == Authorization::Bearer
    }
}

/// Clone is cheap - all state is behind `Arc`s.
#[derive(Clone)]
pub struct Transport {
    http: Arc<dyn HttpSend>,
    base_url: Url,
    session: Arc<SessionState>,
    coordinator: Arc<RefreshCoordinator>,
    rate_limit: RateLimitPolicy,
}

impl Transport {
    pub fn new(
        http: Arc<dyn HttpSend>,
        base_url: &str,
        session: Arc<SessionState>,
    ) -> Result<Self, ApiError> {
        let base_url = parse_base_url(base_url)?;
        let coordinator = Arc::new(RefreshCoordinator::new(
            http.clone(),
            base_url.clone(),
            session.clone(),
        ));
        Ok(Self {
            http,
            base_url,
            session,
            coordinator,
            rate_limit: RateLimitPolicy::default(),
        })
    }

    pub fn with_rate_limit_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = policy;
        self
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Send `request`, recovering transparently from one authorization failure.
    ///
    /// Returns the response for any 2xx status; every other status is mapped
    /// to an [`ApiError`].
    pub async fn send(&self, request: &ApiRequest) -> Result<HttpResponse, ApiError> {
        let snapshot = self.session.store().snapshot();
        let mut in_flight = InFlight {
            request,
            retried: false,
        };
        let mut credential = match &request.authorization {
            Authorization::Bearer => snapshot.access,
            Authorization::Token(token) => Some(token.clone()),
            Authorization::None => None,
        };

        loop {
            let response = self.dispatch(&in_flight, credential.as_deref()).await?;
            if response.status != StatusCode::UNAUTHORIZED {
                return response.into_result();
            }
            if !in_flight.may_refresh() {
                if in_flight.retried {
                    warn!(path = %request.path, "Still unauthorized after refresh");
                }
                return response.into_result();
            }

            debug!(path = %request.path, "Authorization failed, recovering");
            in_flight.retried = true;
            match self.coordinator.recover(snapshot.generation).await {
                RefreshOutcome::Refreshed(access) => credential = Some(access),
                RefreshOutcome::Failed => return response.into_result(),
            }
        }
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        self.send(request).await?.json()
    }

    /// One logical attempt on the wire, backing off on 429.
    async fn dispatch(
        &self,
        in_flight: &InFlight<'_>,
        credential: Option<&str>,
    ) -> Result<HttpResponse, ApiError> {
        let url = in_flight.request.url(&self.base_url)?;
        let credential = credential.filter(|_| {
            let allowed = self.session.store().policy().allows(&url);
            if !allowed {
                warn!(scheme = url.scheme(), "Refusing to send credential over insecure transport");
            }
            allowed
        });

        let mut retries = 0;
        let mut backoff = self.rate_limit.initial_backoff;
        loop {
            let http = in_flight.request.to_http(&self.base_url, credential)?;
            let response = self.http.send(http).await?;
            if response.status != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > self.rate_limit.max_retries {
                return Err(ApiError::RateLimited);
            }
            warn!(
                path = %in_flight.request.path,
                retry = retries,
                backoff_ms = backoff.as_millis() as u64,
                "Rate limited, backing off"
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
}
