use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::Context;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::client::{HttpSend, ReqwestSender};
use crate::api::{ApiError, ApiRequest, Transport};
use crate::config::{Config, StorageKind};
use crate::models::{
    ForgotPasswordRequest, Identity, LoginRequest, MessageResponse, RegistrationProfile,
    TokenPairResponse,
};

use super::credentials::{
    CredentialBackend, CredentialPair, CredentialStore, FileBackend, KeyringBackend,
    MemoryBackend,
};

/// Capacity of the session event channel.
/// Events are rare (login, logout, teardown); 16 leaves room for slow consumers.
const EVENT_CHANNEL_CAPACITY: usize = 16;

const CREDENTIALS_FILE: &str = "credentials.json";

const ME_PATH: &str = "auth/me";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum TeardownReason {
    /// The identity service rejected the refresh credential, or the call failed.
    RefreshRejected,
    /// An authorization failure occurred with no refresh credential stored.
    MissingRefreshCredential,
}

/// Signals for whatever owns navigation in the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SignedIn { identity: Identity },
    SignedOut,
    /// The session was torn down; send the user to the login entry point.
    RedirectToLogin { reason: TeardownReason },
}

/// Shared session state: the credential store, the resolved identity and
/// the event channel. Passed explicitly to every component that needs it.
pub struct SessionState {
    store: CredentialStore,
    identity: RwLock<Option<Identity>>,
    events: broadcast::Sender<SessionEvent>,
    /// Store generation right after the last teardown.
    torn_down_at: Mutex<Option<u64>>,
}

impl SessionState {
    pub fn new(store: CredentialStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            identity: RwLock::new(None),
            events,
            torn_down_at: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity().is_some() && self.store.get().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn set_identity(&self, identity: Option<Identity>) -> Option<Identity> {
        let mut slot = self.identity.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, identity)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine; the host may not care about navigation
        let _ = self.events.send(event);
    }

    /// Drop credentials and identity. Returns whether anything was cleared.
    fn clear(&self) -> bool {
        let cleared_store = match self.store.clear() {
            Ok(cleared) => cleared,
            Err(e) => {
                warn!(error = %e, "Failed to remove persisted credentials");
                true
            }
        };
        let cleared_identity = self.set_identity(None).is_some();
        cleared_store || cleared_identity
    }

    /// Terminal refresh failure: clear everything and ask for a redirect.
    ///
    /// Repeated failures with nothing written to the store in between belong
    /// to the same ended session and do not signal again.
    pub(crate) fn teardown(&self, reason: TeardownReason) {
        let mut torn_down_at = self
            .torn_down_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *torn_down_at == Some(self.store.generation()) {
            debug!(?reason, "Session already torn down");
            return;
        }

        warn!(?reason, "Tearing down session");
        *torn_down_at = Some(self.store.revoke());
        self.set_identity(None);
        self.emit(SessionEvent::RedirectToLogin { reason });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    InvalidInput,
    InvalidCredentials,
    Network,
    Server,
    Rejected,
}

/// A failed auth flow with a message suitable for showing to the user.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct SessionError {
    kind: SessionErrorKind,
    message: String,
    #[source]
    cause: Option<ApiError>,
}

impl SessionError {
    fn invalid_input(message: &str) -> Self {
        Self {
            kind: SessionErrorKind::InvalidInput,
            message: message.to_string(),
            cause: None,
        }
    }

    /// Map an API failure to a user-facing message, preferring the server's
    /// own detail over `fallback`.
    fn from_api(cause: ApiError, fallback: &str) -> Self {
        let (kind, message) = match &cause {
            ApiError::Network(_) => (
                SessionErrorKind::Network,
                "Unable to connect to server. Check your internet connection.".to_string(),
            ),
            ApiError::Timeout => (
                SessionErrorKind::Network,
                "Connection timed out. Please try again.".to_string(),
            ),
            ApiError::Unauthorized { detail } => (
                SessionErrorKind::InvalidCredentials,
                detail
                    .clone()
                    .unwrap_or_else(|| "Invalid username or password".to_string()),
            ),
            ApiError::RateLimited => (
                SessionErrorKind::Rejected,
                "Too many attempts. Please wait and try again.".to_string(),
            ),
            ApiError::ServerError { detail, .. } => (
                SessionErrorKind::Server,
                detail
                    .clone()
                    .unwrap_or_else(|| "Server error. Please try again later.".to_string()),
            ),
            ApiError::InvalidResponse(_) => (
                SessionErrorKind::Server,
                "Unexpected response from server.".to_string(),
            ),
            other => (
                SessionErrorKind::Rejected,
                other
                    .detail()
                    .map(str::to_string)
                    .unwrap_or_else(|| fallback.to_string()),
            ),
        };
        Self {
            kind,
            message,
            cause: Some(cause),
        }
    }

    pub fn kind(&self) -> SessionErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&ApiError> {
        self.cause.as_ref()
    }
}

/// Owns the authenticated identity and the top-level auth flows.
#[derive(Clone)]
pub struct SessionManager {
    state: Arc<SessionState>,
    transport: Transport,
}

impl SessionManager {
    pub fn new(state: Arc<SessionState>, transport: Transport) -> Self {
        Self { state, transport }
    }

    /// Wire a manager from configuration: pick the credential backend, build
    /// the HTTP client and the transport.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let backend: Box<dyn CredentialBackend> = match config.storage {
            StorageKind::File => {
                let path = config.cache_dir()?.join(CREDENTIALS_FILE);
                debug!(path = %path.display(), "Using file credential storage");
                Box::new(FileBackend::new(path))
            }
            StorageKind::Keyring => Box::new(KeyringBackend),
            StorageKind::Memory => Box::new(MemoryBackend::default()),
        };
        let store = CredentialStore::new(
            backend,
            config.storage_policy(),
            config.access_ttl(),
            config.refresh_ttl(),
        );
        let state = Arc::new(SessionState::new(store));

        let http: Arc<dyn HttpSend> = Arc::new(
            ReqwestSender::new(config.request_timeout()).context("Failed to build HTTP client")?,
        );
        let transport = Transport::new(http, &config.api_base_url, state.clone())
            .context("Invalid API base URL")?;

        Ok(Self::new(state, transport))
    }

    /// Restore the identity for a stored credential. Never fails; an
    /// unresolvable credential leaves the session signed out.
    pub async fn initialize(&self) {
        if self.state.store().get().is_none() {
            debug!("No stored credentials");
            self.state.set_identity(None);
            return;
        }

        match self.fetch_identity(ApiRequest::get(ME_PATH)).await {
            Ok(identity) => {
                info!(user_id = identity.id, "Session restored");
                self.state.set_identity(Some(identity));
            }
            Err(e) => {
                warn!(error = %e, "Stored credentials did not resolve to an identity");
                self.state.clear();
            }
        }
    }

    /// Authenticate and resolve the identity. State is only replaced once
    /// both calls succeed.
    pub async fn login(&self, username: &str, password: &str) -> Result<Identity, SessionError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(SessionError::invalid_input("Username and password required"));
        }

        let result = async {
            let request = ApiRequest::post("auth/login")
                .anonymous()
                .json(&LoginRequest { username, password })?;
            let pair: TokenPairResponse = self.transport.send_json(&request).await?;
            let identity = self
                .fetch_identity(ApiRequest::get(ME_PATH).with_token(pair.access.clone()))
                .await?;
            Ok::<_, ApiError>((CredentialPair::new(pair.access, pair.refresh), identity))
        }
        .await;

        match result {
            Ok((pair, identity)) => {
                if let Err(e) = self.state.store().set(&pair) {
                    warn!(error = %e, "Failed to persist credentials");
                }
                self.state.set_identity(Some(identity.clone()));
                info!(user_id = identity.id, "Login successful");
                self.state.emit(SessionEvent::SignedIn {
                    identity: identity.clone(),
                });
                Ok(identity)
            }
            Err(e) => {
                error!(error = %e, "Login failed");
                Err(SessionError::from_api(e, "Login failed"))
            }
        }
    }

    /// Clear credentials and identity. Safe to call when already signed out.
    pub fn logout(&self) {
        if self.state.clear() {
            info!("Logged out");
            self.state.emit(SessionEvent::SignedOut);
        }
    }

    pub async fn register(&self, profile: &RegistrationProfile) -> Result<String, SessionError> {
        if profile.email.trim().is_empty() || profile.password.is_empty() {
            return Err(SessionError::invalid_input("Email and password required"));
        }

        let request = ApiRequest::post("auth/register")
            .anonymous()
            .json(profile)
            .map_err(|e| SessionError::from_api(e, "Registration failed"))?;
        match self.transport.send_json::<MessageResponse>(&request).await {
            Ok(resp) => Ok(resp
                .message
                .unwrap_or_else(|| "Registration successful".to_string())),
            Err(e) => {
                warn!(error = %e, "Registration failed");
                Err(SessionError::from_api(e, "Registration failed"))
            }
        }
    }

    pub async fn forgot_password(&self, email: &str) -> Result<String, SessionError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(SessionError::invalid_input("Email required"));
        }

        let fallback = "Could not send password reset email";
        let request = ApiRequest::post("auth/forgot-password")
            .anonymous()
            .json(&ForgotPasswordRequest { email })
            .map_err(|e| SessionError::from_api(e, fallback))?;
        match self.transport.send_json::<MessageResponse>(&request).await {
            Ok(resp) => Ok(resp
                .message
                .unwrap_or_else(|| "Password reset email sent".to_string())),
            Err(e) => {
                warn!(error = %e, "Password reset request failed");
                Err(SessionError::from_api(e, fallback))
            }
        }
    }

    /// Issue an arbitrary request on behalf of the rest of the application.
    pub async fn request(&self, request: &ApiRequest) -> Result<serde_json::Value, ApiError> {
        let response = self.transport.send(request).await?;
        if response.body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        response.json()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.is_authenticated()
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.state.identity()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.subscribe()
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    async fn fetch_identity(&self, request: ApiRequest) -> Result<Identity, ApiError> {
        self.transport.send_json(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeServer;
    use crate::auth::StoragePolicy;

    fn manager(server: &Arc<FakeServer>) -> SessionManager {
        let state = Arc::new(SessionState::new(CredentialStore::in_memory(
            StoragePolicy::DEVELOPMENT,
        )));
        let transport = Transport::new(server.clone(), FakeServer::BASE_URL, state.clone())
            .expect("valid base url");
        SessionManager::new(state, transport)
    }

    #[tokio::test]
    async fn test_login_then_request_without_refresh() {
        let server = FakeServer::new();
        let manager = manager(&server);
        let mut events = manager.subscribe();

        let identity = manager
            .login(FakeServer::USERNAME, FakeServer::PASSWORD)
            .await
            .expect("login succeeds");
        assert_eq!(identity.email, "ada@example.com");
        assert!(manager.is_authenticated());
        assert_eq!(
            manager.state().store().get().and_then(|c| c.access).as_deref(),
            Some("access-0")
        );
        assert!(matches!(events.try_recv(), Ok(SessionEvent::SignedIn { .. })));

        let courses = manager
            .request(&ApiRequest::get("courses/"))
            .await
            .expect("authorized request");
        assert!(courses.is_array());
        assert_eq!(server.calls("/api/auth/refresh"), 0);
        assert_eq!(
            server.last_bearer("/api/courses/").as_deref(),
            Some("access-0")
        );
    }

    #[tokio::test]
    async fn test_bad_credentials_leave_state_untouched() {
        let server = FakeServer::new();
        let manager = manager(&server);
        manager
            .login(FakeServer::USERNAME, FakeServer::PASSWORD)
            .await
            .expect("first login");

        let err = manager
            .login(FakeServer::USERNAME, "wrong")
            .await
            .expect_err("bad password");
        assert_eq!(err.kind(), SessionErrorKind::InvalidCredentials);
        assert_eq!(
            err.message(),
            "No active account found with the given credentials"
        );
        assert!(manager.is_authenticated());
        assert_eq!(
            manager.state().store().access_token().as_deref(),
            Some("access-0")
        );
        assert_eq!(server.calls("/api/auth/refresh"), 0);
    }

    #[tokio::test]
    async fn test_login_network_failure_message() {
        let server = FakeServer::new();
        server.set_offline(true);
        let manager = manager(&server);

        let err = manager
            .login(FakeServer::USERNAME, FakeServer::PASSWORD)
            .await
            .expect_err("offline");
        assert_eq!(err.kind(), SessionErrorKind::Network);
        assert!(err.message().contains("Unable to connect"));
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_requires_both_fields() {
        let server = FakeServer::new();
        let manager = manager(&server);

        let err = manager.login("  ", "secret").await.expect_err("empty user");
        assert_eq!(err.kind(), SessionErrorKind::InvalidInput);
        assert_eq!(server.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let server = FakeServer::new();
        let manager = manager(&server);
        let mut events = manager.subscribe();

        manager.logout();
        assert!(events.try_recv().is_err());

        manager
            .login(FakeServer::USERNAME, FakeServer::PASSWORD)
            .await
            .expect("login");
        manager.logout();
        manager.logout();

        assert!(!manager.is_authenticated());
        assert!(manager.current_identity().is_none());
        assert!(manager.state().store().get().is_none());

        let mut signed_out = 0;
        while let Ok(event) = events.try_recv() {
            if event == SessionEvent::SignedOut {
                signed_out += 1;
            }
        }
        assert_eq!(signed_out, 1);
    }

    #[tokio::test]
    async fn test_initialize_restores_identity() {
        let server = FakeServer::new();
        let manager = manager(&server);
        manager
            .state()
            .store()
            .set(&CredentialPair::new(server.access_token(), server.refresh_token()))
            .expect("seed");

        manager.initialize().await;

        assert!(manager.is_authenticated());
        assert_eq!(
            manager.current_identity().map(|i| i.display_name()).as_deref(),
            Some("Ada Lovelace")
        );
    }

    #[tokio::test]
    async fn test_initialize_with_dead_credentials_signs_out() {
        let server = FakeServer::new();
        server.reject_refresh();
        let manager = manager(&server);
        manager
            .state()
            .store()
            .set(&CredentialPair::new("revoked", "revoked"))
            .expect("seed");

        manager.initialize().await;

        assert!(!manager.is_authenticated());
        assert!(manager.state().store().get().is_none());
    }

    #[tokio::test]
    async fn test_initialize_without_credentials_makes_no_calls() {
        let server = FakeServer::new();
        let manager = manager(&server);

        manager.initialize().await;

        assert!(!manager.is_authenticated());
        assert_eq!(server.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_register_reports_server_messages() {
        let server = FakeServer::new();
        let manager = manager(&server);

        let profile = RegistrationProfile {
            username: "grace".into(),
            email: "grace@example.com".into(),
            password: "correct horse".into(),
            first_name: "Grace".into(),
            last_name: "Hopper".into(),
        };
        let message = manager.register(&profile).await.expect("registered");
        assert_eq!(message, "Registration successful");
        assert!(!manager.is_authenticated());

        let taken = RegistrationProfile {
            email: FakeServer::TAKEN_EMAIL.into(),
            ..profile
        };
        let err = manager.register(&taken).await.expect_err("duplicate");
        assert_eq!(err.kind(), SessionErrorKind::Rejected);
        assert_eq!(
            err.message(),
            "email: user with this email already exists."
        );
        assert!(manager.state().store().get().is_none());
    }

    #[tokio::test]
    async fn test_forgot_password() {
        let server = FakeServer::new();
        let manager = manager(&server);

        let message = manager
            .forgot_password("ada@example.com")
            .await
            .expect("accepted");
        assert!(message.contains("reset"));
        assert_eq!(server.calls("/api/auth/forgot-password"), 1);
        assert!(!manager.is_authenticated());

        let err = manager.forgot_password("").await.expect_err("empty");
        assert_eq!(err.kind(), SessionErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_teardown_signals_once_per_ended_session() {
        let server = FakeServer::new();
        let manager = manager(&server);
        let mut events = manager.subscribe();
        let state = manager.state();

        state.teardown(TeardownReason::MissingRefreshCredential);
        state.teardown(TeardownReason::MissingRefreshCredential);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::RedirectToLogin { .. })
        ));
        assert!(events.try_recv().is_err());

        manager
            .login(FakeServer::USERNAME, FakeServer::PASSWORD)
            .await
            .expect("login");
        assert!(matches!(events.try_recv(), Ok(SessionEvent::SignedIn { .. })));

        state.teardown(TeardownReason::RefreshRejected);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::RedirectToLogin {
                reason: TeardownReason::RefreshRejected
            })
        ));
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_teardown_clears_identity() {
        let server = FakeServer::new();
        let manager = manager(&server);
        manager
            .login(FakeServer::USERNAME, FakeServer::PASSWORD)
            .await
            .expect("login");
        server.expire_access();
        server.reject_refresh();
        let mut events = manager.subscribe();

        let err = manager
            .request(&ApiRequest::get("courses/"))
            .await
            .expect_err("refresh rejected");

        assert!(err.is_unauthorized());
        assert!(manager.current_identity().is_none());
        assert!(manager.state().store().get().is_none());
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::RedirectToLogin { .. })
        ));
    }
}
