//! Scripted identity service for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use reqwest::{header, StatusCode, Url};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use super::client::{HttpRequest, HttpResponse, HttpSend};
use super::ApiError;

#[derive(Default)]
struct State {
    access: String,
    refresh: String,
    issued: u32,
    rotate_refresh: bool,
    reject_refresh: bool,
    deny_courses: bool,
    offline: bool,
    rate_limited: u32,
    calls: HashMap<String, usize>,
    /// (path, bearer) in arrival order.
    log: Vec<(String, Option<String>)>,
    /// Length of `log` when the last access credential was issued.
    issued_at: usize,
}

pub(crate) struct FakeServer {
    state: Mutex<State>,
    refresh_gate: Option<Semaphore>,
}

impl FakeServer {
    pub const BASE_URL: &'static str = "http://test.local/api";
    pub const USERNAME: &'static str = "ada";
    pub const PASSWORD: &'static str = "analytical-engine";
    pub const TAKEN_EMAIL: &'static str = "taken@example.com";

    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Refresh calls block until [`FakeServer::release_refresh`].
    pub fn holding_refresh() -> Arc<Self> {
        Arc::new(Self::build(Some(Semaphore::new(0))))
    }

    fn build(refresh_gate: Option<Semaphore>) -> Self {
        Self {
            state: Mutex::new(State {
                access: "access-0".into(),
                refresh: "refresh-0".into(),
                ..Default::default()
            }),
            refresh_gate,
        }
    }

    pub fn base_url() -> Url {
        Url::parse(&format!("{}/", Self::BASE_URL)).expect("valid test url")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn access_token(&self) -> String {
        self.lock().access.clone()
    }

    pub fn refresh_token(&self) -> String {
        self.lock().refresh.clone()
    }

    pub fn release_refresh(&self) {
        if let Some(gate) = &self.refresh_gate {
            gate.add_permits(1);
        }
    }

    /// Invalidate the current access credential without issuing a new one.
    pub fn expire_access(&self) {
        self.lock().access = "expired".into();
    }

    pub fn reject_refresh(&self) {
        self.lock().reject_refresh = true;
    }

    pub fn rotate_refresh(&self) {
        self.lock().rotate_refresh = true;
    }

    pub fn deny_courses(&self) {
        self.lock().deny_courses = true;
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn rate_limit_courses(&self, times: u32) {
        self.lock().rate_limited = times;
    }

    pub fn calls(&self, path: &str) -> usize {
        self.lock().calls.get(path).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    pub fn last_bearer(&self, path: &str) -> Option<String> {
        self.lock()
            .log
            .iter()
            .rev()
            .find(|(p, _)| p == path)
            .and_then(|(_, bearer)| bearer.clone())
    }

    pub fn bearers_since_refresh(&self, path: &str) -> Vec<String> {
        let state = self.lock();
        state.log[state.issued_at..]
            .iter()
            .filter(|(p, _)| p == path)
            .filter_map(|(_, bearer)| bearer.clone())
            .collect()
    }

    async fn handle(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let path = request.url.path().to_string();
        let bearer = request
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
        let body = request.body.unwrap_or(Value::Null);

        {
            let mut state = self.lock();
            *state.calls.entry(path.clone()).or_default() += 1;
            state.log.push((path.clone(), bearer.clone()));
            if state.offline {
                return Err(ApiError::Network("connection refused".into()));
            }
        }

        if path == "/api/auth/refresh" {
            if let Some(gate) = &self.refresh_gate {
                gate.acquire().await.expect("gate closed").forget();
            }
        }

        let mut state = self.lock();
        let (status, reply) = match path.as_str() {
            "/api/auth/login" => {
                if body["username"] == Self::USERNAME && body["password"] == Self::PASSWORD {
                    state.access = "access-0".into();
                    state.refresh = "refresh-0".into();
                    (
                        StatusCode::OK,
                        json!({"access": state.access, "refresh": state.refresh}),
                    )
                } else {
                    (
                        StatusCode::UNAUTHORIZED,
                        json!({"detail": "No active account found with the given credentials"}),
                    )
                }
            }
            "/api/auth/refresh" => {
                if state.reject_refresh || body["refresh"] != state.refresh.as_str() {
                    (
                        StatusCode::UNAUTHORIZED,
                        json!({"detail": "Token is invalid or expired", "code": "token_not_valid"}),
                    )
                } else {
                    state.issued += 1;
                    state.access = format!("access-{}", state.issued);
                    state.issued_at = state.log.len();
                    if state.rotate_refresh {
                        state.refresh = format!("refresh-{}", state.issued);
                        (
                            StatusCode::OK,
                            json!({"access": state.access, "refresh": state.refresh}),
                        )
                    } else {
                        (StatusCode::OK, json!({"access": state.access}))
                    }
                }
            }
            "/api/auth/me" => {
                if bearer.as_deref() == Some(state.access.as_str()) {
                    (
                        StatusCode::OK,
                        json!({
                            "id": 1,
                            "email": "ada@example.com",
                            "first_name": "Ada",
                            "last_name": "Lovelace",
                            "role": "student"
                        }),
                    )
                } else {
                    unauthorized()
                }
            }
            "/api/auth/register" => {
                if body["email"] == Self::TAKEN_EMAIL {
                    (
                        StatusCode::BAD_REQUEST,
                        json!({"email": ["user with this email already exists."]}),
                    )
                } else {
                    (
                        StatusCode::CREATED,
                        json!({"message": "Registration successful"}),
                    )
                }
            }
            "/api/auth/forgot-password" => (
                StatusCode::OK,
                json!({"message": "If the account exists, a reset link has been sent"}),
            ),
            "/api/courses/" => {
                if state.rate_limited > 0 {
                    state.rate_limited -= 1;
                    (StatusCode::TOO_MANY_REQUESTS, json!({"detail": "Slow down"}))
                } else if state.deny_courses || bearer.as_deref() != Some(state.access.as_str()) {
                    unauthorized()
                } else {
                    (
                        StatusCode::OK,
                        json!([{"id": 1, "title": "Intro to Rust", "progress": 0.5}]),
                    )
                }
            }
            _ => (StatusCode::NOT_FOUND, json!({"detail": "Not found."})),
        };

        Ok(HttpResponse {
            status,
            body: reply.to_string(),
        })
    }
}

fn unauthorized() -> (StatusCode, Value) {
    (
        StatusCode::UNAUTHORIZED,
        json!({"detail": "Authentication credentials were not provided."}),
    )
}

impl HttpSend for FakeServer {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, ApiError>> {
        Box::pin(self.handle(request))
    }
}
