//! Single-flight credential refresh.
//!
//! The coordinator is an explicit `Idle` / `Running { waiters }` state machine.
//! The first caller to report an authorization failure while idle performs the
//! one `POST /auth/refresh` call; every caller that reports a failure while it
//! is running parks on a oneshot channel and receives the same outcome.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Url;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::api::client::HttpSend;
use crate::api::{ApiError, ApiRequest};
use crate::models::{RefreshRequest, RefreshResponse};

use super::session::{SessionState, TeardownReason};

const REFRESH_PATH: &str = "auth/refresh";

/// What a caller blocked on an authorization failure should do next.
#[derive(Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Replay the request with this access credential.
    Refreshed(String),
    /// Give up; the session has been torn down.
    Failed,
}

impl std::fmt::Debug for RefreshOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshOutcome::Refreshed(_) => f.write_str("Refreshed(<redacted>)"),
            RefreshOutcome::Failed => f.write_str("Failed"),
        }
    }
}

enum RefreshState {
    Idle,
    Running {
        waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    },
}

pub struct RefreshCoordinator {
    http: Arc<dyn HttpSend>,
    base_url: Url,
    session: Arc<SessionState>,
    state: Mutex<RefreshState>,
}

/// Resets the coordinator if the initiating future is dropped mid-refresh.
/// Parked waiters see their channel close and one of them takes over.
struct RunningGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    finished: bool,
}

impl RunningGuard<'_> {
    fn finish(mut self, outcome: &RefreshOutcome) {
        self.finished = true;
        self.coordinator.release(outcome);
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let waiters = self.coordinator.take_waiters();
            warn!(
                waiters = waiters.len(),
                "Refresh abandoned before completion, handing over"
            );
        }
    }
}

impl RefreshCoordinator {
    pub fn new(http: Arc<dyn HttpSend>, base_url: Url, session: Arc<SessionState>) -> Self {
        Self {
            http,
            base_url,
            session,
            state: Mutex::new(RefreshState::Idle),
        }
    }

    /// Recover from an authorization failure on a request that was sent while
    /// the store was at `observed_generation`.
    pub async fn recover(&self, observed_generation: u64) -> RefreshOutcome {
        loop {
            let waiter = {
                let mut state = self.lock_state();
                match &mut *state {
                    RefreshState::Running { waiters } => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        debug!(waiting = waiters.len(), "Joining in-flight refresh");
                        Some(rx)
                    }
                    RefreshState::Idle => {
                        if let Some(outcome) = self.superseded(observed_generation) {
                            return outcome;
                        }
                        *state = RefreshState::Running {
                            waiters: Vec::new(),
                        };
                        None
                    }
                }
            };

            match waiter {
                Some(rx) => match rx.await {
                    Ok(outcome) => return outcome,
                    // The initiator went away without an outcome
                    Err(_) => continue,
                },
                None => {
                    let guard = RunningGuard {
                        coordinator: self,
                        finished: false,
                    };
                    let outcome = self.run_refresh().await;
                    guard.finish(&outcome);
                    return outcome;
                }
            }
        }
    }

    /// Number of callers parked on the in-flight refresh.
    pub fn waiting(&self) -> usize {
        match &*self.lock_state() {
            RefreshState::Idle => 0,
            RefreshState::Running { waiters } => waiters.len(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.lock_state(), RefreshState::Running { .. })
    }

    /// If the store changed since the failing request was sent, its credential
    /// was already superseded and no new refresh is needed.
    fn superseded(&self, observed_generation: u64) -> Option<RefreshOutcome> {
        let store = self.session.store();
        let snapshot = store.snapshot();
        if snapshot.generation == observed_generation {
            return None;
        }
        match snapshot.access {
            Some(access) => {
                debug!("Credential already replaced since request was sent");
                Some(RefreshOutcome::Refreshed(access))
            }
            None if store.refresh_token().is_none() => {
                debug!("Session already cleared since request was sent");
                Some(RefreshOutcome::Failed)
            }
            None => None,
        }
    }

    async fn run_refresh(&self) -> RefreshOutcome {
        let store = self.session.store();
        let Some(refresh) = store.refresh_token() else {
            warn!("No refresh credential stored");
            self.session.teardown(TeardownReason::MissingRefreshCredential);
            return RefreshOutcome::Failed;
        };

        info!("Refreshing access credential");
        let response = match self.request_refresh(&refresh).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Credential refresh failed");
                self.session.teardown(TeardownReason::RefreshRejected);
                return RefreshOutcome::Failed;
            }
        };

        match store.replace_access(&refresh, &response.access, response.refresh.as_deref()) {
            Ok(true) => {
                info!("Access credential refreshed");
                RefreshOutcome::Refreshed(response.access)
            }
            Ok(false) => {
                // The pair was replaced or cleared while the call was out
                debug!("Discarding refreshed credential for a superseded session");
                store
                    .access_token()
                    .map_or(RefreshOutcome::Failed, RefreshOutcome::Refreshed)
            }
            Err(e) => {
                warn!(error = %e, "Failed to persist refreshed credential");
                RefreshOutcome::Refreshed(response.access)
            }
        }
    }

    /// One attempt, never retried.
    async fn request_refresh(&self, refresh: &str) -> Result<RefreshResponse, ApiError> {
        let request = ApiRequest::post(REFRESH_PATH)
            .anonymous()
            .json(&RefreshRequest { refresh })?;
        let http = request.to_http(&self.base_url, None)?;
        if !self.session.store().policy().allows(&http.url) {
            return Err(ApiError::InvalidRequest(format!(
                "Refusing to send refresh credential over {}",
                http.url.scheme()
            )));
        }
        let response = self.http.send(http).await?.into_result()?;
        response.json()
    }

    fn release(&self, outcome: &RefreshOutcome) {
        let waiters = self.take_waiters();
        debug!(waiters = waiters.len(), ?outcome, "Releasing refresh waiters");
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Return to `Idle`, handing back whoever was parked.
    fn take_waiters(&self) -> Vec<oneshot::Sender<RefreshOutcome>> {
        let mut state = self.lock_state();
        match std::mem::replace(&mut *state, RefreshState::Idle) {
            RefreshState::Running { waiters } => waiters,
            RefreshState::Idle => Vec::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
