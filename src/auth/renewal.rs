//! Transparent session renewal.
//!
//! When a protected request comes back 401, the dispatcher hands control
//! here. The coordinator guarantees at most one refresh call is in flight at
//! a time: the first failing request performs the refresh, every request that
//! fails while it is running parks on a oneshot result slot and shares the
//! outcome. On an unrecoverable failure the credential store is cleared and a
//! `SessionEvent::Lost` is broadcast so the surface can fall back to the
//! unauthenticated entry point.

use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::api::error::ApiError;

use super::store::TokenStore;

/// Token refresh endpoint. Requests to this path are never decorated with a
/// bearer token and a 401 from it is fatal rather than re-entering renewal.
pub const REFRESH_PATH: &str = "/api/auth/token/refresh";

/// Capacity of the session event channel.
/// Events are rare (one per renewal or teardown); 16 leaves slack for a slow
/// subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle notifications observed by the binary and the route guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A credential pair was stored after successful OTP verification.
    Established,
    /// The access token was renewed without the caller noticing.
    Renewed,
    /// The session is unrecoverable: credentials are cleared and the user
    /// must start over at the entry point.
    Lost,
}

type RenewalOutcome = Result<String, ApiError>;

/// Requests suspended behind an in-flight renewal. Each slot is resolved
/// exactly once, in enqueue order, with the shared outcome.
struct RenewalQueue {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<RenewalOutcome>>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
    refresh: Option<String>,
}

pub struct RenewalCoordinator {
    http: Client,
    base_url: String,
    store: Arc<TokenStore>,
    queue: Mutex<RenewalQueue>,
    events: broadcast::Sender<SessionEvent>,
}

impl RenewalCoordinator {
    pub fn new(http: Client, base_url: String, store: Arc<TokenStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            http,
            base_url,
            store,
            queue: Mutex::new(RenewalQueue {
                in_flight: false,
                waiters: Vec::new(),
            }),
            events,
        }
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Announce that OTP verification stored a fresh credential pair.
    pub(crate) fn notify_established(&self) {
        let _ = self.events.send(SessionEvent::Established);
    }

    /// Tear the session down: clear credentials, broadcast `Lost`, and hand
    /// back the error protected callers observe.
    pub(crate) fn teardown(&self, reason: &str) -> ApiError {
        warn!(reason, "Session torn down");
        self.store.clear();
        let _ = self.events.send(SessionEvent::Lost);
        ApiError::SessionLost(reason.to_string())
    }

    fn lock_queue(&self) -> MutexGuard<'_, RenewalQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Obtain a fresh access token, sharing one refresh call among all
    /// concurrent callers. Returns the new access token on success; any
    /// failure clears the credential store and resolves as `SessionLost` for
    /// the caller and every queued waiter.
    pub async fn renew(&self) -> RenewalOutcome {
        let waiter = {
            let mut queue = self.lock_queue();
            if queue.in_flight {
                let (tx, rx) = oneshot::channel();
                queue.waiters.push(tx);
                Some(rx)
            } else {
                queue.in_flight = true;
                None
            }
        };

        if let Some(rx) = waiter {
            debug!("Renewal already in flight, suspending until it settles");
            return rx
                .await
                .map_err(|_| ApiError::SessionLost("renewal abandoned".to_string()))?;
        }

        // Any renewal failure is terminal for the session; a raw transport or
        // status error must not leak to protected callers as retryable.
        let outcome = self.refresh_once().await.map_err(|err| match err {
            ApiError::SessionLost(_) => err,
            other => ApiError::SessionLost(other.to_string()),
        });

        if outcome.is_err() {
            self.store.clear();
        }

        // Drop the in-flight flag before releasing anyone, on every path.
        let waiters = {
            let mut queue = self.lock_queue();
            queue.in_flight = false;
            std::mem::take(&mut queue.waiters)
        };

        if !waiters.is_empty() {
            debug!(queued = waiters.len(), "Renewal settled, releasing queued requests");
        }
        for slot in waiters {
            let _ = slot.send(outcome.clone());
        }

        match &outcome {
            Ok(_) => {
                info!("Access token renewed");
                let _ = self.events.send(SessionEvent::Renewed);
            }
            Err(err) => {
                warn!(error = %err, "Session renewal failed, credentials cleared");
                let _ = self.events.send(SessionEvent::Lost);
            }
        }

        outcome
    }

    async fn refresh_once(&self) -> RenewalOutcome {
        let Some(refresh) = self.store.refresh() else {
            return Err(ApiError::SessionLost("no refresh token".to_string()));
        };

        let url = format!("{}{}", self.base_url, REFRESH_PATH);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "refresh": refresh }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            // Includes 401: a rejected refresh token is fatal, never retried.
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Token refresh rejected");
            return Err(ApiError::SessionLost(format!(
                "refresh rejected with status {status}: {body}"
            )));
        }

        let refreshed: RefreshResponse = response.json().await?;
        // Keep the old refresh token when the server did not rotate it.
        self.store
            .set_tokens(refreshed.access.clone(), refreshed.refresh);
        Ok(refreshed.access)
    }
}
