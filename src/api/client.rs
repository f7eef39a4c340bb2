//! HTTP dispatcher for the invitation portal API.
//!
//! Every outbound call goes through `ApiClient::dispatch`, which decorates
//! the request with the current access token and transparently renews the
//! session on a 401 before replaying the request once. OTP endpoints get
//! typed wrappers because their denial and cooldown answers carry meaning in
//! the response body rather than the status line.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::renewal::{RenewalCoordinator, SessionEvent, REFRESH_PATH};
use crate::auth::store::TokenStore;
use crate::phone::normalize_phone;

use super::error::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// Matches the portal web client's 15s timeout.
const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Maximum number of contacts per invitation submission, enforced locally
/// before the request is sent.
const MAX_INVITATION_CONTACTS: usize = 3;

const REQUEST_OTP_PATH: &str = "/api/auth/request-otp";
const VERIFY_OTP_PATH: &str = "/api/auth/verify-otp";
const ME_PATH: &str = "/api/auth/me";
const INVITATIONS_PATH: &str = "/api/auth/invitations";

// ============================================================================
// Request description
// ============================================================================

/// A logical request. `attempt` is immutable data threaded through the
/// description: a replay after renewal is a fresh spec with the count bumped,
/// never a flag mutated on shared state.
#[derive(Debug, Clone)]
struct RequestSpec {
    method: Method,
    path: &'static str,
    body: Option<Value>,
    attempt: u8,
}

impl RequestSpec {
    fn new(method: Method, path: &'static str, body: Option<Value>) -> Self {
        Self {
            method,
            path,
            body,
            attempt: 0,
        }
    }

    fn replay(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

// ============================================================================
// Typed outcomes
// ============================================================================

/// Outcome of requesting a one-time code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpRequestOutcome {
    /// A code was sent; `request_id` binds the upcoming verification attempt
    /// to this specific code.
    Sent { request_id: String },
    /// Uniform denial. Ineligible and unknown numbers land here alike, with
    /// no reason disclosed.
    Denied,
    /// A code was sent recently; wait before asking for another.
    Cooldown {
        remaining: u64,
        message: Option<String>,
    },
}

/// Outcome of submitting a code for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpVerifyOutcome {
    /// Tokens were returned and stored; the session is established.
    Verified,
    /// Wrong code; the challenge stays open.
    Rejected {
        message: Option<String>,
        attempts_remaining: Option<u32>,
    },
    /// Attempt budget spent; the current request id is dead and a new code
    /// must be requested.
    Exhausted,
}

/// The authenticated identity behind the current session.
#[derive(Debug, Clone)]
pub struct Identity {
    pub phone: String,
}

/// A guest to invite on behalf of the authenticated visitor.
#[derive(Debug, Clone)]
pub struct InviteContact {
    pub name: String,
    pub phone: String,
}

/// Server acknowledgement for an invitation submission.
#[derive(Debug, Clone)]
pub struct InvitationReceipt {
    pub created: u32,
    pub message: Option<String>,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OtpRequestResponse {
    ok: bool,
    request_id: Option<String>,
    message: Option<String>,
    cooldown_remaining: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OtpVerifyResponse {
    ok: bool,
    access: Option<String>,
    refresh: Option<String>,
    message: Option<String>,
    attempts_remaining: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MeResponse {
    phone: String,
}

#[derive(Debug, Deserialize)]
struct InvitationResponse {
    message: Option<String>,
    #[serde(default)]
    created: u32,
}

// ============================================================================
// Client
// ============================================================================

/// API client for the invitation portal.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    store: Arc<TokenStore>,
    renewal: Arc<RenewalCoordinator>,
}

impl ApiClient {
    /// Create a client against the given portal base URL.
    pub fn new(base_url: impl Into<String>, store: Arc<TokenStore>) -> Result<Self, ApiError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let renewal = Arc::new(RenewalCoordinator::new(
            http.clone(),
            base_url.clone(),
            Arc::clone(&store),
        ));
        Ok(Self {
            http,
            base_url,
            store,
            renewal,
        })
    }

    /// The credential store backing this client.
    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Subscribe to session lifecycle events (established, renewed, lost).
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.renewal.subscribe()
    }

    // ===== Dispatch =====

    async fn send_once(
        &self,
        spec: &RequestSpec,
        token: Option<&str>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.base_url, spec.path);
        let mut request = self.http.request(spec.method.clone(), &url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = &spec.body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Send a logical request. The current access token is attached when one
    /// is present (never for the refresh endpoint); a 401 on the first
    /// attempt is handed to the renewal coordinator and the request replayed
    /// once with the fresh token.
    async fn dispatch(&self, spec: RequestSpec) -> Result<reqwest::Response, ApiError> {
        let token = if spec.path == REFRESH_PATH {
            None
        } else {
            self.store.access()
        };
        let response = self.send_once(&spec, token.as_deref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED || spec.path == REFRESH_PATH {
            return Ok(response);
        }
        if spec.attempt > 0 {
            warn!(path = spec.path, "Request rejected again after renewal");
            return Err(self.renewal.teardown("request re-rejected after renewal"));
        }

        debug!(path = spec.path, "Access token rejected, renewing session");
        let access = self.renewal.renew().await?;

        let replay = spec.replay();
        let response = self.send_once(&replay, Some(&access)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path = replay.path, "Fresh token rejected");
            return Err(self.renewal.teardown("request re-rejected after renewal"));
        }
        Ok(response)
    }

    /// Read a success body as JSON, mapping failure statuses to `ApiError`.
    async fn into_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }
        Ok(response.json().await?)
    }

    // ===== Auth endpoints =====

    /// Ask the backend to send a one-time code to `phone` (already
    /// normalized). Denial and cooldown answers arrive as `ok=false` bodies
    /// across several statuses, so the body is interpreted before the status
    /// line.
    pub async fn request_otp(&self, phone: &str) -> Result<OtpRequestOutcome, ApiError> {
        let spec = RequestSpec::new(
            Method::POST,
            REQUEST_OTP_PATH,
            Some(serde_json::json!({ "phone": phone })),
        );
        let response = self.dispatch(spec).await?;
        let status = response.status();
        let text = response.text().await.map_err(ApiError::from)?;

        if let Ok(parsed) = serde_json::from_str::<OtpRequestResponse>(&text) {
            if parsed.ok {
                return match parsed.request_id {
                    Some(request_id) => Ok(OtpRequestOutcome::Sent { request_id }),
                    None => Err(ApiError::Transport(
                        "request-otp response missing requestId".to_string(),
                    )),
                };
            }
            if let Some(remaining) = parsed.cooldown_remaining {
                return Ok(OtpRequestOutcome::Cooldown {
                    remaining,
                    message: parsed.message,
                });
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(ApiError::Throttled { retry_after: None });
            }
            debug!("OTP request denied");
            return Ok(OtpRequestOutcome::Denied);
        }

        match status.as_u16() {
            // Uniform denial regardless of which status the backend chose
            403 | 404 => Ok(OtpRequestOutcome::Denied),
            _ => Err(ApiError::from_status(status, &text)),
        }
    }

    /// Submit a code against the challenge identified by `request_id`. On
    /// success the returned credential pair is stored before this returns.
    pub async fn verify_otp(
        &self,
        phone: &str,
        request_id: &str,
        code: &str,
    ) -> Result<OtpVerifyOutcome, ApiError> {
        let spec = RequestSpec::new(
            Method::POST,
            VERIFY_OTP_PATH,
            Some(serde_json::json!({
                "phone": phone,
                "requestId": request_id,
                "code": code,
            })),
        );
        let response = self.dispatch(spec).await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(OtpVerifyOutcome::Exhausted);
        }

        let text = response.text().await.map_err(ApiError::from)?;
        if let Ok(parsed) = serde_json::from_str::<OtpVerifyResponse>(&text) {
            if parsed.ok {
                let Some(access) = parsed.access else {
                    return Err(ApiError::Transport(
                        "verify-otp response missing tokens".to_string(),
                    ));
                };
                // Both fields stored in one step before control yields.
                self.store.set_tokens(access, parsed.refresh);
                self.renewal.notify_established();
                info!("OTP verified, session established");
                return Ok(OtpVerifyOutcome::Verified);
            }
            return Ok(OtpVerifyOutcome::Rejected {
                message: parsed.message,
                attempts_remaining: parsed.attempts_remaining,
            });
        }

        Err(ApiError::from_status(status, &text))
    }

    /// Liveness probe: who does the current session belong to?
    pub async fn me(&self) -> Result<Identity, ApiError> {
        let spec = RequestSpec::new(Method::GET, ME_PATH, None);
        let response = self.dispatch(spec).await?;
        let me: MeResponse = Self::into_json(response).await?;
        Ok(Identity { phone: me.phone })
    }

    // ===== Protected endpoints =====

    /// Submit up to three guest invitations. Contact phones are normalized
    /// locally and the whole batch is rejected before any network call if one
    /// of them is invalid.
    pub async fn submit_invitations(
        &self,
        contacts: &[InviteContact],
    ) -> Result<InvitationReceipt, ApiError> {
        if contacts.is_empty() {
            return Err(ApiError::Validation(
                "at least one contact is required".to_string(),
            ));
        }
        if contacts.len() > MAX_INVITATION_CONTACTS {
            return Err(ApiError::Validation(format!(
                "at most {MAX_INVITATION_CONTACTS} contacts may be invited"
            )));
        }

        let mut payload = Vec::with_capacity(contacts.len());
        for contact in contacts {
            let name = contact.name.trim();
            if name.is_empty() {
                return Err(ApiError::Validation("contact name is required".to_string()));
            }
            let phone = normalize_phone(&contact.phone).ok_or_else(|| {
                ApiError::Validation(format!("invalid phone number for {name}"))
            })?;
            payload.push(serde_json::json!({ "name": name, "phone": phone }));
        }

        let spec = RequestSpec::new(
            Method::POST,
            INVITATIONS_PATH,
            Some(serde_json::json!({ "contacts": payload })),
        );
        let response = self.dispatch(spec).await?;
        let receipt: InvitationResponse = Self::into_json(response).await?;
        Ok(InvitationReceipt {
            created: receipt.created,
            message: receipt.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn temp_store() -> Arc<TokenStore> {
        let dir = std::env::temp_dir().join(format!(
            "invitegate-client-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        Arc::new(TokenStore::open(dir))
    }

    async fn client(server: &MockServer) -> (ApiClient, Arc<TokenStore>) {
        let store = temp_store();
        let api = ApiClient::new(server.uri(), Arc::clone(&store)).expect("client builds");
        (api, store)
    }

    #[tokio::test]
    async fn test_me_attaches_bearer_token() {
        let server = MockServer::start().await;
        let (api, store) = client(&server).await;
        store.set_tokens("A".into(), Some("R".into()));

        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .and(header("authorization", "Bearer A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "phone": "0512345678"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let identity = api.me().await.expect("me succeeds");
        assert_eq!(identity.phone, "0512345678");
        server.verify().await;
        store.clear();
    }

    #[tokio::test]
    async fn test_public_request_goes_out_unauthenticated() {
        let server = MockServer::start().await;
        let (api, _store) = client(&server).await;

        // No token stored: no Authorization header may be attached.
        Mock::given(method("POST"))
            .and(path("/api/auth/request-otp"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/request-otp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "requestId": "r1"
            })))
            .mount(&server)
            .await;

        let outcome = api.request_otp("0512345678").await.expect("request ok");
        assert_eq!(
            outcome,
            OtpRequestOutcome::Sent {
                request_id: "r1".to_string()
            }
        );
        server.verify().await;
    }

    #[tokio::test]
    async fn test_expired_token_is_renewed_and_request_replayed() {
        let server = MockServer::start().await;
        let (api, store) = client(&server).await;
        store.set_tokens("stale".into(), Some("r1".into()));

        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/token/refresh"))
            .and(body_json(json!({ "refresh": "r1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access": "fresh"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "phone": "0512345678"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let identity = api.me().await.expect("renewal should be transparent");
        assert_eq!(identity.phone, "0512345678");
        assert_eq!(store.access().as_deref(), Some("fresh"));
        assert_eq!(store.refresh().as_deref(), Some("r1"));
        server.verify().await;
        store.clear();
    }

    #[tokio::test]
    async fn test_refresh_endpoint_never_gets_bearer_token() {
        let server = MockServer::start().await;
        let (api, store) = client(&server).await;
        store.set_tokens("stale".into(), Some("r1".into()));

        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/token/refresh"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/token/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access": "fresh"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "phone": "0512345678"
            })))
            .mount(&server)
            .await;

        api.me().await.expect("renewal should be transparent");
        server.verify().await;
        store.clear();
    }

    #[tokio::test]
    async fn test_second_401_after_renewal_is_session_lost() {
        let server = MockServer::start().await;
        let (api, store) = client(&server).await;
        store.set_tokens("stale".into(), Some("r1".into()));

        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/token/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access": "fresh"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = api.me().await.expect_err("must not loop");
        assert!(matches!(err, ApiError::SessionLost(_)));
        // Fail closed: the rejected fresh token must not be reused
        assert!(!store.has_access());
        server.verify().await;
    }

    #[tokio::test]
    async fn test_verify_otp_stores_returned_pair() {
        let server = MockServer::start().await;
        let (api, store) = client(&server).await;

        Mock::given(method("POST"))
            .and(path("/api/auth/verify-otp"))
            .and(body_json(json!({
                "phone": "0512345678",
                "requestId": "r1",
                "code": "1234",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "access": "A",
                "refresh": "R"
            })))
            .mount(&server)
            .await;

        let outcome = api
            .verify_otp("0512345678", "r1", "1234")
            .await
            .expect("verify ok");
        assert_eq!(outcome, OtpVerifyOutcome::Verified);
        assert_eq!(store.access().as_deref(), Some("A"));
        assert_eq!(store.refresh().as_deref(), Some("R"));
        store.clear();
    }

    #[tokio::test]
    async fn test_verify_otp_reports_attempts_remaining() {
        let server = MockServer::start().await;
        let (api, _store) = client(&server).await;

        Mock::given(method("POST"))
            .and(path("/api/auth/verify-otp"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "message": "wrong code",
                "attemptsRemaining": 2
            })))
            .mount(&server)
            .await;

        let outcome = api
            .verify_otp("0512345678", "r1", "1234")
            .await
            .expect("rejection is not a transport error");
        assert_eq!(
            outcome,
            OtpVerifyOutcome::Rejected {
                message: Some("wrong code".to_string()),
                attempts_remaining: Some(2),
            }
        );
    }

    #[tokio::test]
    async fn test_verify_otp_429_is_exhausted() {
        let server = MockServer::start().await;
        let (api, _store) = client(&server).await;

        Mock::given(method("POST"))
            .and(path("/api/auth/verify-otp"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "ok": false,
                "message": "too many attempts"
            })))
            .mount(&server)
            .await;

        let outcome = api
            .verify_otp("0512345678", "r1", "1234")
            .await
            .expect("exhaustion is a typed outcome");
        assert_eq!(outcome, OtpVerifyOutcome::Exhausted);
    }

    #[tokio::test]
    async fn test_request_otp_denial_is_uniform_across_statuses() {
        for status in [200u16, 403, 404] {
            let server = MockServer::start().await;
            let (api, _store) = client(&server).await;

            Mock::given(method("POST"))
                .and(path("/api/auth/request-otp"))
                .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                    "ok": false,
                    "message": "denied"
                })))
                .mount(&server)
                .await;

            let outcome = api.request_otp("0512345678").await.expect("typed denial");
            assert_eq!(outcome, OtpRequestOutcome::Denied, "status {status}");
        }
    }

    #[tokio::test]
    async fn test_request_otp_cooldown_info_is_surfaced() {
        let server = MockServer::start().await;
        let (api, _store) = client(&server).await;

        Mock::given(method("POST"))
            .and(path("/api/auth/request-otp"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "ok": false,
                "message": "wait",
                "cooldownRemaining": 42
            })))
            .mount(&server)
            .await;

        let outcome = api.request_otp("0512345678").await.expect("typed cooldown");
        assert_eq!(
            outcome,
            OtpRequestOutcome::Cooldown {
                remaining: 42,
                message: Some("wait".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_request_otp_bare_429_is_throttled() {
        let server = MockServer::start().await;
        let (api, _store) = client(&server).await;

        Mock::given(method("POST"))
            .and(path("/api/auth/request-otp"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "detail": "Request was throttled."
            })))
            .mount(&server)
            .await;

        let err = api.request_otp("0512345678").await.expect_err("throttled");
        assert!(matches!(err, ApiError::Throttled { .. }));
    }

    #[tokio::test]
    async fn test_submit_invitations_validates_locally() {
        let server = MockServer::start().await;
        let (api, _store) = client(&server).await;

        Mock::given(method("POST"))
            .and(path("/api/auth/invitations"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let too_many: Vec<InviteContact> = (0..4)
            .map(|i| InviteContact {
                name: format!("guest {i}"),
                phone: "0512345678".to_string(),
            })
            .collect();
        assert!(matches!(
            api.submit_invitations(&too_many).await,
            Err(ApiError::Validation(_))
        ));

        let bad_phone = [InviteContact {
            name: "guest".to_string(),
            phone: "not-a-phone".to_string(),
        }];
        assert!(matches!(
            api.submit_invitations(&bad_phone).await,
            Err(ApiError::Validation(_))
        ));

        server.verify().await;
    }

    #[tokio::test]
    async fn test_submit_invitations_normalizes_contact_phones() {
        let server = MockServer::start().await;
        let (api, store) = client(&server).await;
        store.set_tokens("A".into(), Some("R".into()));

        Mock::given(method("POST"))
            .and(path("/api/auth/invitations"))
            .and(body_json(json!({
                "contacts": [{ "name": "guest", "phone": "0512345678" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "message": "created",
                "created": 1
            })))
            .expect(1)
            .mount(&server)
            .await;

        let contacts = [InviteContact {
            name: " guest ".to_string(),
            phone: "+966512345678".to_string(),
        }];
        let receipt = api.submit_invitations(&contacts).await.expect("created");
        assert_eq!(receipt.created, 1);
        server.verify().await;
        store.clear();
    }
}
