//! Gate for protected surfaces.
//!
//! Mirrors what the portal's protected pages do before rendering: deny
//! outright when no access token is stored, otherwise probe the session with
//! `me`. The probe dispatches normally, so an expired access token is renewed
//! transparently before a decision is made.

use tracing::debug;

use crate::api::{ApiClient, Identity};

/// Whether a protected surface may proceed.
#[derive(Debug, Clone)]
pub enum GateDecision {
    Allow(Identity),
    Deny,
}

pub struct RouteGuard {
    api: ApiClient,
}

impl RouteGuard {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Decide whether the visitor holds a live session. The returned future
    /// is abandonable: dropping it before completion leaves no trace.
    pub async fn check(&self) -> GateDecision {
        if !self.api.store().has_access() {
            return GateDecision::Deny;
        }
        match self.api.me().await {
            Ok(identity) => GateDecision::Allow(identity),
            Err(err) => {
                debug!(error = %err, "Liveness probe failed");
                GateDecision::Deny
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::TokenStore;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn temp_store() -> Arc<TokenStore> {
        let dir = std::env::temp_dir().join(format!(
            "invitegate-guard-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        Arc::new(TokenStore::open(dir))
    }

    #[tokio::test]
    async fn test_missing_token_denies_without_network_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), temp_store()).expect("client builds");
        let guard = RouteGuard::new(api);
        assert!(matches!(guard.check().await, GateDecision::Deny));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_live_session_allows() {
        let server = MockServer::start().await;
        let store = temp_store();
        store.set_tokens("A".into(), Some("R".into()));

        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "phone": "0512345678"
            })))
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), Arc::clone(&store)).expect("client builds");
        let guard = RouteGuard::new(api);
        match guard.check().await {
            GateDecision::Allow(identity) => assert_eq!(identity.phone, "0512345678"),
            GateDecision::Deny => panic!("expected allow"),
        }
        store.clear();
    }

    #[tokio::test]
    async fn test_dead_session_denies() {
        let server = MockServer::start().await;
        let store = temp_store();
        store.set_tokens("A".into(), None);

        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), Arc::clone(&store)).expect("client builds");
        let guard = RouteGuard::new(api);
        assert!(matches!(guard.check().await, GateDecision::Deny));
    }
}
