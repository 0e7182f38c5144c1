//! Authenticated request execution.

use crate::error::Result;
use crate::machine::CredentialStateMachine;
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use core_runtime::logging::redact_authorization;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Retries after a `401` used by [`TransactionGateway::perform`].
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Performs HTTP transactions with the current bearer credential attached.
///
/// A `401` response marks the credential stale, waits for the (coalesced)
/// refresh and retries with the new credential, up to `max_retries` times.
/// A `401` on the last attempt is returned to the caller as-is.
pub struct TransactionGateway {
    machine: Arc<CredentialStateMachine>,
    http_client: Arc<dyn HttpClient>,
    request_timeout: Option<Duration>,
}

impl TransactionGateway {
    pub fn new(machine: Arc<CredentialStateMachine>, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            machine,
            http_client,
            request_timeout: None,
        }
    }

    /// Deadline applied to requests that do not set their own.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn machine(&self) -> &Arc<CredentialStateMachine> {
        &self.machine
    }

    /// Sends `request` with one retry on `401`.
    pub async fn perform(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.perform_with(|| request.clone(), DEFAULT_MAX_RETRIES)
            .await
    }

    /// Builds a request with `configure` for every attempt and sends it with
    /// the `Authorization` header replaced by the current credential.
    #[instrument(skip(self, configure))]
    pub async fn perform_with<F>(&self, configure: F, max_retries: u32) -> Result<HttpResponse>
    where
        F: Fn() -> HttpRequest + Send + Sync,
    {
        let mut retries_left = max_retries;
        loop {
            let credential = self.machine.acquire_for_transaction().await?;

            let mut request = configure();
            if request.timeout.is_none() {
                request.timeout = self.request_timeout;
            }
            let request = request.authorization(&credential.token_type, &credential.access_token);
            debug!(
                method = request.method.as_str(),
                url = %request.url,
                authorization = %redact_authorization(&credential.authorization_value()),
                "Performing transaction"
            );

            let response = self.http_client.execute(request).await?;

            if response.is_unauthorized() && retries_left > 0 {
                retries_left -= 1;
                warn!(retries_left, "Credential rejected, refreshing before retry");
                self.machine.report_unauthorized(&credential)?;
                continue;
            }

            return Ok(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use crate::machine::MachineOptions;
    use crate::params::AuthorizationParameters;
    use crate::types::{Credential, CredentialState};
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::http::HttpMethod;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const TOKEN_URL: &str = "https://auth.example.com/token";

    /// Token endpoint issuing `access-N`; resource rejects every token in
    /// `rejected`.
    #[derive(Default)]
    struct FakeServer {
        refreshes: AtomicUsize,
        rejected: Mutex<Vec<String>>,
        seen: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl HttpClient for FakeServer {
        async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
            if request.url == TOKEN_URL {
                let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
                let body = serde_json::json!({
                    "token_type": "bearer",
                    "access_token": format!("access-{}", n),
                    "refresh_token": "refresh",
                    "expires_in": 3600,
                });
                return Ok(HttpResponse::new(200, serde_json::to_vec(&body).unwrap()));
            }
            let auth = request.header_value("authorization").map(str::to_string);
            self.seen.lock().unwrap().push(auth.clone());
            let token = auth.unwrap_or_default().replace("bearer ", "");
            if self.rejected.lock().unwrap().contains(&token) {
                Ok(HttpResponse::new(401, ""))
            } else {
                Ok(HttpResponse::new(200, "ok"))
            }
        }
    }

    fn setup(server: Arc<FakeServer>) -> (TransactionGateway, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let params = AuthorizationParameters::builder()
            .authorize_url("https://auth.example.com/authorize")
            .token_url(TOKEN_URL)
            .client_id("client")
            .redirect("127.0.0.1", 0, "/callback")
            .profile_path(dir.path().join("profile.json"))
            .build()
            .unwrap();
        let initial = Credential::new(
            "bearer",
            "access-0",
            "refresh",
            Utc::now() + ChronoDuration::hours(1),
        );
        let machine = CredentialStateMachine::new(
            params,
            server.clone(),
            MachineOptions::default(),
            Some(initial),
        )
        .unwrap();
        (TransactionGateway::new(Arc::new(machine), server), dir)
    }

    fn request() -> HttpRequest {
        HttpRequest::new(HttpMethod::Get, "https://api.example.com/me")
            .header("authorization", "Bearer caller-supplied")
    }

    #[tokio::test]
    async fn test_attaches_current_credential() {
        let server = Arc::new(FakeServer::default());
        let (gateway, _dir) = setup(server.clone());

        let response = gateway.perform(request()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(
            *server.seen.lock().unwrap(),
            vec![Some("bearer access-0".to_string())]
        );
        assert_eq!(server.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retries_once_after_refresh() {
        let server = Arc::new(FakeServer::default());
        server.rejected.lock().unwrap().push("access-0".to_string());
        let (gateway, _dir) = setup(server.clone());

        let response = gateway.perform(request()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(server.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            *server.seen.lock().unwrap(),
            vec![
                Some("bearer access-0".to_string()),
                Some("bearer access-1".to_string())
            ]
        );
        assert_eq!(gateway.machine().state(), CredentialState::Authorized);
    }

    #[tokio::test]
    async fn test_second_401_is_returned() {
        let server = Arc::new(FakeServer::default());
        server
            .rejected
            .lock()
            .unwrap()
            .extend(["access-0".to_string(), "access-1".to_string()]);
        let (gateway, _dir) = setup(server.clone());

        let response = gateway.perform(request()).await.unwrap();

        assert_eq!(response.status, 401);
        assert_eq!(server.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_returns_401() {
        let server = Arc::new(FakeServer::default());
        server.rejected.lock().unwrap().push("access-0".to_string());
        let (gateway, _dir) = setup(server.clone());

        let response = gateway.perform_with(request, 0).await.unwrap();

        assert_eq!(response.status, 401);
        assert_eq!(server.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fails_after_shutdown() {
        let server = Arc::new(FakeServer::default());
        let (gateway, _dir) = setup(server);
        gateway.machine().shutdown().await;

        let result = gateway.perform(request()).await;
        assert!(matches!(
            result,
            Err(AuthError::Terminated {
                state: CredentialState::Cleanup
            })
        ));
    }
}
