//! Shared fakes for the credential lifecycle tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::browser::UrlOpener;
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use core_auth::{AuthorizationParameters, Credential};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use url::Url;

pub const AUTHORIZE_URL: &str = "https://auth.test/authorize";
pub const TOKEN_URL: &str = "https://auth.test/token";
pub const RESOURCE_URL: &str = "https://api.test/drive/root";
pub const CODE: &str = "test-code";

pub fn params(profile: &Path) -> AuthorizationParameters {
    params_for_client(profile, "client-1")
}

pub fn params_for_client(profile: &Path, client_id: &str) -> AuthorizationParameters {
    AuthorizationParameters::builder()
        .authorize_url(AUTHORIZE_URL)
        .token_url(TOKEN_URL)
        .client_id(client_id)
        .client_secret("secret")
        .scope("files offline_access")
        .redirect("127.0.0.1", 0, "/callback")
        .profile_path(profile)
        .build()
        .unwrap()
}

/// Authorization server plus resource server behind one `HttpClient`.
///
/// Issues `access-1`, `access-2`, ... in order. The resource answers `401`
/// for every token in the rejected set.
pub struct FakeAuthServer {
    issued: AtomicUsize,
    pub code_exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    rejected: Mutex<HashSet<String>>,
    seen: Mutex<Vec<String>>,
    redirect_uris: Mutex<Vec<(String, String)>>,
    refresh_delay: Mutex<Duration>,
    refresh_fails: Mutex<bool>,
    expires_in: i64,
}

impl FakeAuthServer {
    pub fn new() -> Self {
        Self::with_expiry(3600)
    }

    pub fn with_expiry(expires_in: i64) -> Self {
        Self {
            issued: AtomicUsize::new(0),
            code_exchanges: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            rejected: Mutex::new(HashSet::new()),
            seen: Mutex::new(Vec::new()),
            redirect_uris: Mutex::new(Vec::new()),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_fails: Mutex::new(false),
            expires_in,
        }
    }

    pub fn reject(&self, access_token: &str) {
        self.rejected.lock().unwrap().insert(access_token.to_string());
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn fail_refreshes(&self) {
        *self.refresh_fails.lock().unwrap() = true;
    }

    /// `Authorization` headers seen by the resource server, in order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    /// `(grant_type, redirect_uri)` of every token request, in order.
    pub fn redirect_uris(&self) -> Vec<(String, String)> {
        self.redirect_uris.lock().unwrap().clone()
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn issue(&self) -> HttpResponse {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let body = serde_json::json!({
            "token_type": "bearer",
            "access_token": format!("access-{}", n),
            "refresh_token": format!("refresh-{}", n),
            "scope": "files offline_access",
            "expires_in": self.expires_in,
        });
        HttpResponse::new(200, serde_json::to_vec(&body).unwrap())
    }

    fn denied() -> HttpResponse {
        HttpResponse::new(400, r#"{"error":"invalid_grant"}"#)
    }

    async fn token_endpoint(&self, request: &HttpRequest) -> HttpResponse {
        let body = request.body.clone().unwrap_or_default();
        let form: HashMap<String, String> = serde_urlencoded::from_bytes(&body).unwrap();
        self.redirect_uris.lock().unwrap().push((
            form.get("grant_type").cloned().unwrap_or_default(),
            form.get("redirect_uri").cloned().unwrap_or_default(),
        ));

        match form.get("grant_type").map(String::as_str) {
            Some("authorization_code") => {
                self.code_exchanges.fetch_add(1, Ordering::SeqCst);
                if form.get("code").map(String::as_str) == Some(CODE) {
                    self.issue()
                } else {
                    Self::denied()
                }
            }
            Some("refresh_token") => {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                self.refreshes.fetch_add(1, Ordering::SeqCst);

                let delay = *self.refresh_delay.lock().unwrap();
                tokio::time::sleep(delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if *self.refresh_fails.lock().unwrap() {
                    Self::denied()
                } else {
                    self.issue()
                }
            }
            _ => Self::denied(),
        }
    }
}

#[async_trait]
impl HttpClient for FakeAuthServer {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        if request.url == TOKEN_URL {
            return Ok(self.token_endpoint(&request).await);
        }

        let header = request.header_value("authorization").unwrap_or("").to_string();
        self.seen.lock().unwrap().push(header.clone());
        let token = header.split_once(' ').map(|(_, t)| t).unwrap_or("");
        if self.rejected.lock().unwrap().contains(token) {
            Ok(HttpResponse::new(401, ""))
        } else {
            Ok(HttpResponse::new(200, "ok"))
        }
    }
}

/// What the browser launcher does once the redirect has been delivered.
#[derive(Clone, Copy)]
pub enum AfterRedirect {
    Return,
    /// Never returns, like a launcher waiting for the browser to exit.
    Hang,
    /// Reports an error although the redirect went through.
    Fail,
}

/// Stands in for the user's browser: follows the authorization URL straight
/// to the redirect URI with a fixed code.
pub struct RedirectingBrowser {
    code: String,
    hold: Option<std::sync::Arc<Notify>>,
    after: AfterRedirect,
    opened: Mutex<Vec<String>>,
}

impl RedirectingBrowser {
    pub fn new() -> Self {
        Self::with_code(CODE)
    }

    pub fn with_code(code: &str) -> Self {
        Self {
            code: code.to_string(),
            hold: None,
            after: AfterRedirect::Return,
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn then(after: AfterRedirect) -> Self {
        Self {
            after,
            ..Self::new()
        }
    }

    /// Waits for `hold` to be notified before following the redirect.
    pub fn held(hold: std::sync::Arc<Notify>) -> Self {
        Self {
            hold: Some(hold),
            ..Self::new()
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl UrlOpener for RedirectingBrowser {
    async fn open(&self, url: &str) -> BridgeResult<()> {
        self.opened.lock().unwrap().push(url.to_string());
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }

        let url = Url::parse(url).map_err(|e| BridgeError::OperationFailed(e.to_string()))?;
        let redirect = url
            .query_pairs()
            .find(|(key, _)| key == "redirect_uri")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| BridgeError::OperationFailed("no redirect_uri".to_string()))?;

        reqwest::get(format!("{}?code={}", redirect, self.code))
            .await
            .map_err(|e| BridgeError::OperationFailed(e.to_string()))?;

        match self.after {
            AfterRedirect::Return => Ok(()),
            AfterRedirect::Hang => std::future::pending().await,
            AfterRedirect::Fail => Err(BridgeError::OperationFailed(
                "launcher exited with status 1".to_string(),
            )),
        }
    }
}

/// A launcher that cannot start a browser at all.
pub struct BrokenBrowser;

#[async_trait]
impl UrlOpener for BrokenBrowser {
    async fn open(&self, _url: &str) -> BridgeResult<()> {
        Err(BridgeError::OperationFailed("no browser found".to_string()))
    }
}

/// A user who never completes the browser flow.
pub struct IdleBrowser;

#[async_trait]
impl UrlOpener for IdleBrowser {
    async fn open(&self, _url: &str) -> BridgeResult<()> {
        Ok(())
    }
}

pub fn credential(access: &str, expires_in: chrono::Duration) -> Credential {
    Credential::new(
        "bearer",
        access,
        format!("refresh-for-{}", access),
        chrono::Utc::now() + expires_in,
    )
}
