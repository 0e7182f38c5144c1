//! Local HTTP listener capturing the authorization code from the redirect.

use crate::error::{AuthError, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use core_runtime::logging::redact_if_sensitive;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type CodeResult = std::result::Result<String, String>;

const SUCCESS_PAGE: &str = "<html><body><h1>Authorization complete</h1>\
    <p>You can close this tab and return to the application.</p></body></html>";
const DENIED_PAGE: &str = "<html><body><h1>Authorization was not granted</h1>\
    <p>You can close this tab.</p></body></html>";

#[derive(Clone)]
struct CallbackState {
    sender: Arc<Mutex<Option<oneshot::Sender<CodeResult>>>>,
    delivered: Arc<AtomicBool>,
}

/// One-shot redirect endpoint.
///
/// Serves `GET {path}?code=...` on the bound address until a code arrives,
/// the listener is stopped, or it is dropped. Requests to any other path get
/// `404`; a request to the redirect path without `code` gets `400` and keeps
/// the listener waiting.
pub struct AuthCodeListener {
    local_addr: SocketAddr,
    host: String,
    path: String,
    receiver: Option<oneshot::Receiver<CodeResult>>,
    delivered: Arc<AtomicBool>,
    shutdown: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl AuthCodeListener {
    /// Binds `host:port` (port `0` picks a free one) and starts serving.
    pub async fn bind(host: &str, port: u16, path: &str) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| AuthError::Listener(format!("Failed to bind {}:{}: {}", host, port, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AuthError::Listener(e.to_string()))?;

        let (sender, receiver) = oneshot::channel();
        let delivered = Arc::new(AtomicBool::new(false));
        let state = CallbackState {
            sender: Arc::new(Mutex::new(Some(sender))),
            delivered: Arc::clone(&delivered),
        };
        let app = Router::new()
            .route(path, get(handle_redirect))
            .with_state(state);

        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(server_shutdown.cancelled_owned())
                .await;
            if let Err(e) = served {
                warn!(error = %e, "Redirect listener stopped with error");
            }
        });

        debug!(%local_addr, path, "Redirect listener started");

        Ok(Self {
            local_addr,
            host: host.to_string(),
            path: path.to_string(),
            receiver: Some(receiver),
            delivered,
            shutdown,
            server: Some(server),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Redirect URI to register with the authorization request, using the
    /// actually bound port.
    pub fn redirect_uri(&self) -> String {
        format!("http://{}:{}{}", self.host, self.local_addr.port(), self.path)
    }

    /// Flag raised as soon as the redirect (code or error) has been handed
    /// over, before [`wait_for_code`](Self::wait_for_code) returns.
    pub fn delivered(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.delivered)
    }

    /// Waits for the redirect, at most `timeout`, or until `cancel` fires.
    ///
    /// The listener stops serving once this returns.
    pub async fn wait_for_code(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| AuthError::Listener("authorization code already consumed".to_string()))?;

        let outcome = tokio::select! {
            received = receiver => match received {
                Ok(Ok(code)) => Ok(code),
                Ok(Err(reason)) => Err(AuthError::AuthorizationDenied(reason)),
                Err(_) => Err(AuthError::Listener("redirect listener stopped".to_string())),
            },
            _ = tokio::time::sleep(timeout) => Err(AuthError::Timeout {
                operation: "authorization code",
            }),
            _ = cancel.cancelled() => Err(AuthError::Cancelled),
        };

        self.stop().await;
        outcome
    }

    /// Stops serving and waits for the server task to finish.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            if let Err(e) = server.await {
                warn!(error = %e, "Redirect listener task failed");
            }
        }
    }
}

impl Drop for AuthCodeListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_redirect(
    State(state): State<CallbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<&'static str>) {
    debug!(query = %redacted_query(&params), "Redirect request");
    let result = if let Some(code) = params.get("code").filter(|c| !c.is_empty()) {
        Ok(code.clone())
    } else if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(|d| format!("{}: {}", error, d))
            .unwrap_or_else(|| error.clone());
        Err(description)
    } else {
        return (
            StatusCode::BAD_REQUEST,
            Html("<html><body>Missing authorization code.</body></html>"),
        );
    };

    let granted = result.is_ok();
    if let Some(sender) = state.sender.lock().await.take() {
        state.delivered.store(true, Ordering::SeqCst);
        let _ = sender.send(result);
        info!(granted, "Authorization redirect received");
    }

    if granted {
        (StatusCode::OK, Html(SUCCESS_PAGE))
    } else {
        (StatusCode::OK, Html(DENIED_PAGE))
    }
}

/// Query parameters in a stable order with secrets masked.
fn redacted_query(params: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = params
        .iter()
        .map(|(key, value)| format!("{}={}", key, redact_if_sensitive(key, value)))
        .collect();
    pairs.sort();
    pairs.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn listener() -> AuthCodeListener {
        AuthCodeListener::bind("127.0.0.1", 0, "/callback")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_captures_code() {
        let mut listener = listener().await;
        let delivered = listener.delivered();
        assert!(!delivered.load(Ordering::SeqCst));
        let uri = listener.redirect_uri();
        assert!(uri.starts_with("http://127.0.0.1:"));
        assert!(uri.ends_with("/callback"));

        let client = reqwest::Client::new();
        let request = tokio::spawn(async move {
            client
                .get(format!("{}?code=abc123", uri))
                .send()
                .await
                .unwrap()
                .status()
        });

        let code = listener
            .wait_for_code(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, "abc123");
        assert_eq!(request.await.unwrap(), reqwest::StatusCode::OK);
        assert!(delivered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_ignores_other_paths_and_missing_code() {
        let mut listener = listener().await;
        let base = format!("http://{}", listener.local_addr());
        let client = reqwest::Client::new();

        let other = client.get(format!("{}/favicon.ico", base)).send().await.unwrap();
        assert_eq!(other.status(), reqwest::StatusCode::NOT_FOUND);

        let missing = client.get(format!("{}/callback", base)).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::BAD_REQUEST);

        let uri = listener.redirect_uri();
        tokio::spawn(async move {
            let _ = reqwest::get(format!("{}?code=late", uri)).await;
        });
        let code = listener
            .wait_for_code(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, "late");
    }

    #[tokio::test]
    async fn test_error_redirect_is_denied() {
        let mut listener = listener().await;
        let uri = listener.redirect_uri();
        tokio::spawn(async move {
            let _ = reqwest::get(format!("{}?error=access_denied", uri)).await;
        });

        let result = listener
            .wait_for_code(Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AuthError::AuthorizationDenied(_))));
    }

    #[tokio::test]
    async fn test_times_out_without_redirect() {
        let mut listener = listener().await;
        let result = listener
            .wait_for_code(Duration::from_millis(50), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AuthError::Timeout { .. })));
    }

    #[test]
    fn test_redirect_query_is_redacted_for_logging() {
        let params: HashMap<String, String> = [
            ("state", "xyz"),
            ("code", "M.C507_secret"),
            ("session_state", "abc"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let logged = redacted_query(&params);
        assert_eq!(logged, "code=[REDACTED]&session_state=abc&state=xyz");
        assert!(!logged.contains("M.C507_secret"));
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let mut listener = listener().await;
        let addr = listener.local_addr();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = listener.wait_for_code(Duration::from_secs(5), &cancel).await;
        assert!(matches!(result, Err(AuthError::Cancelled)));

        // Stopped: the port no longer accepts the redirect.
        let after = reqwest::get(format!("http://{}/callback?code=x", addr)).await;
        assert!(after.is_err());
    }
}
