//! Storage backends.
//!
//! Each backend passes authenticated requests through to its remote API.
//! Relative request URLs (starting with `/`) are resolved against the
//! backend's API base; absolute URLs are sent unchanged.

use crate::error::{CoreError, Result};
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use core_auth::{AuthorizationParameters, CredentialStateMachine, TransactionGateway};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Microsoft Graph API base URL
pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Default IPFS node HTTP API
pub const DEFAULT_IPFS_API: &str = "http://127.0.0.1:5001/api/v0";

/// Which backend [`CoreService::bootstrap`](crate::CoreService::bootstrap)
/// should wire up.
#[derive(Debug, Clone)]
pub enum BackendKind {
    /// Graph API behind the OAuth2 credential lifecycle.
    OneDrive {
        params: AuthorizationParameters,
        api_base: String,
    },
    /// Local IPFS node; no authentication.
    Ipfs { api_url: String },
    /// Known but not implemented.
    OwnCloud,
}

impl BackendKind {
    /// OneDrive with the Microsoft identity-platform preset. The profile is
    /// stored at `profile_path`.
    pub fn onedrive(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        profile_path: impl Into<std::path::PathBuf>,
    ) -> Result<Self> {
        Ok(BackendKind::OneDrive {
            params: AuthorizationParameters::onedrive(client_id, client_secret, profile_path)?,
            api_base: GRAPH_API_BASE.to_string(),
        })
    }

    pub fn ipfs(api_url: impl Into<String>) -> Self {
        BackendKind::Ipfs {
            api_url: api_url.into(),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            BackendKind::OneDrive { .. } => "onedrive",
            BackendKind::Ipfs { .. } => "ipfs",
            BackendKind::OwnCloud => "owncloud",
        }
    }
}

/// OneDrive: every request goes through the [`TransactionGateway`].
pub struct OneDriveBackend {
    gateway: TransactionGateway,
    api_base: String,
}

impl OneDriveBackend {
    pub fn new(gateway: TransactionGateway, api_base: impl Into<String>) -> Self {
        Self {
            gateway,
            api_base: api_base.into(),
        }
    }

    pub fn machine(&self) -> &Arc<CredentialStateMachine> {
        self.gateway.machine()
    }
}

/// IPFS: requests are sent straight to the node API.
pub struct IpfsBackend {
    http_client: Arc<dyn HttpClient>,
    api_url: String,
    request_timeout: Duration,
}

impl IpfsBackend {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        api_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            api_url: api_url.into(),
            request_timeout,
        }
    }
}

/// A configured storage backend.
pub enum Backend {
    OneDrive(OneDriveBackend),
    Ipfs(IpfsBackend),
    OwnCloud,
}

impl Backend {
    pub fn id(&self) -> &'static str {
        match self {
            Backend::OneDrive(_) => "onedrive",
            Backend::Ipfs(_) => "ipfs",
            Backend::OwnCloud => "owncloud",
        }
    }

    /// The credential lifecycle, for backends that authenticate.
    pub fn machine(&self) -> Option<&Arc<CredentialStateMachine>> {
        match self {
            Backend::OneDrive(backend) => Some(backend.machine()),
            _ => None,
        }
    }

    /// Sends `request` to the backend and returns its response.
    ///
    /// Non-2xx statuses are returned as responses, not errors. For OneDrive a
    /// `401` is retried once after refreshing the credential.
    #[instrument(skip(self, request), fields(backend = self.id()))]
    pub async fn execute(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        match self {
            Backend::OneDrive(backend) => {
                request.url = resolve_url(&backend.api_base, &request.url)?;
                Ok(backend.gateway.perform(request).await?)
            }
            Backend::Ipfs(backend) => {
                request.url = resolve_url(&backend.api_url, &request.url)?;
                if request.timeout.is_none() {
                    request.timeout = Some(backend.request_timeout);
                }
                debug!(method = request.method.as_str(), url = %request.url, "IPFS request");
                Ok(backend.http_client.execute(request).await?)
            }
            Backend::OwnCloud => Err(CoreError::UnsupportedBackend("owncloud")),
        }
    }
}

/// Joins a `/`-prefixed path onto `base`; anything else must already be an
/// absolute URL.
fn resolve_url(base: &str, target: &str) -> Result<String> {
    if target.starts_with('/') {
        return Ok(format!("{}{}", base.trim_end_matches('/'), target));
    }
    url::Url::parse(target)
        .map(|url| url.to_string())
        .map_err(|e| CoreError::InvalidRequest(format!("{}: {}", target, e)))
}
