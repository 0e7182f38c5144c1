//! Authorization parameters and timeouts.

use crate::error::{AuthError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const ONEDRIVE_AUTHORIZE_URL: &str =
    "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
const ONEDRIVE_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
const ONEDRIVE_SCOPE: &str = "Files.ReadWrite offline_access";

/// Immutable OAuth2 configuration captured when a machine is constructed.
///
/// Every field except `client_secret` and `profile_path` is written to the
/// profile and must match exactly for a persisted credential to be trusted.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationParameters {
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Space separated scopes
    pub scope: String,
    pub redirect_host: String,
    /// `0` asks the OS for a free port; the redirect URI then follows the
    /// bound address.
    pub redirect_port: u16,
    pub redirect_path: String,
    pub profile_path: PathBuf,
}

impl AuthorizationParameters {
    pub fn builder() -> AuthorizationParametersBuilder {
        AuthorizationParametersBuilder::default()
    }

    /// Microsoft identity platform preset for OneDrive.
    pub fn onedrive(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        profile_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        Self::builder()
            .authorize_url(ONEDRIVE_AUTHORIZE_URL)
            .token_url(ONEDRIVE_TOKEN_URL)
            .client_id(client_id)
            .client_secret(client_secret)
            .scope(ONEDRIVE_SCOPE)
            .redirect("localhost", 8080, "/callback")
            .profile_path(profile_path)
            .build()
    }

    /// [`onedrive`](Self::onedrive) with credentials read from
    /// `ONEDRIVE_CLIENT_ID` and `ONEDRIVE_CLIENT_SECRET`.
    pub fn onedrive_from_env(profile_path: impl Into<PathBuf>) -> Result<Self> {
        let client_id = read_env("ONEDRIVE_CLIENT_ID")?;
        let client_secret = std::env::var("ONEDRIVE_CLIENT_SECRET").unwrap_or_default();
        Self::onedrive(client_id, client_secret, profile_path)
    }

    /// Redirect URI for the configured host, port and path.
    pub fn redirect_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.redirect_host, self.redirect_port, self.redirect_path
        )
    }

    pub fn profile_path(&self) -> &Path {
        &self.profile_path
    }

    /// Checks URLs, identifiers and redirect settings.
    pub fn validate(&self) -> Result<()> {
        validate_endpoint("authorize_url", &self.authorize_url)?;
        validate_endpoint("token_url", &self.token_url)?;

        if self.client_id.trim().is_empty() {
            return Err(AuthError::InvalidConfiguration(
                "client_id cannot be empty".to_string(),
            ));
        }
        if self.redirect_host.trim().is_empty() {
            return Err(AuthError::InvalidConfiguration(
                "redirect host cannot be empty".to_string(),
            ));
        }
        if !self.redirect_path.starts_with('/') {
            return Err(AuthError::InvalidConfiguration(format!(
                "redirect path must start with '/': {}",
                self.redirect_path
            )));
        }
        if self.profile_path.as_os_str().is_empty() {
            return Err(AuthError::InvalidConfiguration(
                "profile path cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AuthorizationParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationParameters")
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("scope", &self.scope)
            .field("redirect_url", &self.redirect_url())
            .field("profile_path", &self.profile_path)
            .finish()
    }
}

fn validate_endpoint(name: &str, value: &str) -> Result<()> {
    let url = Url::parse(value)
        .map_err(|e| AuthError::InvalidConfiguration(format!("{} is not a URL: {}", name, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(AuthError::InvalidConfiguration(format!(
            "{} must use http or https, got {}",
            name, other
        ))),
    }
}

fn read_env(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| AuthError::InvalidConfiguration(format!("{} is not set", name)))
}

/// Builder for [`AuthorizationParameters`].
#[derive(Debug, Default)]
pub struct AuthorizationParametersBuilder {
    authorize_url: Option<String>,
    token_url: Option<String>,
    client_id: Option<String>,
    client_secret: String,
    scope: String,
    redirect_host: Option<String>,
    redirect_port: u16,
    redirect_path: Option<String>,
    profile_path: Option<PathBuf>,
}

impl AuthorizationParametersBuilder {
    pub fn authorize_url(mut self, url: impl Into<String>) -> Self {
        self.authorize_url = Some(url.into());
        self
    }

    pub fn token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = Some(url.into());
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = secret.into();
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn redirect(mut self, host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        self.redirect_host = Some(host.into());
        self.redirect_port = port;
        self.redirect_path = Some(path.into());
        self
    }

    pub fn profile_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.profile_path = Some(path.into());
        self
    }

    /// Builds and validates the parameters.
    pub fn build(self) -> Result<AuthorizationParameters> {
        let params = AuthorizationParameters {
            authorize_url: required("authorize_url", self.authorize_url)?,
            token_url: required("token_url", self.token_url)?,
            client_id: required("client_id", self.client_id)?,
            client_secret: self.client_secret,
            scope: self.scope,
            redirect_host: self
                .redirect_host
                .unwrap_or_else(|| "localhost".to_string()),
            redirect_port: self.redirect_port,
            redirect_path: self.redirect_path.unwrap_or_else(|| "/".to_string()),
            profile_path: required("profile_path", self.profile_path)?,
        };
        params.validate()?;
        Ok(params)
    }
}

fn required<T>(name: &str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| AuthError::InvalidConfiguration(format!("{} is required", name)))
}

/// Deadlines for the interactive and network parts of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthTimeouts {
    /// How long `authorize` waits for the browser redirect.
    pub authorization_code: Duration,
    /// Per token-endpoint call.
    pub exchange: Duration,
}

impl Default for AuthTimeouts {
    fn default() -> Self {
        Self {
            authorization_code: Duration::from_secs(300),
            exchange: Duration::from_secs(30),
        }
    }
}
