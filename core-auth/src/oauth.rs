//! Token endpoint client.
//!
//! Builds the browser authorization URL and performs the two form-encoded
//! token exchanges (`authorization_code` and `refresh_token`). Every call
//! carries the exchange deadline both as a request timeout and as an outer
//! bound, so a misbehaving transport cannot stall the caller.

use crate::error::{AuthError, Result};
use crate::params::AuthorizationParameters;
use crate::types::Credential;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest};
use bridge_traits::time::Clock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Upper bound accepted for `expires_in`, ten years.
const MAX_EXPIRES_IN: i64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

enum Grant<'a> {
    AuthorizationCode { code: &'a str, redirect_uri: &'a str },
    RefreshToken { previous: &'a Credential, redirect_uri: &'a str },
}

impl Grant<'_> {
    fn name(&self) -> &'static str {
        match self {
            Grant::AuthorizationCode { .. } => "authorization_code",
            Grant::RefreshToken { .. } => "refresh_token",
        }
    }
}

/// Client for one authorization server.
pub struct OAuthClient {
    params: Arc<AuthorizationParameters>,
    http_client: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    exchange_timeout: Duration,
}

impl OAuthClient {
    pub fn new(
        params: Arc<AuthorizationParameters>,
        http_client: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        exchange_timeout: Duration,
    ) -> Self {
        Self {
            params,
            http_client,
            clock,
            exchange_timeout,
        }
    }

    /// `GET {authorize_url}?client_id&scope&redirect_uri&response_type=code`
    pub fn authorize_url(&self, redirect_uri: &str) -> Result<String> {
        let mut url = Url::parse(&self.params.authorize_url).map_err(|e| {
            AuthError::InvalidConfiguration(format!("Invalid authorize_url: {}", e))
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.params.client_id)
            .append_pair("scope", &self.params.scope)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code");
        Ok(url.to_string())
    }

    /// Exchanges an authorization code for a credential.
    ///
    /// The response must carry a refresh token.
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Credential> {
        self.request_token(Grant::AuthorizationCode { code, redirect_uri })
            .await
    }

    /// Exchanges `previous.refresh_token` for a new credential.
    ///
    /// `redirect_uri` must be the one the authorization code was granted
    /// with. When the server does not rotate the refresh token the previous
    /// one is kept.
    pub async fn refresh(&self, previous: &Credential, redirect_uri: &str) -> Result<Credential> {
        self.request_token(Grant::RefreshToken {
            previous,
            redirect_uri,
        })
        .await
    }

    async fn request_token(&self, grant: Grant<'_>) -> Result<Credential> {
        let (redirect_uri, secret_field, secret_value) = match &grant {
            Grant::AuthorizationCode { code, redirect_uri } => (*redirect_uri, "code", *code),
            Grant::RefreshToken {
                previous,
                redirect_uri,
            } => (*redirect_uri, "refresh_token", previous.refresh_token.as_str()),
        };

        let form = [
            ("client_id", self.params.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("client_secret", self.params.client_secret.as_str()),
            (secret_field, secret_value),
            ("grant_type", grant.name()),
        ];
        let body = serde_urlencoded::to_string(form).map_err(|e| {
            AuthError::InvalidConfiguration(format!("Failed to encode token request: {}", e))
        })?;

        let request = HttpRequest::new(HttpMethod::Post, self.params.token_url.clone())
            .header("Accept", "application/json")
            .form(body)
            .timeout(self.exchange_timeout);

        debug!(grant_type = grant.name(), "Requesting token");

        let response = tokio::time::timeout(self.exchange_timeout, self.http_client.execute(request))
            .await
            .map_err(|_| AuthError::Timeout {
                operation: "token exchange",
            })??;
        let received_at = self.clock.now();

        if response.status != 200 {
            let reason = response
                .json::<TokenErrorResponse>()
                .map(|e| match e.error_description {
                    Some(description) => format!("{}: {}", e.error, description),
                    None => e.error,
                })
                .unwrap_or_else(|_| "no error detail".to_string());
            warn!(
                status = response.status,
                grant_type = grant.name(),
                %reason,
                "Token endpoint rejected request"
            );
            return Err(AuthError::AuthorizationDenied(format!(
                "token endpoint returned {}: {}",
                response.status, reason
            )));
        }

        let token: TokenResponse = response.json().map_err(|e| {
            AuthError::AuthorizationDenied(format!("Malformed token response: {}", e))
        })?;

        let token_type = non_empty("token_type", token.token_type)?;
        let access_token = non_empty("access_token", token.access_token)?;
        let expires_in = token
            .expires_in
            .filter(|secs| (1..=MAX_EXPIRES_IN).contains(secs))
            .ok_or_else(|| {
                AuthError::AuthorizationDenied(
                    "token response has missing or invalid expires_in".to_string(),
                )
            })?;
        let refresh_token = match (&grant, token.refresh_token.filter(|t| !t.is_empty())) {
            (_, Some(rotated)) => rotated,
            (Grant::RefreshToken { previous, .. }, None) => previous.refresh_token.clone(),
            (Grant::AuthorizationCode { .. }, None) => {
                return Err(AuthError::AuthorizationDenied(
                    "token response missing refresh_token".to_string(),
                ))
            }
        };

        if let Some(granted) = token.scope.as_deref() {
            if granted != self.params.scope {
                debug!(granted, requested = %self.params.scope, "Server granted different scope");
            }
        }

        info!(
            grant_type = grant.name(),
            expires_in, "Token obtained"
        );

        Ok(Credential::expiring_in(
            token_type,
            access_token,
            refresh_token,
            received_at,
            expires_in,
        ))
    }
}

fn non_empty(field: &str, value: Option<String>) -> Result<String> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| {
        AuthError::AuthorizationDenied(format!("token response missing {}", field))
    })
}
