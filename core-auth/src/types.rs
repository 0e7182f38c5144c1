use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A bearer credential issued by the authorization server.
///
/// Credentials are replaced wholesale on every authorize or refresh, never
/// mutated in place. The `Debug` output redacts both tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry, whole seconds precision.
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        token_type: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token_type: token_type.into(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// Expiry computed as `received_at + expires_in`, truncated to seconds so
    /// that the persisted form round-trips exactly.
    pub fn expiring_in(
        token_type: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        received_at: DateTime<Utc>,
        expires_in: i64,
    ) -> Self {
        let expires_at = DateTime::<Utc>::from_timestamp(received_at.timestamp(), 0)
            .unwrap_or(received_at)
            + Duration::seconds(expires_in);
        Self::new(token_type, access_token, refresh_token, expires_at)
    }

    /// No grace skew: a credential is expired the instant `now` reaches `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Value for the `Authorization` header: `<token_type> <access_token>`.
    pub fn authorization_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token_type", &self.token_type)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Lifecycle state of a [`CredentialStateMachine`](crate::CredentialStateMachine).
///
/// ```text
/// UNAUTHORIZED -> AUTHORIZING -> AUTHORIZED <-> REFRESHING
///                                AUTHORIZED  -> INSTANT_REFRESH -> REFRESHING
/// any non-terminal -> FAILED | CLEANUP
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialState {
    Unauthorized,
    Authorizing,
    Authorized,
    /// A caller reported a rejected credential; a refresh is queued.
    InstantRefresh,
    Refreshing,
    Failed,
    Cleanup,
}

impl CredentialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialState::Unauthorized => "UNAUTHORIZED",
            CredentialState::Authorizing => "AUTHORIZING",
            CredentialState::Authorized => "AUTHORIZED",
            CredentialState::InstantRefresh => "INSTANT_REFRESH",
            CredentialState::Refreshing => "REFRESHING",
            CredentialState::Failed => "FAILED",
            CredentialState::Cleanup => "CLEANUP",
        }
    }

    /// `FAILED` or `CLEANUP`: waiters get an error instead of a credential.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CredentialState::Failed | CredentialState::Cleanup)
    }

    /// A refresh is queued or running.
    pub fn is_refreshing(&self) -> bool {
        matches!(
            self,
            CredentialState::InstantRefresh | CredentialState::Refreshing
        )
    }
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
