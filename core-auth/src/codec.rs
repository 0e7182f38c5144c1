//! Profile encoding and atomic persistence.
//!
//! A profile is a JSON object holding the non-secret authorization parameters
//! plus an optional credential block:
//!
//! ```json
//! {
//!   "authorize_url": "https://login.example.com/authorize",
//!   "token_url": "https://login.example.com/token",
//!   "client_id": "app-id",
//!   "scope": "files offline_access",
//!   "redirect_url": "http://localhost:8080/callback",
//!   "token_type": "bearer",
//!   "access_token": "...",
//!   "refresh_token": "...",
//!   "expires_at": 1700003600
//! }
//! ```

use crate::error::{AuthError, Result};
use crate::params::AuthorizationParameters;
use crate::types::Credential;
use chrono::{DateTime, Utc};
use core_runtime::logging::strip_path;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
struct ProfileDocument {
    authorize_url: String,
    token_url: String,
    client_id: String,
    scope: String,
    redirect_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

impl ProfileDocument {
    fn mismatched_field(&self, params: &AuthorizationParameters) -> Option<&'static str> {
        let redirect_url = params.redirect_url();
        let mismatched = [
            ("authorize_url", self.authorize_url.as_str(), params.authorize_url.as_str()),
            ("token_url", self.token_url.as_str(), params.token_url.as_str()),
            ("client_id", self.client_id.as_str(), params.client_id.as_str()),
            ("scope", self.scope.as_str(), params.scope.as_str()),
            ("redirect_url", self.redirect_url.as_str(), redirect_url.as_str()),
        ]
        .into_iter()
        .find(|(_, stored, current)| stored != current)
        .map(|(field, _, _)| field);
        mismatched
    }
}

/// Converts between [`Credential`]s and profile JSON.
pub struct TokenCodec;

impl TokenCodec {
    /// Encodes `params` and, if present, `credential` into profile JSON.
    pub fn encode(
        params: &AuthorizationParameters,
        credential: Option<&Credential>,
    ) -> Result<Vec<u8>> {
        let document = ProfileDocument {
            authorize_url: params.authorize_url.clone(),
            token_url: params.token_url.clone(),
            client_id: params.client_id.clone(),
            scope: params.scope.clone(),
            redirect_url: params.redirect_url(),
            token_type: credential.map(|c| c.token_type.clone()),
            access_token: credential.map(|c| c.access_token.clone()),
            refresh_token: credential.map(|c| c.refresh_token.clone()),
            expires_at: credential.map(|c| c.expires_at.timestamp()),
        };
        serde_json::to_vec_pretty(&document)
            .map_err(|e| AuthError::PersistenceFailure(format!("Failed to encode profile: {}", e)))
    }

    /// Decodes a profile against the current parameters.
    ///
    /// Returns `Ok(None)` when the profile was written for different
    /// parameters or holds no credential. A credential block that is only
    /// partially present, or bytes that are not a profile, are
    /// [`AuthError::CorruptProfile`].
    pub fn decode(bytes: &[u8], params: &AuthorizationParameters) -> Result<Option<Credential>> {
        let document: ProfileDocument = serde_json::from_slice(bytes)
            .map_err(|e| AuthError::CorruptProfile(format!("Unreadable profile: {}", e)))?;

        if let Some(field) = document.mismatched_field(params) {
            warn!(field, "Profile does not match current parameters, ignoring it");
            return Ok(None);
        }

        let token_type = document.token_type.filter(|v| !v.is_empty());
        let access_token = document.access_token.filter(|v| !v.is_empty());
        let refresh_token = document.refresh_token.filter(|v| !v.is_empty());

        match (token_type, access_token, refresh_token, document.expires_at) {
            (None, None, None, None) => Ok(None),
            (Some(token_type), Some(access_token), Some(refresh_token), Some(expires_at)) => {
                let expires_at = DateTime::<Utc>::from_timestamp(expires_at, 0).ok_or_else(|| {
                    AuthError::CorruptProfile(format!("expires_at out of range: {}", expires_at))
                })?;
                Ok(Some(Credential::new(
                    token_type,
                    access_token,
                    refresh_token,
                    expires_at,
                )))
            }
            _ => Err(AuthError::CorruptProfile(
                "credential block is only partially present".to_string(),
            )),
        }
    }
}

/// Reads and atomically replaces one profile file.
///
/// A write goes `<profile>.new` -> rename `<profile>` to `<profile>.old` ->
/// rename `<profile>.new` to `<profile>` -> delete `<profile>.old`, so a crash
/// at any step leaves either the previous or the new profile readable.
#[derive(Debug)]
pub struct ProfileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the profile, falling back to `<profile>.old` when a previous
    /// write was interrupted after the old file was moved aside.
    pub async fn load(&self) -> Result<Option<Vec<u8>>> {
        match read_optional(&self.path).await? {
            Some(bytes) => Ok(Some(bytes)),
            None => {
                let old = sibling(&self.path, "old");
                let recovered = read_optional(&old).await?;
                if recovered.is_some() {
                    warn!(
                        profile = strip_path(&self.path.to_string_lossy()),
                        "Recovered profile from interrupted write"
                    );
                }
                Ok(recovered)
            }
        }
    }

    /// Atomically replaces the profile with `bytes`.
    pub async fn persist(&self, bytes: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let staged = sibling(&self.path, "new");
        let old = sibling(&self.path, "old");

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence("create profile directory", e))?;
        }

        let mut file = tokio::fs::File::create(&staged)
            .await
            .map_err(|e| persistence("create staged profile", e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| persistence("write staged profile", e))?;
        file.sync_all()
            .await
            .map_err(|e| persistence("sync staged profile", e))?;
        drop(file);

        match tokio::fs::rename(&self.path, &old).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(persistence("move previous profile aside", e)),
        }

        tokio::fs::rename(&staged, &self.path)
            .await
            .map_err(|e| persistence("install new profile", e))?;

        match tokio::fs::remove_file(&old).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to remove previous profile"),
        }

        debug!(
            profile = strip_path(&self.path.to_string_lossy()),
            "Profile persisted"
        );
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AuthError::PersistenceFailure(format!(
            "Failed to read profile: {}",
            e
        ))),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("profile"));
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn persistence(step: &str, err: std::io::Error) -> AuthError {
    AuthError::PersistenceFailure(format!("Failed to {}: {}", step, err))
}
