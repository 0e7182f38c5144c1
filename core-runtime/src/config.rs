//! # Core Configuration Module
//!
//! Builder-based configuration for the cloudlink core.
//!
//! `CoreConfig` carries the host capabilities the credential manager needs
//! (an [`HttpClient`] and a [`UrlOpener`]) together with the data directory
//! that holds one JSON profile per storage backend. The builder fails fast
//! with an actionable [`Error::CapabilityMissing`] when a capability is
//! neither supplied nor available as a platform default.
//!
//! When the `desktop-shims` feature is enabled, `ReqwestHttpClient` and
//! `SystemBrowser` are injected automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder()
//!     .data_dir("/home/me/.config/cloudlink")
//!     .build()?;
//!
//! let profile = config.profile_path("onedrive");
//! ```
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .data_dir("/tmp/cloudlink")
//!     .http_client(Arc::new(MyHttpClient))
//!     .url_opener(Arc::new(MyUrlOpener))
//!     .request_timeout(Duration::from_secs(10))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use bridge_traits::{HttpClient, UrlOpener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Per-request deadline used when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Core configuration.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Directory holding the persisted credential profiles
    pub data_dir: PathBuf,

    /// Transport for token-endpoint calls and backend transactions
    pub http_client: Arc<dyn HttpClient>,

    /// Strategy used to present the authorization URL to the user
    pub url_opener: Arc<dyn UrlOpener>,

    pub logging: LoggingConfig,

    /// Deadline applied to every outgoing HTTP request
    pub request_timeout: Duration,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("data_dir", &self.data_dir)
            .field("http_client", &"HttpClient { ... }")
            .field("url_opener", &"UrlOpener { ... }")
            .field("logging", &self.logging)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Location of the profile for `backend_id`: `<data_dir>/<backend_id>.json`.
    pub fn profile_path(&self, backend_id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", backend_id))
    }

    /// Validates the configuration.
    ///
    /// Checks that the data directory is set and the request timeout is
    /// non-zero and at most ten minutes.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("Data directory cannot be empty".to_string()));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::Config(
                "Request timeout must be greater than zero".to_string(),
            ));
        }

        if self.request_timeout > Duration::from_secs(600) {
            return Err(Error::Config(
                "Request timeout exceeds maximum of 600 seconds".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient",
        message: "HttpClient implementation is required for token exchange and backend requests. \
                 Desktop: enable the 'desktop-shims' feature to use the default ReqwestHttpClient. \
                 Other hosts: inject a platform-native HTTP client."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn url_opener_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "UrlOpener",
        message: "UrlOpener implementation is required for interactive authorization. \
                 Desktop: enable the 'desktop-shims' feature to use the default SystemBrowser. \
                 Headless hosts: inject an opener that prints or forwards the URL."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client(timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::with_timeout(timeout).map_err(|source| {
        Error::DefaultCapability {
            capability: "HttpClient",
            source,
        }
    })?;
    let client: Arc<dyn HttpClient> = Arc::new(client);
    Ok(client)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client(_timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_url_opener() -> Result<Arc<dyn UrlOpener>> {
    use bridge_desktop::SystemBrowser;

    let opener: Arc<dyn UrlOpener> = Arc::new(SystemBrowser::new().with_echo(true));
    Ok(opener)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_url_opener() -> Result<Arc<dyn UrlOpener>> {
    Err(url_opener_missing_error())
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    data_dir: Option<PathBuf>,
    http_client: Option<Arc<dyn HttpClient>>,
    url_opener: Option<Arc<dyn UrlOpener>>,
    logging: Option<LoggingConfig>,
    request_timeout: Option<Duration>,
}

impl CoreConfigBuilder {
    /// Sets the directory holding credential profiles (required).
    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn url_opener(mut self, opener: Arc<dyn UrlOpener>) -> Self {
        self.url_opener = Some(opener);
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Deadline for each outgoing request. Defaults to 30 seconds.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] when the data directory is missing or a value is
    ///   out of range
    /// - [`Error::CapabilityMissing`] when a capability was not injected and
    ///   no platform default is compiled in
    pub fn build(self) -> Result<CoreConfig> {
        let data_dir = self.data_dir.ok_or_else(|| {
            Error::Config("Data directory is required. Use .data_dir() to set it.".to_string())
        })?;

        let request_timeout = self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client(request_timeout)?,
        };

        let url_opener = match self.url_opener {
            Some(opener) => opener,
            None => provide_default_url_opener()?,
        };

        let config = CoreConfig {
            data_dir,
            http_client,
            url_opener,
            logging: self.logging.unwrap_or_default(),
            request_timeout,
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::{HttpRequest, HttpResponse};

    struct MockHttpClient;

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
            Ok(HttpResponse::new(200, ""))
        }
    }

    struct MockUrlOpener;

    #[async_trait]
    impl UrlOpener for MockUrlOpener {
        async fn open(&self, _url: &str) -> BridgeResult<()> {
            Ok(())
        }
    }

    fn full_builder() -> CoreConfigBuilder {
        CoreConfig::builder()
            .http_client(Arc::new(MockHttpClient))
            .url_opener(Arc::new(MockUrlOpener))
    }

    #[test]
    fn test_builder_requires_data_dir() {
        let result = full_builder().build();

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Data directory is required"));
    }

    #[test]
    fn test_builder_with_all_required_fields() {
        let config = full_builder().data_dir("/data/cloudlink").build().unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/data/cloudlink"));
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_profile_path() {
        let config = full_builder().data_dir("/data/cloudlink").build().unwrap();

        assert_eq!(
            config.profile_path("onedrive"),
            PathBuf::from("/data/cloudlink/onedrive.json")
        );
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let result = full_builder()
            .data_dir("/data")
            .request_timeout(Duration::ZERO)
            .build();

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_excessive_timeout() {
        let result = full_builder()
            .data_dir("/data")
            .request_timeout(Duration::from_secs(3600))
            .build();

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_debug_hides_capabilities() {
        let config = full_builder().data_dir("/data").build().unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("HttpClient { ... }"));
        assert!(debug.contains("/data"));
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_builder_requires_http_client() {
        let result = CoreConfig::builder()
            .data_dir("/data")
            .url_opener(Arc::new(MockUrlOpener))
            .build();

        match result {
            Err(Error::CapabilityMissing { capability, .. }) => {
                assert_eq!(capability, "HttpClient")
            }
            other => panic!("expected CapabilityMissing, got {:?}", other),
        }
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_builder_requires_url_opener() {
        let result = CoreConfig::builder()
            .data_dir("/data")
            .http_client(Arc::new(MockHttpClient))
            .build();

        let err = result.unwrap_err().to_string();
        assert!(err.contains("UrlOpener"));
        assert!(err.contains("interactive authorization"));
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_build_with_desktop_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::builder().data_dir(dir.path()).build().unwrap();

        assert_eq!(config.data_dir, dir.path());
    }
}
