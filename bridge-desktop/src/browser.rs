//! System browser launcher

use async_trait::async_trait;
use bridge_traits::{
    browser::UrlOpener,
    error::{BridgeError, Result},
};
use tracing::{info, warn};

/// Opens authorization URLs in the user's default browser.
///
/// The launch runs on the blocking pool because some platforms wait for the
/// helper process (`xdg-open`, `open`, `start`) to exit.
#[derive(Debug, Clone, Default)]
pub struct SystemBrowser {
    /// Also print the URL to stderr, for terminals without a desktop session.
    echo_url: bool,
}

impl SystemBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_echo(mut self, echo_url: bool) -> Self {
        self.echo_url = echo_url;
        self
    }
}

#[async_trait]
impl UrlOpener for SystemBrowser {
    async fn open(&self, url: &str) -> Result<()> {
        if self.echo_url {
            eprintln!("Open the following URL to sign in:\n\n  {}\n", url);
        }

        let target = url.to_string();
        let launched = tokio::task::spawn_blocking(move || open::that(target))
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Browser task failed: {}", e)))?;

        match launched {
            Ok(()) => {
                info!("Opened authorization URL in system browser");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to launch system browser");
                Err(BridgeError::NotAvailable(format!(
                    "Unable to open system browser: {}",
                    e
                )))
            }
        }
    }
}
