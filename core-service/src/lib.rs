//! Core service façade and bootstrap helpers.
//!
//! This crate wires a [`CoreConfig`] (host-provided or desktop-default HTTP
//! client and browser launcher) into a storage [`Backend`]. For OneDrive that
//! means a [`CredentialStateMachine`] loaded from the backend's profile and a
//! [`TransactionGateway`] attaching its credential to every request.
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use core_service::{BackendKind, CoreService};
//!
//! let config = CoreConfig::builder().data_dir("/home/me/.cloudlink").build()?;
//! let kind = BackendKind::onedrive(client_id, client_secret, config.profile_path("onedrive"))?;
//! let core = CoreService::bootstrap(config, kind).await?;
//! core.authorize().await?;
//! let response = core.execute(HttpRequest::new(HttpMethod::Get, "/me/drive")).await?;
//! core.shutdown().await;
//! ```

pub mod backend;
pub mod error;

pub use backend::{
    Backend, BackendKind, IpfsBackend, OneDriveBackend, DEFAULT_IPFS_API, GRAPH_API_BASE,
};
pub use error::{CoreError, Result};

use bridge_traits::http::{HttpRequest, HttpResponse};
use core_auth::{
    CredentialState, CredentialStateMachine, MachineOptions, TransactionGateway,
};
use core_runtime::config::CoreConfig;
use core_runtime::events::{EventBus, EventStream};
use core_runtime::logging::init_logging;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Primary façade exposed to host applications.
pub struct CoreService {
    config: CoreConfig,
    backend: Backend,
    events: EventBus,
}

impl CoreService {
    /// Validates `config`, initialises logging (once per process) and builds
    /// the backend named by `kind`.
    #[instrument(skip(config, kind), fields(backend = kind.id()))]
    pub async fn bootstrap(config: CoreConfig, kind: BackendKind) -> Result<Self> {
        config.validate()?;
        if let Err(e) = init_logging(config.logging.clone()) {
            debug!(error = %e, "Logging already initialised by the host");
        }

        let events = EventBus::default();
        let backend = match kind {
            BackendKind::OneDrive { params, api_base } => {
                let options = MachineOptions::default().with_events(events.clone());
                let machine = Arc::new(
                    CredentialStateMachine::load(params, Arc::clone(&config.http_client), options)
                        .await?,
                );
                let gateway = TransactionGateway::new(machine, Arc::clone(&config.http_client))
                    .with_request_timeout(config.request_timeout);
                Backend::OneDrive(OneDriveBackend::new(gateway, api_base))
            }
            BackendKind::Ipfs { api_url } => Backend::Ipfs(IpfsBackend::new(
                Arc::clone(&config.http_client),
                api_url,
                config.request_timeout,
            )),
            BackendKind::OwnCloud => return Err(CoreError::UnsupportedBackend("owncloud")),
        };

        info!(backend = backend.id(), "Core service ready");
        Ok(Self {
            config,
            backend,
            events,
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Auth events published by the backend's credential lifecycle.
    pub fn subscribe_events(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }

    /// `None` for backends without authentication.
    pub fn auth_state(&self) -> Option<CredentialState> {
        self.backend.machine().map(|machine| machine.state())
    }

    /// Runs the interactive sign-in through the configured browser launcher.
    /// A no-op for backends without authentication.
    pub async fn authorize(&self) -> Result<()> {
        if let Some(machine) = self.backend.machine() {
            machine.authorize(self.config.url_opener.as_ref()).await?;
        }
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        if let Some(machine) = self.backend.machine() {
            machine.logout().await?;
        }
        Ok(())
    }

    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.backend.execute(request).await
    }

    /// Stops the credential lifecycle. Requests fail afterwards.
    pub async fn shutdown(&self) {
        if let Some(machine) = self.backend.machine() {
            machine.shutdown().await;
        }
        info!("Core service stopped");
    }
}
