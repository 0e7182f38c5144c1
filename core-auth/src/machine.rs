//! Credential lifecycle state machine.
//!
//! All mutable state (the [`CredentialState`] and the cached [`Credential`])
//! lives in one `tokio::sync::watch` channel. Transitions are made with
//! `send_if_modified`, which holds the channel's write lock for the whole
//! read-modify-write, so they are totally ordered; every transition wakes
//! every waiter.
//!
//! A single background task owns refreshing. It sleeps until the credential's
//! expiry or until a caller marks the credential stale, moves the machine to
//! `REFRESHING`, performs the exchange without holding any lock, and installs
//! the result only if the machine is still `REFRESHING`. Because only that
//! task ever enters `REFRESHING`, at most one refresh is in flight.

use crate::codec::{ProfileStore, TokenCodec};
use crate::error::{AuthError, Result};
use crate::listener::AuthCodeListener;
use crate::oauth::OAuthClient;
use crate::params::{AuthTimeouts, AuthorizationParameters};
use crate::types::{Credential, CredentialState};
use bridge_traits::browser::UrlOpener;
use bridge_traits::http::HttpClient;
use bridge_traits::time::{Clock, SystemClock};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Snapshot {
    state: CredentialState,
    credential: Option<Credential>,
}

/// Collaborators and tunables for a [`CredentialStateMachine`].
#[derive(Clone)]
pub struct MachineOptions {
    pub timeouts: AuthTimeouts,
    pub clock: Arc<dyn Clock>,
    /// Receives `CoreEvent::Auth` notifications when set.
    pub events: Option<EventBus>,
}

impl MachineOptions {
    pub fn with_timeouts(mut self, timeouts: AuthTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            timeouts: AuthTimeouts::default(),
            clock: Arc::new(SystemClock),
            events: None,
        }
    }
}

impl fmt::Debug for MachineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineOptions")
            .field("timeouts", &self.timeouts)
            .field("events", &self.events)
            .finish()
    }
}

struct RefreshJob {
    previous: Credential,
    reactive: bool,
}

struct Shared {
    params: Arc<AuthorizationParameters>,
    timeouts: AuthTimeouts,
    oauth: OAuthClient,
    store: ProfileStore,
    persist_lock: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
    events: Option<EventBus>,
    status: watch::Sender<Snapshot>,
    shutdown: CancellationToken,
    authorize_cancel: Mutex<Option<CancellationToken>>,
    /// Redirect URI the current refresh token was granted for.
    redirect_uri: Mutex<String>,
}

impl Shared {
    /// Applies `op` atomically. The channel is only marked changed (and
    /// waiters woken) when the snapshot actually differs.
    fn transition<T>(&self, op: impl FnOnce(&mut Snapshot) -> Result<T>) -> Result<T> {
        let mut outcome = Err(AuthError::Terminated {
            state: CredentialState::Cleanup,
        });
        let mut moved = None;
        self.status.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            outcome = op(snapshot);
            if before.state != snapshot.state {
                moved = Some((before.state, snapshot.state));
            }
            *snapshot != before
        });
        if let Some((from, to)) = moved {
            debug!(from = %from, to = %to, "Credential state transition");
            self.emit(AuthEvent::StateChanged {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        outcome
    }

    fn snapshot(&self) -> Snapshot {
        self.status.borrow().clone()
    }

    fn emit(&self, event: AuthEvent) {
        if let Some(bus) = &self.events {
            let _ = bus.emit(CoreEvent::Auth(event));
        }
    }

    fn set_authorize_cancel(&self, token: Option<CancellationToken>) {
        if let Ok(mut slot) = self.authorize_cancel.lock() {
            *slot = token;
        }
    }

    /// Moves `AUTHORIZED` to `INSTANT_REFRESH` when `rejected` is still the
    /// cached credential. Newer credentials and pending refreshes make this a
    /// no-op.
    fn mark_stale(&self, rejected: &Credential) -> Result<()> {
        self.transition(|snapshot| match snapshot.state {
            CredentialState::Authorized => {
                let current = snapshot
                    .credential
                    .as_ref()
                    .map(|c| c.access_token.as_str());
                if current == Some(rejected.access_token.as_str()) {
                    snapshot.state = CredentialState::InstantRefresh;
                }
                Ok(())
            }
            state if state.is_refreshing() => Ok(()),
            CredentialState::Authorizing => Ok(()),
            CredentialState::Unauthorized => Err(AuthError::WrongState {
                operation: "report unauthorized",
                state: snapshot.state,
            }),
            state => Err(AuthError::Terminated { state }),
        })
    }

    /// Claims the refresh. `expected` is the access token the expiry timer
    /// was armed for; `None` means a caller-triggered refresh.
    fn begin_refresh(&self, expected: Option<&str>) -> Option<RefreshJob> {
        let claimed = self.transition(|snapshot| {
            let reactive = match snapshot.state {
                CredentialState::InstantRefresh => true,
                CredentialState::Authorized
                    if expected.is_some()
                        && snapshot.credential.as_ref().map(|c| c.access_token.as_str())
                            == expected =>
                {
                    false
                }
                _ => return Ok(None),
            };
            match snapshot.credential.clone() {
                Some(previous) => {
                    snapshot.state = CredentialState::Refreshing;
                    Ok(Some(RefreshJob { previous, reactive }))
                }
                None => {
                    snapshot.state = CredentialState::Failed;
                    Ok(None)
                }
            }
        });
        claimed.ok().flatten()
    }

    async fn refresh(&self, job: RefreshJob) {
        self.emit(AuthEvent::TokenRefreshing {
            reactive: job.reactive,
        });
        debug!(reactive = job.reactive, "Refreshing access token");

        let redirect_uri = self.redirect_uri();
        let result = tokio::select! {
            result = self.oauth.refresh(&job.previous, &redirect_uri) => result,
            _ = self.shutdown.cancelled() => return,
        };

        match result {
            Ok(credential) => {
                let expires_at = credential.expires_at.timestamp();
                let installed = self.transition(|snapshot| {
                    if snapshot.state != CredentialState::Refreshing {
                        return Ok(false);
                    }
                    snapshot.state = CredentialState::Authorized;
                    snapshot.credential = Some(credential);
                    Ok(true)
                });
                if matches!(installed, Ok(true)) {
                    info!(expires_at, "Access token refreshed");
                    self.persist_logged().await;
                    self.emit(AuthEvent::TokenRefreshed { expires_at });
                } else {
                    debug!("State changed during refresh, discarding result");
                }
            }
            Err(err) => {
                error!(error = %err, "Token refresh failed");
                let _ = self.transition(|snapshot| {
                    if snapshot.state == CredentialState::Refreshing {
                        snapshot.state = CredentialState::Failed;
                    }
                    Ok(())
                });
                self.emit(AuthEvent::AuthError {
                    message: err.to_string(),
                    recoverable: err.is_recoverable(),
                });
            }
        }
    }

    fn redirect_uri(&self) -> String {
        match self.redirect_uri.lock() {
            Ok(uri) => uri.clone(),
            Err(_) => self.params.redirect_url(),
        }
    }

    /// Writes the current credential. Skipped once shutting down so that the
    /// released in-memory credential never clears the profile on disk.
    async fn persist_current(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        if snapshot.state == CredentialState::Cleanup {
            return Ok(());
        }
        let bytes = TokenCodec::encode(&self.params, snapshot.credential.as_ref())?;
        self.store.persist(&bytes).await
    }

    /// Persistence failures never roll back an acquired credential.
    async fn persist_logged(&self) {
        if let Err(err) = self.persist_current().await {
            warn!(error = %err, "Credential is usable but was not persisted");
            self.emit(AuthEvent::AuthError {
                message: err.to_string(),
                recoverable: true,
            });
        }
    }

    async fn run_authorization(
        &self,
        opener: &dyn UrlOpener,
        cancel: &CancellationToken,
    ) -> Result<Credential> {
        let params = &self.params;
        let mut listener = AuthCodeListener::bind(
            &params.redirect_host,
            params.redirect_port,
            &params.redirect_path,
        )
        .await?;
        let redirect_uri = listener.redirect_uri();
        let url = self.oauth.authorize_url(&redirect_uri)?;

        // The opener only matters until the redirect arrives; it is dropped
        // afterwards and shares the code deadline.
        let delivered = listener.delivered();
        let code = {
            let wait = listener.wait_for_code(self.timeouts.authorization_code, cancel);
            let open = opener.open(&url);
            tokio::pin!(wait, open);
            let mut opened = false;
            loop {
                tokio::select! {
                    biased;
                    code = &mut wait => break code?,
                    result = &mut open, if !opened => {
                        opened = true;
                        match result {
                            Err(e) if !delivered.load(Ordering::SeqCst) => {
                                return Err(AuthError::OpenUrlFailed(e.to_string()));
                            }
                            Err(e) => debug!(error = %e, "Browser launcher failed after the redirect"),
                            Ok(()) => {}
                        }
                    }
                }
            }
        };
        debug!("Authorization code received");

        let credential = tokio::select! {
            result = self.oauth.exchange_code(&code, &redirect_uri) => result,
            _ = cancel.cancelled() => Err(AuthError::Cancelled),
        }?;
        if let Ok(mut granted_for) = self.redirect_uri.lock() {
            *granted_for = redirect_uri;
        }
        Ok(credential)
    }

    async fn finish_authorization(&self, outcome: Result<Credential>) -> Result<Credential> {
        match outcome {
            Ok(credential) => {
                let installed = credential.clone();
                self.transition(move |snapshot| match snapshot.state {
                    CredentialState::Authorizing => {
                        snapshot.state = CredentialState::Authorized;
                        snapshot.credential = Some(installed);
                        Ok(())
                    }
                    state => Err(AuthError::Terminated { state }),
                })?;
                info!("Authorization complete");
                self.persist_logged().await;
                self.emit(AuthEvent::SignedIn {
                    expires_at: credential.expires_at.timestamp(),
                });
                Ok(credential)
            }
            Err(err) => {
                let shutting_down = self.shutdown.is_cancelled();
                let abandoned = matches!(err, AuthError::Cancelled) && !shutting_down;
                let _ = self.transition(|snapshot| {
                    if snapshot.state == CredentialState::Authorizing {
                        snapshot.state = if abandoned {
                            CredentialState::Unauthorized
                        } else {
                            CredentialState::Failed
                        };
                    }
                    Ok(())
                });

                if shutting_down {
                    return Err(AuthError::Terminated {
                        state: CredentialState::Cleanup,
                    });
                }
                if abandoned {
                    info!("Authorization cancelled");
                } else {
                    warn!(error = %err, "Authorization failed");
                    self.emit(AuthEvent::AuthError {
                        message: err.to_string(),
                        recoverable: err.is_recoverable(),
                    });
                }
                Err(err)
            }
        }
    }
}

/// Returns the machine to `UNAUTHORIZED` when an `authorize` future is
/// dropped before it finishes.
struct AbandonGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.shared.set_authorize_cancel(None);
        let _ = self.shared.transition(|snapshot| {
            if snapshot.state == CredentialState::Authorizing {
                snapshot.state = CredentialState::Unauthorized;
            }
            Ok(())
        });
    }
}

async fn refresh_loop(shared: Arc<Shared>) {
    let mut status = shared.status.subscribe();
    loop {
        let snapshot = status.borrow_and_update().clone();
        let job = match (snapshot.state, snapshot.credential) {
            (CredentialState::Cleanup, _) => break,
            (CredentialState::InstantRefresh, _) => shared.begin_refresh(None),
            (CredentialState::Authorized, Some(credential)) => {
                let delay = (credential.expires_at - shared.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        shared.begin_refresh(Some(credential.access_token.as_str()))
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        None
                    }
                    _ = shared.shutdown.cancelled() => break,
                }
            }
            _ => {
                tokio::select! {
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shared.shutdown.cancelled() => break,
                }
                None
            }
        };
        if let Some(job) = job {
            shared.refresh(job).await;
        }
    }
    debug!("Refresh loop stopped");
}

/// Observes state transitions of a [`CredentialStateMachine`].
pub struct StateWatcher {
    receiver: watch::Receiver<Snapshot>,
}

impl StateWatcher {
    pub fn current(&self) -> CredentialState {
        self.receiver.borrow().state
    }

    /// Waits for the next change and returns the state after it.
    pub async fn changed(&mut self) -> Result<CredentialState> {
        self.receiver.changed().await.map_err(|_| AuthError::Terminated {
            state: CredentialState::Cleanup,
        })?;
        Ok(self.receiver.borrow_and_update().state)
    }

    /// Waits until `predicate` holds for the current state.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(CredentialState) -> bool,
    ) -> Result<CredentialState> {
        self.receiver
            .wait_for(|snapshot| predicate(snapshot.state))
            .await
            .map(|snapshot| snapshot.state)
            .map_err(|_| AuthError::Terminated {
                state: CredentialState::Cleanup,
            })
    }
}

/// Acquires, caches, refreshes and persists one OAuth2 credential.
///
/// See the module docs for the concurrency model. Dropping the machine
/// without calling [`shutdown`](Self::shutdown) still stops the background
/// task, but does not wait for it.
pub struct CredentialStateMachine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CredentialStateMachine {
    /// Creates a machine, `AUTHORIZED` when `initial` is given, otherwise
    /// `UNAUTHORIZED`, and starts its refresh task.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        params: AuthorizationParameters,
        http_client: Arc<dyn HttpClient>,
        options: MachineOptions,
        initial: Option<Credential>,
    ) -> Result<Self> {
        params.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            AuthError::InvalidConfiguration(
                "credential manager must be created inside a Tokio runtime".to_string(),
            )
        })?;

        let params = Arc::new(params);
        let oauth = OAuthClient::new(
            Arc::clone(&params),
            http_client,
            Arc::clone(&options.clock),
            options.timeouts.exchange,
        );
        let state = if initial.is_some() {
            CredentialState::Authorized
        } else {
            CredentialState::Unauthorized
        };
        let (status, _) = watch::channel(Snapshot {
            state,
            credential: initial,
        });

        let redirect_uri = Mutex::new(params.redirect_url());
        let shared = Arc::new(Shared {
            store: ProfileStore::new(params.profile_path.clone()),
            params,
            timeouts: options.timeouts,
            oauth,
            persist_lock: tokio::sync::Mutex::new(()),
            clock: options.clock,
            events: options.events,
            status,
            shutdown: CancellationToken::new(),
            authorize_cancel: Mutex::new(None),
            redirect_uri,
        });
        let worker = runtime.spawn(refresh_loop(Arc::clone(&shared)));

        info!(state = %state, "Credential manager started");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Reads the profile at `params.profile_path` and creates the machine.
    ///
    /// A missing profile, or one written for different parameters, starts the
    /// machine `UNAUTHORIZED`. A corrupt profile fails construction.
    pub async fn load(
        params: AuthorizationParameters,
        http_client: Arc<dyn HttpClient>,
        options: MachineOptions,
    ) -> Result<Self> {
        params.validate()?;
        let store = ProfileStore::new(params.profile_path.clone());
        let initial = match store.load().await? {
            Some(bytes) => TokenCodec::decode(&bytes, &params)?,
            None => None,
        };
        Self::new(params, http_client, options, initial)
    }

    pub fn state(&self) -> CredentialState {
        self.shared.status.borrow().state
    }

    /// The cached credential, without waiting or checking expiry.
    pub fn credential(&self) -> Option<Credential> {
        self.shared.status.borrow().credential.clone()
    }

    pub fn watch_state(&self) -> StateWatcher {
        StateWatcher {
            receiver: self.shared.status.subscribe(),
        }
    }

    pub fn parameters(&self) -> &AuthorizationParameters {
        &self.shared.params
    }

    /// Runs the interactive authorization-code flow.
    ///
    /// Allowed only from `UNAUTHORIZED`. From `FAILED` or `CLEANUP` it returns
    /// `Terminated`, from any other state `WrongState`. Starts the redirect
    /// listener, hands the authorization URL to `opener`, waits for the code
    /// and exchanges it. The opener is not awaited once the code has arrived.
    /// Failures and timeouts leave the machine `FAILED`;
    /// [`cancel_authorization`](Self::cancel_authorization) returns it to
    /// `UNAUTHORIZED`.
    #[instrument(skip(self, opener))]
    pub async fn authorize(&self, opener: &dyn UrlOpener) -> Result<Credential> {
        let shared = self.shared.as_ref();
        let cancel = shared.shutdown.child_token();

        let registered = cancel.clone();
        shared.transition(move |snapshot| {
            if snapshot.state.is_terminal() {
                return Err(AuthError::Terminated {
                    state: snapshot.state,
                });
            }
            if snapshot.state != CredentialState::Unauthorized {
                return Err(AuthError::WrongState {
                    operation: "authorize",
                    state: snapshot.state,
                });
            }
            snapshot.state = CredentialState::Authorizing;
            shared.set_authorize_cancel(Some(registered));
            Ok(())
        })?;

        let mut guard = AbandonGuard {
            shared,
            armed: true,
        };
        shared.emit(AuthEvent::SigningIn {
            authority: Url::parse(&shared.params.authorize_url)
                .ok()
                .and_then(|url| url.host_str().map(str::to_string))
                .unwrap_or_default(),
        });

        let outcome = shared.run_authorization(opener, &cancel).await;

        guard.armed = false;
        shared.set_authorize_cancel(None);
        shared.finish_authorization(outcome).await
    }

    /// Aborts an in-flight [`authorize`](Self::authorize). Returns whether
    /// one was running.
    pub fn cancel_authorization(&self) -> bool {
        let token = self
            .shared
            .authorize_cancel
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Returns a credential that is valid now.
    ///
    /// Waits while a refresh or authorization is in progress. An expired
    /// credential is never returned; observing one queues a refresh and
    /// waits for it. Fails with `WrongState` from `UNAUTHORIZED` and with
    /// `Terminated` once `FAILED` or `CLEANUP`.
    pub async fn acquire_for_transaction(&self) -> Result<Credential> {
        let mut status = self.shared.status.subscribe();
        loop {
            let snapshot = status.borrow_and_update().clone();
            match (snapshot.state, snapshot.credential) {
                (CredentialState::Authorized, Some(credential)) => {
                    if !credential.is_expired_at(self.shared.clock.now()) {
                        return Ok(credential);
                    }
                    debug!("Cached credential expired, waiting for refresh");
                    self.shared.mark_stale(&credential)?;
                    continue;
                }
                (CredentialState::Unauthorized, _) => {
                    return Err(AuthError::WrongState {
                        operation: "acquire credential",
                        state: CredentialState::Unauthorized,
                    })
                }
                (state, _) if state.is_terminal() => {
                    return Err(AuthError::Terminated { state })
                }
                _ => {}
            }
            if status.changed().await.is_err() {
                return Err(AuthError::Terminated {
                    state: CredentialState::Cleanup,
                });
            }
        }
    }

    /// Reports that `rejected` was refused by a resource server.
    ///
    /// Queues a single refresh when `rejected` is still the cached
    /// credential; concurrent reports coalesce into it.
    pub fn report_unauthorized(&self, rejected: &Credential) -> Result<()> {
        debug!("Credential rejected by resource server");
        self.shared.mark_stale(rejected)
    }

    /// Clears the credential, persists the profile without it and returns to
    /// `UNAUTHORIZED`. This is also the way out of `FAILED`.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<()> {
        self.shared.transition(|snapshot| match snapshot.state {
            CredentialState::Authorizing => Err(AuthError::WrongState {
                operation: "logout",
                state: snapshot.state,
            }),
            CredentialState::Cleanup => Err(AuthError::Terminated {
                state: snapshot.state,
            }),
            _ => {
                snapshot.state = CredentialState::Unauthorized;
                snapshot.credential = None;
                Ok(())
            }
        })?;
        info!("Signed out");
        self.shared.emit(AuthEvent::SignedOut);
        self.shared.persist_current().await
    }

    /// Moves to `CLEANUP`, wakes every waiter with `Terminated`, aborts
    /// in-flight network calls, stops the refresh task and releases the
    /// cached credential. Idempotent.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _ = self.shared.transition(|snapshot| {
            snapshot.state = CredentialState::Cleanup;
            snapshot.credential = None;
            Ok(())
        });
        self.shared.shutdown.cancel();

        let worker = self.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Refresh task ended abnormally");
            }
            info!("Credential manager stopped");
        }
    }
}

impl Drop for CredentialStateMachine {
    fn drop(&mut self) {
        let _ = self.shared.transition(|snapshot| {
            snapshot.state = CredentialState::Cleanup;
            snapshot.credential = None;
            Ok(())
        });
        self.shared.shutdown.cancel();
    }
}

impl fmt::Debug for CredentialStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStateMachine")
            .field("state", &self.state())
            .field("profile_path", &self.shared.params.profile_path)
            .finish()
    }
}
