//! # Event Bus System
//!
//! Decoupled notifications for hosts that want to observe the credential
//! lifecycle (e.g. to show a "signed in" badge or prompt for re-authorization)
//! without polling. Built on `tokio::sync::broadcast`.
//!
//! ```text
//! ┌──────────────────────┐  emit   ┌───────────┐  subscribe  ┌────────────┐
//! │ CredentialStateMachine├───────>│ EventBus  ├────────────>│ Subscriber │
//! └──────────────────────┘         └───────────┘             └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut stream = bus.subscribe();
//!
//! bus.emit(CoreEvent::Auth(AuthEvent::SignedOut)).ok();
//! assert_eq!(stream.recv().await.unwrap(), CoreEvent::Auth(AuthEvent::SignedOut));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - `RecvError::Lagged(n)`: the subscriber missed `n` events and can keep
//!   receiving.
//! - `RecvError::Closed`: every sender is gone, treat as shutdown.
//!
//! Publishers never block. Emitting with no subscribers returns an error that
//! publishers are expected to ignore.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Top-level event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Credential lifecycle events
    Auth(AuthEvent),
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Auth(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Auth(AuthEvent::AuthError {
                recoverable: false, ..
            }) => EventSeverity::Error,
            CoreEvent::Auth(AuthEvent::AuthError { .. }) => EventSeverity::Warning,
            CoreEvent::Auth(AuthEvent::SignedIn { .. }) => EventSeverity::Info,
            CoreEvent::Auth(AuthEvent::SignedOut) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Credential lifecycle events.
///
/// States are carried as their display names (`"AUTHORIZED"`, `"REFRESHING"`,
/// ...) so this crate stays independent of the auth crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthEvent {
    /// Interactive authorization started; the URL was handed to the opener.
    SigningIn {
        /// Authorization endpoint host, for display.
        authority: String,
    },
    /// A credential was obtained through the interactive flow.
    SignedIn {
        /// Expiry of the new access token (Unix epoch seconds).
        expires_at: i64,
    },
    /// The credential was cleared.
    SignedOut,
    /// A refresh-token exchange is in flight.
    TokenRefreshing {
        /// `true` when triggered by a rejected transaction rather than the
        /// expiry timer.
        reactive: bool,
    },
    /// Refresh completed.
    TokenRefreshed {
        /// Expiry of the new access token (Unix epoch seconds).
        expires_at: i64,
    },
    /// Authorization or refresh failed.
    AuthError {
        message: String,
        /// Whether retrying (or re-authorizing) can succeed.
        recoverable: bool,
    },
    /// Any state transition.
    StateChanged { from: String, to: String },
}

impl AuthEvent {
    fn description(&self) -> &str {
        match self {
            AuthEvent::SigningIn { .. } => "Authorization in progress",
            AuthEvent::SignedIn { .. } => "Signed in successfully",
            AuthEvent::SignedOut => "Signed out",
            AuthEvent::TokenRefreshing { .. } => "Refreshing access token",
            AuthEvent::TokenRefreshed { .. } => "Access token refreshed",
            AuthEvent::AuthError { .. } => "Authentication error",
            AuthEvent::StateChanged { .. } => "Credential state changed",
        }
    }
}

/// Broadcast channel for [`CoreEvent`]s.
///
/// Cloning is cheap; clones publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Returns the number of receivers, or an error when nobody listens.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Subscribes to future events. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A `broadcast::Receiver` with an optional filter.
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by [`recv`](Self::recv).
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking receive; `None` when nothing matching is queued.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_error() {
        let bus = EventBus::new(10);
        assert!(bus.emit(CoreEvent::Auth(AuthEvent::SignedOut)).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = CoreEvent::Auth(AuthEvent::TokenRefreshed {
            expires_at: 1_700_000_000,
        });
        assert_eq!(bus.emit(event.clone()).unwrap(), 2);

        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe()).filter(|event| {
            matches!(event, CoreEvent::Auth(AuthEvent::StateChanged { .. }))
        });

        bus.emit(CoreEvent::Auth(AuthEvent::TokenRefreshing { reactive: true }))
            .ok();
        let changed = CoreEvent::Auth(AuthEvent::StateChanged {
            from: "AUTHORIZED".to_string(),
            to: "INSTANT_REFRESH".to_string(),
        });
        bus.emit(changed.clone()).ok();

        assert_eq!(stream.recv().await.unwrap(), changed);
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_severity() {
        let fatal = CoreEvent::Auth(AuthEvent::AuthError {
            message: "denied".to_string(),
            recoverable: false,
        });
        let transient = CoreEvent::Auth(AuthEvent::AuthError {
            message: "timeout".to_string(),
            recoverable: true,
        });
        assert_eq!(fatal.severity(), EventSeverity::Error);
        assert_eq!(transient.severity(), EventSeverity::Warning);
        assert_eq!(
            CoreEvent::Auth(AuthEvent::SignedIn { expires_at: 0 }).severity(),
            EventSeverity::Info
        );
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::Auth(AuthEvent::StateChanged {
            from: "REFRESHING".to_string(),
            to: "AUTHORIZED".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Auth");
        assert_eq!(json["payload"]["event"], "StateChanged");
        assert_eq!(json["payload"]["to"], "AUTHORIZED");

        let back: CoreEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
