//! # Authentication Module
//!
//! OAuth2 credential lifecycle manager.
//!
//! ## Overview
//!
//! This crate acquires, caches, proactively refreshes, persists and serves a
//! bearer credential to any number of concurrent HTTP transactions, and
//! refreshes reactively when a transaction is rejected with `401`.
//!
//! ## Features
//!
//! - Interactive authorization-code flow with a local redirect listener
//! - Background refresh at expiry, coalesced with caller-triggered refreshes
//! - Atomic replace-on-write profile persistence
//! - A transaction gateway that attaches the credential and retries once on `401`
//! - Auth state event emission
//!
//! ## Usage
//!
//! ```ignore
//! use core_auth::{AuthorizationParameters, CredentialStateMachine, MachineOptions, TransactionGateway};
//! use std::sync::Arc;
//!
//! let params = AuthorizationParameters::onedrive_from_env("/home/me/.cloudlink/onedrive.json")?;
//! let machine = Arc::new(
//!     CredentialStateMachine::load(params, http.clone(), MachineOptions::default()).await?,
//! );
//! if machine.state() == CredentialState::Unauthorized {
//!     machine.authorize(&SystemBrowser::new()).await?;
//! }
//!
//! let gateway = TransactionGateway::new(machine.clone(), http);
//! let response = gateway.perform(HttpRequest::new(HttpMethod::Get, url)).await?;
//! machine.shutdown().await;
//! ```

pub mod codec;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod machine;
pub mod oauth;
pub mod params;
pub mod types;

pub use codec::{ProfileStore, TokenCodec};
pub use error::{AuthError, Result};
pub use gateway::{TransactionGateway, DEFAULT_MAX_RETRIES};
pub use listener::AuthCodeListener;
pub use machine::{CredentialStateMachine, MachineOptions, StateWatcher};
pub use oauth::OAuthClient;
pub use params::{AuthTimeouts, AuthorizationParameters, AuthorizationParametersBuilder};
pub use types::{Credential, CredentialState};
