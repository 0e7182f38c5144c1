//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! This crate provides production-ready implementations of the bridge traits
//! using desktop-appropriate libraries:
//! - `HttpClient` using `reqwest`
//! - `UrlOpener` using the `open` crate (system default browser)
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{ReqwestHttpClient, SystemBrowser};
//! use bridge_traits::{HttpClient, UrlOpener};
//!
//! #[tokio::main]
//! async fn main() {
//!     let http_client = ReqwestHttpClient::new().unwrap();
//!     let browser = SystemBrowser::new().with_echo(true);
//!
//!     // Use in core configuration
//! }
//! ```

mod browser;
mod http;

pub use browser::SystemBrowser;
pub use http::{ReqwestHttpClient, DEFAULT_REQUEST_TIMEOUT};
