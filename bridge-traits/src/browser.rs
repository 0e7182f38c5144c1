//! Browser Launch Abstraction
//!
//! Interactive OAuth flows need the host to present an authorization URL to the
//! user. Desktop hosts open the system browser; embedded hosts may show a web
//! view or simply print the URL.

use async_trait::async_trait;

use crate::error::Result;

/// Strategy for presenting an authorization URL to the user.
///
/// `open` should return as soon as the URL has been handed off. The redirect
/// back to the application is captured separately, so an implementation that
/// cannot confirm the user actually finished the flow is still correct.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::browser::UrlOpener;
///
/// struct PrintUrl;
///
/// #[async_trait::async_trait]
/// impl UrlOpener for PrintUrl {
///     async fn open(&self, url: &str) -> bridge_traits::error::Result<()> {
///         println!("Visit {url} to continue");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait UrlOpener: Send + Sync {
    async fn open(&self, url: &str) -> Result<()>;
}

/// Adapts a plain closure into a [`UrlOpener`].
pub struct FnUrlOpener<F>(F);

impl<F> FnUrlOpener<F>
where
    F: Fn(&str) -> Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> UrlOpener for FnUrlOpener<F>
where
    F: Fn(&str) -> Result<()> + Send + Sync,
{
    async fn open(&self, url: &str) -> Result<()> {
        (self.0)(url)
    }
}
