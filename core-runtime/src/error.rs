//! Runtime errors.

use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A `CoreConfig` or `LoggingConfig` value was rejected.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The global tracing subscriber could not be installed.
    #[error("Logging unavailable: {0}")]
    Logging(String),

    #[error("Missing capability {capability}: {message}")]
    CapabilityMissing {
        capability: &'static str,
        message: String,
    },

    /// A desktop default for `capability` failed to construct.
    #[error("Default {capability} could not be created: {source}")]
    DefaultCapability {
        capability: &'static str,
        #[source]
        source: BridgeError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
