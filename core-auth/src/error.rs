use crate::types::CredentialState;
use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    /// Malformed parameters, or a profile that cannot be used with them.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Transport-level failure talking to the authorization server.
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// Non-200 from the token endpoint, or an unusable token response.
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Cannot {operation} while {state}")]
    WrongState {
        operation: &'static str,
        state: CredentialState,
    },

    #[error("Failed to persist profile: {0}")]
    PersistenceFailure(String),

    /// Returned to every waiter once the machine is failed or shut down.
    #[error("Credential manager is {state}")]
    Terminated { state: CredentialState },

    /// Partially present credential block or unreadable profile.
    #[error("Corrupt profile: {0}")]
    CorruptProfile(String),

    #[error("Timed out during {operation}")]
    Timeout { operation: &'static str },

    #[error("Authorization was cancelled")]
    Cancelled,

    #[error("Failed to open authorization URL: {0}")]
    OpenUrlFailed(String),

    #[error("Redirect listener error: {0}")]
    Listener(String),
}

impl AuthError {
    /// The machine can no longer serve credentials without `logout` or a new instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::Terminated { .. })
    }

    /// Retrying the same operation (or authorizing again) can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AuthError::NetworkFailure(_)
                | AuthError::Timeout { .. }
                | AuthError::Cancelled
                | AuthError::OpenUrlFailed(_)
                | AuthError::Listener(_)
                | AuthError::PersistenceFailure(_)
        )
    }
}

impl From<BridgeError> for AuthError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Timeout(_) => AuthError::Timeout {
                operation: "http request",
            },
            other => AuthError::NetworkFailure(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_state_message() {
        let err = AuthError::WrongState {
            operation: "authorize",
            state: CredentialState::Authorized,
        };
        assert_eq!(err.to_string(), "Cannot authorize while AUTHORIZED");
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_classification() {
        assert!(AuthError::Terminated {
            state: CredentialState::Cleanup
        }
        .is_terminal());
        assert!(AuthError::NetworkFailure("reset".into()).is_recoverable());
        assert!(!AuthError::AuthorizationDenied("invalid_grant".into()).is_recoverable());
        assert!(!AuthError::CorruptProfile("partial".into()).is_recoverable());
    }

    #[test]
    fn test_bridge_timeout_maps_to_timeout() {
        let err: AuthError = BridgeError::Timeout("30s".into()).into();
        assert!(matches!(err, AuthError::Timeout { .. }));

        let err: AuthError = BridgeError::OperationFailed("refused".into()).into();
        assert!(matches!(err, AuthError::NetworkFailure(_)));
    }
}
