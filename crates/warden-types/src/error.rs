use thiserror::Error;

/// Error taxonomy reported by category, not by concrete type.
#[derive(Error, Debug, Clone)]
pub enum WardenError {
    #[error("no such worker, broker, or cluster: {0}")]
    NotFound(String),

    #[error("broker {0} is unreachable")]
    Unreachable(String),

    /// Transient condition from a script's `[1]` code. This variant is
    /// internal to the backoff driver and should
    /// never be returned to an application caller.
    #[error("transient, retry")]
    Retry,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("registry fault: {0}")]
    RegistryFault(String),

    #[error("protocol error on connection: {0}")]
    Protocol(String),

    #[error("application error {name}: {message}")]
    ApplicationError { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, WardenError>;

impl WardenError {
    /// Maps onto the `{name, message}` shape carried in a response envelope
    ///. `ApplicationError` round-trips its original name;
    /// every other kind is reported by its category name so a remote peer
    /// never needs to parse a message string.
    pub fn into_remote(self) -> warden_remote_error::RemoteErrorParts {
        match self {
            WardenError::ApplicationError { name, message } => {
                warden_remote_error::RemoteErrorParts { name, message }
            }
            other => warden_remote_error::RemoteErrorParts {
                name: other.category().to_string(),
                message: other.to_string(),
            },
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            WardenError::NotFound(_) => "NotFound",
            WardenError::Unreachable(_) => "Unreachable",
            WardenError::Retry => "Retry",
            WardenError::Timeout(_) => "Timeout",
            WardenError::InvalidState(_) => "InvalidState",
            WardenError::RegistryFault(_) => "RegistryFault",
            WardenError::Protocol(_) => "Protocol",
            WardenError::ApplicationError { .. } => "ApplicationError",
        }
    }
}

/// Kept in its own module so the shape of a remote-error payload is not
/// confused with the local `WardenError` enum it's derived from.
pub mod warden_remote_error {
    #[derive(Debug, Clone)]
    pub struct RemoteErrorParts {
        pub name: String,
        pub message: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_error_preserves_name_and_message() {
        let err = WardenError::ApplicationError {
            name: "BadInput".to_string(),
            message: "missing field".to_string(),
        };
        let parts = err.into_remote();
        assert_eq!(parts.name, "BadInput");
        assert_eq!(parts.message, "missing field");
    }

    #[test]
    fn category_names_are_stable() {
        assert_eq!(WardenError::NotFound("x".into()).category(), "NotFound");
        assert_eq!(WardenError::Retry.category(), "Retry");
    }
}
