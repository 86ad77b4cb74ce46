//! Server error types.

use switchyard_core::HubError;
use thiserror::Error;

use crate::store::StoreError;

/// Errors that stop the server from starting or running.
///
/// Per-connection problems never surface here; they are answered on the
/// connection itself with an `error` envelope and a close code.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid configuration (bad bind address, empty JWT secret, ...).
    ///
    /// Fatal at startup. Fix configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Listener or socket failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Coordination store could not be opened.
    ///
    /// Only fatal at startup. Once running, store failures degrade the hub
    /// instead.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Hub rejected an operation.
    #[error("hub error: {0}")]
    Hub(#[from] HubError),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn display_names_the_layer() {
        let err = ServerError::Config("missing --jwt-secret".into());
        assert_eq!(err.to_string(), "configuration error: missing --jwt-secret");

        let err = ServerError::from(StoreError::Io("disk full".into()));
        assert_eq!(err.to_string(), "store error: coordination store I/O error: disk full");

        let err = ServerError::from(HubError::RoomNotFound { room_id: Uuid::nil() });
        assert!(err.to_string().starts_with("hub error: room not found"));

        let err = ServerError::from(std::io::Error::other("address in use"));
        assert_eq!(err.to_string(), "transport error: address in use");
    }
}
