use thiserror::Error;

/// Errors from the coordination store.
///
/// None of these ever reach a client. Callers report them to the
/// availability controller and fall back to local state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store unreachable or refusing requests
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// Operation did not complete in time
    #[error("coordination store timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Backend I/O failure
    #[error("coordination store I/O error: {0}")]
    Io(String),

    /// Stored bytes could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Returns true if the store itself is at fault, as opposed to the data.
    ///
    /// Only these count against availability.
    pub fn is_availability(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::Io(_))
    }
}
