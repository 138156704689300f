use std::io;

/// The domain error channel surfaced to application code.
///
/// Every public async operation clears both this and the accompanying
/// [`std::io::Error`] system error on entry; at most one of the two is set
/// before a callback fires, mirroring the `ErrorConditionT`/system-error
/// pair a C completion context would carry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation already in progress")]
    OperationInProgress,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("transport error: {0}")]
    TransportError(#[source] io::Error),
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out")]
    Timeout,
    #[error("invalid address")]
    AddressError,
    #[error("allocation failed")]
    AllocationError,
    #[error("reactor slot table is full")]
    CapacityError,
    #[error("memory cache already configured")]
    CacheAlreadyInUse,
}

impl Error {
    /// `true` for errors that a retry at a later readiness event could
    /// plausibly resolve. Used by tests and diagnostics only — the reactor
    /// itself never retries automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::OperationInProgress)
    }

    /// A best-effort copy for handing the same failure to more than one
    /// waiting continuation (e.g. a listener's accept continuation and its
    /// teardown path). `io::Error` isn't `Clone`, so the system error's
    /// kind is preserved but its OS-specific detail is not.
    pub fn clone_for_report(&self) -> Error {
        match self {
            Error::OperationInProgress => Error::OperationInProgress,
            Error::PeerClosed => Error::PeerClosed,
            Error::TransportError(e) => Error::TransportError(io::Error::from(e.kind())),
            Error::Canceled => Error::Canceled,
            Error::Timeout => Error::Timeout,
            Error::AddressError => Error::AddressError,
            Error::AllocationError => Error::AllocationError,
            Error::CapacityError => Error::CapacityError,
            Error::CacheAlreadyInUse => Error::CacheAlreadyInUse,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
