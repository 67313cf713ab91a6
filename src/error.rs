use thiserror::Error;

/// Failures produced by the library itself.
///
/// `CircularReference` is delivered as a rejection reason, so any rejection
/// type used with [`Future`](crate::Future) must be constructible from this
/// enum. `Stalled` and `TimedOut` are only returned by the blocking drivers in
/// [`scheduler`](crate::scheduler).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("circular reference: a future cannot be resolved with itself")]
    CircularReference,
    #[error("{0}")]
    Rejected(String),
    #[error("event loop went idle before the future settled")]
    Stalled,
    #[error("timed out waiting for the future to settle")]
    TimedOut,
}

impl Error {
    /// Shorthand for a plain rejection reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Error::Rejected(reason.into())
    }
}

impl From<&str> for Error {
    fn from(reason: &str) -> Self {
        Error::rejected(reason)
    }
}

impl From<String> for Error {
    fn from(reason: String) -> Self {
        Error::Rejected(reason)
    }
}
