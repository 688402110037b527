use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the host context and its collaborators.
///
/// Upstream computation failures do not appear here; they travel as
/// error-state async values carrying a [`crate::Diagnostic`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("invariant violation: {message}")]
    Invariant { message: String },

    #[error("capacity exceeded: {what} (limit {limit})")]
    CapacityExceeded { what: &'static str, limit: usize },

    #[error("execution cancelled: {message}")]
    Cancelled { message: String },

    #[error("blocking work queue rejected the task")]
    Rejected,
}

impl Error {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Error::Invariant {
            message: message.into(),
        }
    }
}
