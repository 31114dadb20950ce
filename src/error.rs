use thiserror::Error;

use crate::wal::WalError;

/// Failures of scheduler operations.
///
/// Everything except `Durability` is a client-level rejection that leaves the
/// broker state untouched.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job doesn't exist, or isn't in a state (or owned by a connection)
    /// that allows the operation.
    #[error("job or tube not found")]
    NotFound,

    #[error("job body exceeds {limit} bytes")]
    JobTooBig { limit: u32 },

    /// Ignoring the tube would leave the connection watching nothing.
    #[error("cannot ignore the only watched tube")]
    NotIgnored,

    #[error("connection is not watching any tube")]
    NoWatchedTubes,

    /// The WAL couldn't persist a mutation. The broker must not continue.
    #[error("durability failure: {0}")]
    Durability(#[from] WalError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
