// Terminal errors delivered to submitters.
//
// Each pending entry receives exactly one of these (or a response). The enum
// is `Clone` because a single stream failure terminates many entries with the
// same error.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("deadline exceeded: {reason}")]
    DeadlineExceeded { reason: String },
    /// The batch connection has been closed by its owner.
    #[error("batch connection closed")]
    ConnectionClosed,
    /// The stream client was shut down with async entries still pending.
    #[error("batch client closed")]
    ClientClosed,
    #[error("no available connections")]
    NoAvailableConnections,
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    pub(crate) fn transport(err: &anyhow::Error) -> Self {
        Error::Transport(format!("{err:#}"))
    }
}
