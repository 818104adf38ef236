use thiserror::Error;

/// Errors that could occur while building a [`StatsdClient`](crate::StatsdClient).
#[derive(Debug, Error)]
pub enum BuildError {
    /// The configured host/port pair could not be resolved to a usable
    /// socket address.
    #[error("aggregator endpoint cannot be resolved: {0}")]
    InvalidEndpoint(String),

    /// Opening the local UDP socket failed.
    #[error("failed to open UDP socket: {0}")]
    FailedToOpenSocket(#[from] std::io::Error),
}
