use thiserror::Error;

/// Errors surfaced while accepting and classifying a connection.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer did not finish sending its header before the deadline
    #[error("timed out reading PROXY protocol header")]
    HeaderReadTimeout,

    #[error("malformed PROXY protocol header: {0}")]
    MalformedHeader(String),

    /// A header was required but the stream starts with neither signature
    #[error("unsupported PROXY protocol version")]
    UnsupportedVersion,

    #[error("PROXY protocol header too large: {0} bytes")]
    HeaderTooLarge(usize),

    #[error("listener closed")]
    ListenerClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedHeader(msg.into())
    }
}

/// Invalid allow-list specification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("allow-list specification is empty")]
    Empty,

    #[error("invalid IP address or CIDR in allow-list: {0:?}")]
    InvalidEntry(String),
}
