//! flockrs Error Types

use thiserror::Error;

/// Result type alias for flockrs operations
pub type Result<T> = std::result::Result<T, Error>;

/// flockrs error types
#[derive(Error, Debug)]
pub enum Error {
    /// No leader is currently known for this channel.
    #[error("no leader available for channel {0}")]
    NoLeader(String),

    /// A request exhausted its retry budget without a response.
    #[error("request {request_id} exceeded {max_retries} retries")]
    MaxRetriesReached { request_id: String, max_retries: u32 },

    /// A leader-only operation was attempted by a non-leader member.
    #[error("operation requires local leadership")]
    NotLeader,

    /// No transport capability could be established for this channel.
    #[error("no transport capability available for channel {0}")]
    TransportUnavailable(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Envelope (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O failure in a transport tier.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The member or flock was resigned/shut down.
    #[error("member or flock has been shut down")]
    ShuttingDown,
}

impl Error {
    /// Whether this error reflects a condition the caller could retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NoLeader(_) | Error::TransportUnavailable(_))
    }
}
