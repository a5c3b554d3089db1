use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// API-surfaced failures. Internal protocol errors (lost pings, failed
/// punches against one coordinator, single relay rejections) are recovered
/// locally and never reach this enum.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(String),
    #[error("config: {0}")]
    Config(String),
    #[error("node not started")]
    NotStarted,
    #[error("node already started")]
    AlreadyStarted,
    #[error("bind failed: {0}")]
    BindFailed(#[source] std::io::Error),
    #[error("payload too large: {framed} bytes framed (max {max})")]
    PayloadTooLarge { framed: usize, max: usize },
    #[error("peer unreachable within send deadline")]
    Unreachable,
    #[error("hole punch failed: {0}")]
    HolePunchFailed(String),
    #[error("relay rejected: {0}")]
    RelayRejected(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

// Map TOML deserialization errors into the config error domain without adding a new variant
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
