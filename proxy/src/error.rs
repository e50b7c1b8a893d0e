use shared::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("backend {0} did not answer in time")]
    BackendTimeout(String),
    #[error("backend {backend} misbehaved: {reason}")]
    BackendProtocol { backend: String, reason: String },
    #[error("backend {0} is unavailable")]
    BackendUnavailable(String),
}

/// Outcome shared with every client waiting on the same refresh
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("backend unavailable")]
    BackendUnavailable,
    #[error("backend protocol error: {0}")]
    BackendProtocol(String),
    #[error("no poller for this backend")]
    UnknownBackend,
}
