use std::fmt;

#[derive(Debug)]
pub enum HubError {
    /// Artifact download or decompression failed.
    Download(String),
    /// The OS could not create the requested process.
    Spawn(String),
    /// The process started but never reached its ready state.
    Startup(String),
    /// An operation was issued against the wrong lifecycle state.
    Lifecycle(String),
    /// Forwarding traffic to an upstream driver failed.
    Proxy(String),
    Config(String),
    Generic(anyhow::Error),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download(msg) => write!(f, "Download error: {msg}"),
            Self::Spawn(msg) => write!(f, "Spawn error: {msg}"),
            Self::Startup(msg) => write!(f, "Startup error: {msg}"),
            Self::Lifecycle(msg) => write!(f, "Lifecycle error: {msg}"),
            Self::Proxy(msg) => write!(f, "Proxy error: {msg}"),
            Self::Config(msg) => write!(f, "Config error: {msg}"),
            Self::Generic(e) => write!(f, "Generic error: {e}"),
        }
    }
}

impl std::error::Error for HubError {}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        Self::Generic(err)
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        Self::Generic(anyhow::anyhow!("I/O error: {}", err))
    }
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        Self::Proxy(format!("HTTP request failed: {err}"))
    }
}

impl From<regex::Error> for HubError {
    fn from(err: regex::Error) -> Self {
        Self::Config(format!("invalid pattern: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
