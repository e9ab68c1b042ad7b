//! Discovery error types

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Discovery-specific error types
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// `index` is the store index the miss was observed at, when reported
    #[error("Key not found: {key}")]
    KeyNotFound { key: String, index: Option<u64> },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Store rejected request ({code}): {message}")]
    StoreRejected { code: u64, message: String },

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiscoveryError {
    pub fn store_unavailable<T: Into<String>>(msg: T) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn key_not_found<T: Into<String>>(key: T) -> Self {
        Self::KeyNotFound {
            key: key.into(),
            index: None,
        }
    }

    pub fn key_not_found_at<T: Into<String>>(key: T, index: u64) -> Self {
        Self::KeyNotFound {
            key: key.into(),
            index: Some(index),
        }
    }

    pub fn store<T: Into<String>>(msg: T) -> Self {
        Self::Store(msg.into())
    }

    pub fn rejected<T: Into<String>>(code: u64, message: T) -> Self {
        Self::StoreRejected {
            code,
            message: message.into(),
        }
    }

    pub fn watch<T: Into<String>>(msg: T) -> Self {
        Self::Watch(msg.into())
    }

    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        Self::Timeout(msg.into())
    }

    /// True when the store reported that the key does not exist
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. })
    }

    /// Store index carried by a not-found reply
    pub fn store_index(&self) -> Option<u64> {
        match self {
            Self::KeyNotFound { index, .. } => *index,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::store_unavailable(format!("HTTP connect error: {}", err))
        } else if err.is_timeout() {
            Self::timeout(format!("HTTP request timed out: {}", err))
        } else {
            Self::store(format!("HTTP client error: {}", err))
        }
    }
}

impl From<toml::de::Error> for DiscoveryError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(format!("Failed to parse config: {}", err))
    }
}

impl From<toml::ser::Error> for DiscoveryError {
    fn from(err: toml::ser::Error) -> Self {
        Self::configuration(format!("Failed to serialize config: {}", err))
    }
}
