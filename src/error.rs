use thiserror::Error;

/// Main error type for the DVR server
#[derive(Error, Debug)]
pub enum DvrError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("volume not ready: {0}")]
    VolumeNotReady(String),

    #[error("cache file corrupt: {0}")]
    CacheCorrupt(String),

    #[error("no recording covers the requested instant")]
    SeekNotFound,

    #[error("no decoder parameter sets near the resolved offset")]
    HeaderNotFound,

    #[error("stream read error: {0}")]
    StreamIo(std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DvrError {
    /// Message shown to the player UI for this error.
    ///
    /// The seek-miss text is the literal string the device's own client
    /// displays; the frontend matches on it.
    pub fn client_message(&self) -> String {
        match self {
            DvrError::SeekNotFound => "未找到指定时间的录像".to_string(),
            DvrError::HeaderNotFound => "未找到关键帧".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DvrError>;
