#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Native watcher error: {0}")]
    Native(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Watcher server is disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, WatcherError>;
