use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid argument for {method}: {message}")]
    InvalidArgument { method: String, message: String },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("{provider} API error: {message}")]
    RemoteApi { provider: String, message: String },

    /// Both sides changed a record within one cycle; the later sync direction wins.
    #[error("Conflicting edits on {key} ignored, remote version kept")]
    ConflictIgnored { key: String },

    #[error("Migration interrupted after importing {migrated} entries ({remaining} local entries remain)")]
    MigrationPartial { migrated: usize, remaining: usize },

    #[error("No signed-in account")]
    NotSignedIn,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),
}

impl AppError {
    pub fn invalid_argument(method: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidArgument {
            method: method.into(),
            message: message.to_string(),
        }
    }

    pub fn remote(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Errors the sync engine treats as transient: the watermark stays put
    /// and the same window is retried next cycle.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::NetworkFailure(_) | Self::RemoteApi { .. })
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

impl From<tokio_rusqlite::Error> for AppError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::NetworkFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
