use serde::{Deserialize, Serialize};

/// Remote service backing one sync flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncProvider {
    /// Highlights and notes.
    Hypothesis,
    /// Saved articles.
    Pocket,
}

impl SyncProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hypothesis => "hypothesis",
            Self::Pocket => "pocket",
        }
    }
}

impl std::fmt::Display for SyncProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-provider watermarks and credentials. Written only by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Provider name, also the record key suffix.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub api_token: String,

    /// Unix milliseconds of the last fully successful download.
    #[serde(default)]
    pub last_download: Option<i64>,
    /// Unix milliseconds captured before the last fully successful upload.
    #[serde(default)]
    pub last_upload: Option<i64>,

    #[serde(default)]
    pub is_syncing: bool,
}

impl SyncState {
    pub fn new(provider: SyncProvider, username: Option<String>, api_token: impl Into<String>) -> Self {
        Self {
            id: provider.as_str().to_string(),
            username,
            api_token: api_token.into(),
            last_download: None,
            last_upload: None,
            is_syncing: false,
        }
    }
}
