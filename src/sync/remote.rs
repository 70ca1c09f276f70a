use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Annotation, Article, SyncState};

/// An annotation as downloaded from the highlights service, together with
/// the page it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteHighlight {
    pub annotation: Annotation,
    pub page_url: String,
    pub page_title: Option<String>,
}

/// One page of a search. `next_cursor` comes from the last row the server
/// returned, readable or not, so unreadable rows are never fetched again.
/// `None` means the server had no more rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HighlightPage {
    pub highlights: Vec<RemoteHighlight>,
    pub next_cursor: Option<String>,
}

/// Remote annotation service.
#[async_trait]
pub trait HighlightsRemote: Send + Sync {
    /// One page of the user's annotations updated after `cursor`, oldest first.
    async fn search_page(&self, state: &SyncState, cursor: &str) -> Result<HighlightPage>;

    /// Publish a draft and return its remote id.
    async fn create(&self, state: &SyncState, annotation: &Annotation, article: &Article) -> Result<String>;

    async fn update(&self, state: &SyncState, annotation: &Annotation) -> Result<()>;

    async fn delete(&self, state: &SyncState, remote_id: &str) -> Result<()>;

    /// Account name belonging to an api token.
    async fn username(&self, api_token: &str) -> Result<Option<String>>;
}

/// Remote read-it-later service.
#[async_trait]
pub trait ArticlesRemote: Send + Sync {
    /// Articles saved or changed since `since_ms`, or everything when `None`.
    async fn fetch_since(&self, state: &SyncState, since_ms: Option<i64>) -> Result<Vec<Article>>;

    /// Add a new article or refresh an existing one. Returns the remote id
    /// when the service assigned one.
    async fn upsert(&self, state: &SyncState, article: &Article) -> Result<Option<String>>;

    async fn delete(&self, state: &SyncState, remote_id: &str) -> Result<()>;
}
