mod annotation;
mod article;
mod library;
mod sync_state;

pub use annotation::Annotation;
pub use article::{domain_of, normalize_url, url_hash, Article, ArticleSortPosition, READING_PROGRESS_FULL};
pub use library::{FeedSubscription, RecordUpdate, Settings, Tombstone, Topic, UserInfo};
pub use sync_state::{SyncProvider, SyncState};

/// Key prefixes of the record families stored in every backend namespace.
pub mod keys {
    pub const ARTICLES: &str = "articles/";
    pub const ANNOTATIONS: &str = "annotations/";
    pub const TOPICS: &str = "topics/";
    pub const SUBSCRIPTIONS: &str = "subscription/";
    pub const TOMBSTONES: &str = "tombstones/";
    pub const SYNC_STATE: &str = "syncState/";
    pub const SETTINGS: &str = "settings";
    pub const USER_INFO: &str = "userInfo";

    pub fn article(id: &str) -> String {
        format!("{ARTICLES}{id}")
    }

    pub fn annotation(id: &str) -> String {
        format!("{ANNOTATIONS}{id}")
    }

    pub fn topic(id: &str) -> String {
        format!("{TOPICS}{id}")
    }

    pub fn subscription(id: &str) -> String {
        format!("{SUBSCRIPTIONS}{id}")
    }

    pub fn sync_state(provider: &str) -> String {
        format!("{SYNC_STATE}{provider}")
    }

    /// `entity` is the record family without its slash, e.g. `annotations`.
    pub fn tombstone(entity: &str, id: &str) -> String {
        format!("{TOMBSTONES}{entity}/{id}")
    }
}
