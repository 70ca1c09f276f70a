use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Reading progress at or above this counts as a completed article.
pub const READING_PROGRESS_FULL: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<String>,

    /// Unix milliseconds, 0 when unknown.
    #[serde(default)]
    pub time_added: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_updated: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_opened: Option<i64>,

    #[serde(default)]
    pub reading_progress: f64,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub is_queued: bool,

    #[serde(default)]
    pub topic_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recency_sort_position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_sort_position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favorites_sort_position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_sort_position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_sort_position: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pocket_id: Option<String>,

    /// Filled in by list accessors, never stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_count: Option<usize>,
}

impl Article {
    /// A fresh article for `url` whose id is derived from the normalized URL.
    pub fn from_url(url: &str, title: Option<String>, time_added: i64) -> Self {
        Self {
            id: url_hash(url),
            url: url.to_string(),
            title,
            publication_date: None,
            time_added,
            time_updated: None,
            time_opened: None,
            reading_progress: 0.0,
            is_favorite: false,
            is_queued: false,
            topic_id: None,
            recency_sort_position: None,
            topic_sort_position: None,
            favorites_sort_position: None,
            queue_sort_position: None,
            domain_sort_position: None,
            pocket_id: None,
            annotation_count: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.reading_progress >= READING_PROGRESS_FULL
    }

    /// Last local modification, used as the upload cursor.
    pub fn modified_at(&self) -> i64 {
        self.time_updated.unwrap_or(self.time_added)
    }

    /// Sort value for a list ordering. Missing or legacy index-style
    /// positions (< 1000) fall back to the time the article was added.
    pub fn sort_position(&self, position: ArticleSortPosition) -> f64 {
        let value = match position {
            ArticleSortPosition::Recency => self.recency_sort_position,
            ArticleSortPosition::Topic => self.topic_sort_position,
            ArticleSortPosition::Favorites => self.favorites_sort_position,
            ArticleSortPosition::Queue => self.queue_sort_position,
            ArticleSortPosition::Domain => self.domain_sort_position,
        };
        match value {
            Some(v) if v >= 1000.0 => v,
            _ => self.time_added as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArticleSortPosition {
    #[serde(rename = "recency_sort_position")]
    Recency,
    #[serde(rename = "topic_sort_position")]
    Topic,
    #[serde(rename = "favorites_sort_position")]
    Favorites,
    #[serde(rename = "queue_sort_position")]
    Queue,
    #[serde(rename = "domain_sort_position")]
    Domain,
}

impl ArticleSortPosition {
    pub fn field(self) -> &'static str {
        match self {
            Self::Recency => "recency_sort_position",
            Self::Topic => "topic_sort_position",
            Self::Favorites => "favorites_sort_position",
            Self::Queue => "queue_sort_position",
            Self::Domain => "domain_sort_position",
        }
    }
}

const KEPT_QUERY_PARAMS: [&str; 4] = ["p", "q", "t", "e"];

/// Canonical form of a page URL used to derive article ids.
pub fn normalize_url(url: &str) -> String {
    let lowered = url
        .to_lowercase()
        .replacen("www.", "", 1)
        .replacen(".html", "", 1)
        .replacen(".htm", "", 1);

    let Ok(mut parsed) = Url::parse(&lowered) else {
        return lowered.trim_end_matches('/').to_string();
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(name, _)| name.contains("id") || KEPT_QUERY_PARAMS.contains(&&**name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    parsed.set_fragment(None);

    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);

    let mut normalized = parsed.to_string();
    for scheme in ["https://", "http://"] {
        if let Some(rest) = normalized.strip_prefix(scheme) {
            normalized = rest.to_string();
            break;
        }
    }
    normalized.trim_end_matches('/').to_string()
}

/// Host of `url` without a leading `www.`, used to group articles by site.
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}

/// Content-derived article id: hex SHA-256 of the normalized URL.
pub fn url_hash(url: &str) -> String {
    let digest = Sha256::digest(normalize_url(url).as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
