//! Flat key/value storage written by earlier versions, and the one-shot
//! import of its annotations into the library.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::Library;
use crate::db::KvStore;
use crate::error::{AppError, Result};
use crate::models::{url_hash, Annotation, Article, SyncProvider, SyncState};
use crate::store::mutators::ImportArticles;
use crate::store::Mutation;

pub const LEGACY_NAMESPACE: &str = "legacy";

const ANNOTATIONS_PREFIX: &str = "local-annotations_";
const HYPOTHESIS_USERNAME: &str = "hypothesis-username";
const HYPOTHESIS_API_TOKEN: &str = "hypothesis-api-token";
const HYPOTHESIS_SYNC_FLAG: &str = "feature-flag-hypothesis-sync";
const HYPOTHESIS_SYNC_STATE: &str = "hypothesis-sync-state";
const HYPOTHESIS_ADOPTED: &str = "hypothesis-credentials-adopted";
const LIBRARY_IMPORT_FLAG: &str = "feature-flag-library-import";

/// Seconds since the epoch or an RFC 3339 date, depending on the writer.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LegacyTimestamp {
    Seconds(f64),
    Text(String),
}

impl LegacyTimestamp {
    fn to_millis(&self) -> Option<i64> {
        match self {
            Self::Seconds(seconds) => Some((seconds * 1000.0).round() as i64),
            Self::Text(text) => parse_rfc3339(text),
        }
    }
}

fn parse_rfc3339(text: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|at| at.timestamp_millis())
}

#[derive(Debug, Deserialize)]
struct PickledAnnotation {
    id: String,
    #[serde(default)]
    h_id: Option<String>,
    #[serde(default)]
    quote_text: Option<String>,
    #[serde(default)]
    quote_html_selector: Value,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    created_at: LegacyTimestamp,
    #[serde(default)]
    updated_at: Option<LegacyTimestamp>,
    #[serde(default)]
    ai_created: bool,
    #[serde(default)]
    ai_score: Option<f64>,
}

impl PickledAnnotation {
    fn into_annotation(self, article_id: &str) -> Option<Annotation> {
        let created_at = self.created_at.to_millis()?;
        let updated_at = self
            .updated_at
            .and_then(|at| at.to_millis())
            .unwrap_or(created_at);
        Some(Annotation {
            id: self.id,
            article_id: article_id.to_string(),
            quote_text: self.quote_text,
            quote_html_selector: self.quote_html_selector,
            text: self.text.unwrap_or_default(),
            tags: self.tags,
            created_at,
            updated_at,
            h_id: self.h_id,
            ai_created: self.ai_created,
            ai_score: self.ai_score,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySyncTimestamps {
    #[serde(default)]
    last_download_timestamp: Option<String>,
    #[serde(default)]
    last_upload_timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LegacyImport {
    pub articles: usize,
    pub annotations: usize,
}

/// The legacy namespace of the KV store.
#[derive(Clone)]
pub struct LegacyStore {
    store: KvStore,
}

impl LegacyStore {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Seed the namespace from a JSON export of the old storage (one object,
    /// storage keys to values). Returns the number of keys written.
    pub async fn load_export(&self, path: &Path) -> Result<usize> {
        let text = tokio::fs::read_to_string(path).await?;
        let Value::Object(entries) = serde_json::from_str::<Value>(&text)? else {
            return Err(AppError::Config(format!(
                "{} is not a JSON object of storage keys",
                path.display()
            )));
        };
        let count = entries.len();
        let writes = entries.into_iter().map(|(key, value)| (key, Some(value))).collect();
        self.store.apply(LEGACY_NAMESPACE, writes).await?;
        tracing::info!(event = "legacy_export_loaded", keys = count);
        Ok(count)
    }

    async fn string(&self, key: &str) -> Result<Option<String>> {
        Ok(match self.store.get(LEGACY_NAMESPACE, key).await? {
            Some(Value::String(value)) if !value.is_empty() => Some(value),
            _ => None,
        })
    }

    async fn flag(&self, key: &str) -> Result<Option<bool>> {
        Ok(self
            .store
            .get(LEGACY_NAMESPACE, key)
            .await?
            .and_then(|value| value.as_bool()))
    }

    /// Highlights sync credentials of the old settings, if that sync was
    /// enabled, with its watermarks carried over.
    pub async fn hypothesis_sync_state(&self) -> Result<Option<SyncState>> {
        if self.flag(HYPOTHESIS_SYNC_FLAG).await? != Some(true)
            || self.flag(HYPOTHESIS_ADOPTED).await? == Some(true)
        {
            return Ok(None);
        }
        let (Some(username), Some(api_token)) = (
            self.string(HYPOTHESIS_USERNAME).await?,
            self.string(HYPOTHESIS_API_TOKEN).await?,
        ) else {
            return Ok(None);
        };

        let timestamps: LegacySyncTimestamps = match self.store.get(LEGACY_NAMESPACE, HYPOTHESIS_SYNC_STATE).await? {
            Some(value) => serde_json::from_value(value).unwrap_or_default(),
            None => LegacySyncTimestamps::default(),
        };

        let mut state = SyncState::new(SyncProvider::Hypothesis, Some(username), api_token);
        state.last_download = timestamps.last_download_timestamp.as_deref().and_then(parse_rfc3339);
        state.last_upload = timestamps.last_upload_timestamp.as_deref().and_then(parse_rfc3339);
        Ok(Some(state))
    }

    /// Stop offering the legacy credentials once they became a sync state,
    /// so disconnecting the provider later does not bring them back.
    pub async fn mark_credentials_adopted(&self) -> Result<()> {
        self.store
            .put(LEGACY_NAMESPACE, HYPOTHESIS_ADOPTED, &Value::Bool(true))
            .await
    }

    /// Annotation pages still waiting for import, keyed by page URL.
    async fn annotation_pages(&self) -> Result<Vec<(String, String, Map<String, Value>)>> {
        let entries = self.store.entries(LEGACY_NAMESPACE, Some(ANNOTATIONS_PREFIX)).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| {
                let url = key.strip_prefix(ANNOTATIONS_PREFIX)?.to_string();
                match value {
                    Value::Object(page) => Some((key, url, page)),
                    _ => {
                        tracing::warn!("Ignoring malformed legacy page {}", key);
                        None
                    }
                }
            })
            .collect())
    }
}

/// Move legacy annotations into the library: one completed article per
/// annotated page, backdated to its oldest annotation, then the annotations
/// themselves. The imported keys are removed and the import flag cleared,
/// so this never runs twice.
pub async fn import_legacy_annotations(library: &Library, legacy: &LegacyStore) -> Result<LegacyImport> {
    if legacy.flag(LIBRARY_IMPORT_FLAG).await? == Some(false) {
        return Ok(LegacyImport::default());
    }
    let pages = legacy.annotation_pages().await?;
    if pages.is_empty() {
        return Ok(LegacyImport::default());
    }

    let mut articles: BTreeMap<String, Article> = BTreeMap::new();
    let mut annotations = Vec::new();
    let mut imported_keys = Vec::new();

    for (key, url, page) in pages {
        let article_id = url_hash(&url);
        for (id, pickled) in page {
            let parsed = serde_json::from_value::<PickledAnnotation>(pickled)
                .ok()
                .and_then(|pickled| pickled.into_annotation(&article_id));
            let Some(annotation) = parsed else {
                tracing::warn!("Skipping unreadable legacy annotation {} on {}", id, url);
                continue;
            };

            let article = articles.entry(article_id.clone()).or_insert_with(|| {
                let mut article = Article::from_url(&url, None, annotation.created_at);
                article.reading_progress = 1.0;
                article
            });
            article.time_added = article.time_added.min(annotation.created_at);
            annotations.push(annotation);
        }
        imported_keys.push(key);
    }

    let report = LegacyImport {
        articles: articles.len(),
        annotations: annotations.len(),
    };
    tracing::info!(
        event = "legacy_import",
        articles = report.articles,
        annotations = report.annotations
    );

    let articles = articles.into_values().collect();
    library
        .mutate(Mutation::ImportArticles(ImportArticles { articles }))
        .await?;
    for annotation in annotations {
        library.mutate(Mutation::PutAnnotation(annotation)).await?;
    }

    let mut writes: Vec<(String, Option<Value>)> = imported_keys.into_iter().map(|key| (key, None)).collect();
    writes.push((LIBRARY_IMPORT_FLAG.to_string(), Some(Value::Bool(false))));
    legacy.store.apply(LEGACY_NAMESPACE, writes).await?;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use super::*;
    use crate::store::{ManualClock, Query};
    use serde_json::json;

    async fn setup() -> (Library, LegacyStore) {
        let store = KvStore::open_in_memory().await.unwrap();
        let library = Library::new(store.clone(), Arc::new(ManualClock::new(1_000)));
        (library, LegacyStore::new(store))
    }

    async fn seed(legacy: &LegacyStore, entries: Value) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{entries}").unwrap();
        let keys = tokio_test::assert_ok!(legacy.load_export(file.path()).await);
        assert_eq!(keys, entries.as_object().map_or(0, |e| e.len()));
    }

    #[tokio::test]
    async fn imports_pages_as_completed_articles() {
        let (library, legacy) = setup().await;
        seed(
            &legacy,
            json!({
                "local-annotations_https://example.com/post": {
                    "a1": { "id": "a1", "text": "foo", "created_at": 200 },
                    "a2": { "id": "a2", "text": "bar", "created_at": "1970-01-01T00:01:40Z" }
                },
                "feature-flag-library-import": true
            }),
        )
        .await;

        let report = import_legacy_annotations(&library, &legacy).await.unwrap();
        assert_eq!(report, LegacyImport { articles: 1, annotations: 2 });

        let article_id = url_hash("https://example.com/post");
        let article = library.query(&Query::GetArticle(article_id.clone())).await.unwrap();
        assert_eq!(article["reading_progress"], json!(1.0));
        assert_eq!(article["time_added"], json!(100_000));

        let annotations = library
            .query(&Query::ListArticleAnnotations(article_id))
            .await
            .unwrap();
        assert_eq!(annotations.as_array().unwrap().len(), 2);
        assert_eq!(annotations[0]["created_at"], json!(200_000));

        // Second run finds nothing to do.
        let again = import_legacy_annotations(&library, &legacy).await.unwrap();
        assert_eq!(again, LegacyImport::default());
        assert_eq!(legacy.flag(LIBRARY_IMPORT_FLAG).await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn disabled_flag_skips_import() {
        let (library, legacy) = setup().await;
        seed(
            &legacy,
            json!({
                "local-annotations_https://example.com": { "a1": { "id": "a1", "created_at": 1 } },
                "feature-flag-library-import": false
            }),
        )
        .await;

        let report = import_legacy_annotations(&library, &legacy).await.unwrap();
        assert_eq!(report.annotations, 0);
        assert_eq!(library.query(&Query::GetAnnotationsCount).await.unwrap(), json!(0));
    }

    #[tokio::test]
    async fn credentials_become_a_sync_state() {
        let (_, legacy) = setup().await;
        assert!(legacy.hypothesis_sync_state().await.unwrap().is_none());

        seed(
            &legacy,
            json!({
                "hypothesis-username": "reader",
                "hypothesis-api-token": "6879-token",
                "feature-flag-hypothesis-sync": true,
                "hypothesis-sync-state": { "lastDownloadTimestamp": "1970-01-01T00:00:02Z" }
            }),
        )
        .await;

        let state = legacy.hypothesis_sync_state().await.unwrap().unwrap();
        assert_eq!(state.id, "hypothesis");
        assert_eq!(state.username.as_deref(), Some("reader"));
        assert_eq!(state.last_download, Some(2_000));
        assert_eq!(state.last_upload, None);

        legacy.mark_credentials_adopted().await.unwrap();
        assert!(legacy.hypothesis_sync_state().await.unwrap().is_none());
    }
}
