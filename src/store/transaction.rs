use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{KvStore, KvWrite};
use crate::error::{AppError, Result};
use crate::models::keys;

/// Source of "now" for mutators and the sync engine, in unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used by tests and headless tools
/// that need reproducible timestamps.
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self(AtomicI64::new(now_ms))
    }

    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub const ANNOTATIONS_PER_ARTICLE: &str = "annotationsPerArticle";
pub const ARTICLES_BY_TOPIC: &str = "articlesByTopic";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOptions {
    #[serde(default)]
    pub prefix: Option<String>,
    /// Emulated secondary index. When set, `prefix` is the indexed value.
    #[serde(default)]
    pub index_name: Option<String>,
    #[serde(default)]
    pub start: Option<ScanStart>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanStart {
    pub key: String,
    #[serde(default)]
    pub exclusive: bool,
}

impl ScanOptions {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    pub fn index(index_name: &str, value: impl Into<String>) -> Self {
        Self {
            prefix: Some(value.into()),
            index_name: Some(index_name.to_string()),
            ..Default::default()
        }
    }

    /// Key range that has to be read from storage before filtering.
    fn storage_prefix(&self) -> Result<Option<&str>> {
        match self.index_name.as_deref() {
            None => Ok(self.prefix.as_deref()),
            Some(ANNOTATIONS_PER_ARTICLE) => Ok(Some(keys::ANNOTATIONS)),
            Some(ARTICLES_BY_TOPIC) => Ok(Some(keys::ARTICLES)),
            Some(other) => Err(AppError::invalid_argument(
                "scan",
                format!("unknown index {other}"),
            )),
        }
    }

    /// Narrow key-ordered entries down to what the options select.
    fn select(&self, entries: impl IntoIterator<Item = (String, Value)>) -> Result<Vec<(String, Value)>> {
        let indexed_field = match self.index_name.as_deref() {
            Some(ANNOTATIONS_PER_ARTICLE) => Some((keys::ANNOTATIONS, "article_id")),
            Some(ARTICLES_BY_TOPIC) => Some((keys::ARTICLES, "topic_id")),
            Some(other) => {
                return Err(AppError::invalid_argument(
                    "scan",
                    format!("unknown index {other}"),
                ))
            }
            None => None,
        };
        let wanted = self.prefix.as_deref().unwrap_or_default();

        let selected = entries
            .into_iter()
            .filter(|(key, value)| match indexed_field {
                Some((family, field)) => {
                    key.starts_with(family)
                        && value.get(field).and_then(Value::as_str) == Some(wanted)
                }
                None => key.starts_with(wanted),
            })
            .filter(|(key, _)| match &self.start {
                Some(start) if start.exclusive => key.as_str() > start.key.as_str(),
                Some(start) => key.as_str() >= start.key.as_str(),
                None => true,
            })
            .take(self.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(selected)
    }
}

/// Read access shared by read-only and read-write transactions, so that
/// accessors run unchanged inside mutators.
#[async_trait]
pub trait ReadTx: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    fn now_ms(&self) -> i64;

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Entries in ascending key order.
    async fn scan(&self, options: &ScanOptions) -> Result<Vec<(String, Value)>>;
}

pub async fn get_as<T: DeserializeOwned>(tx: &dyn ReadTx, key: &str) -> Result<Option<T>> {
    match tx.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Typed scan. Records that no longer match their model are skipped.
pub async fn scan_as<T: DeserializeOwned>(tx: &dyn ReadTx, options: &ScanOptions) -> Result<Vec<T>> {
    let entries = tx.scan(options).await?;
    Ok(entries
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Skipping malformed record {}: {}", key, e);
                None
            }
        })
        .collect())
}

pub struct ReadTransaction {
    store: KvStore,
    namespace: String,
    clock: Arc<dyn Clock>,
}

impl ReadTransaction {
    pub fn new(store: KvStore, namespace: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            clock,
        }
    }
}

#[async_trait]
impl ReadTx for ReadTransaction {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.store.get(&self.namespace, key).await
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    async fn has(&self, key: &str) -> Result<bool> {
        self.store.has(&self.namespace, key).await
    }

    async fn scan(&self, options: &ScanOptions) -> Result<Vec<(String, Value)>> {
        let entries = self
            .store
            .entries(&self.namespace, options.storage_prefix()?)
            .await?;
        options.select(entries)
    }
}

/// Buffers writes in a key-ordered overlay. Nothing reaches storage until
/// `commit`, and a transaction dropped without committing writes nothing.
pub struct WriteTransaction {
    store: KvStore,
    namespace: String,
    clock: Arc<dyn Clock>,
    overlay: BTreeMap<String, Option<Value>>,
}

impl WriteTransaction {
    pub fn new(store: KvStore, namespace: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            clock,
            overlay: BTreeMap::new(),
        }
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.overlay.insert(key.into(), Some(value));
    }

    pub fn put_record<T: Serialize>(&mut self, key: impl Into<String>, record: &T) -> Result<()> {
        self.put(key, serde_json::to_value(record)?);
        Ok(())
    }

    /// Returns whether the key existed, counting earlier writes of this transaction.
    pub async fn delete(&mut self, key: &str) -> Result<bool> {
        let existed = self.has(key).await?;
        self.overlay.insert(key.to_string(), None);
        Ok(existed)
    }

    pub fn is_empty(&self) -> bool {
        self.overlay.is_empty()
    }

    /// Apply every buffered write in one storage transaction and return the
    /// keys that were written.
    pub async fn commit(self) -> Result<Vec<String>> {
        let changed: Vec<String> = self.overlay.keys().cloned().collect();
        let writes: Vec<KvWrite> = self.overlay.into_iter().collect();
        self.store.apply(&self.namespace, writes).await?;
        Ok(changed)
    }
}

#[async_trait]
impl ReadTx for WriteTransaction {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.overlay.get(key) {
            Some(buffered) => Ok(buffered.clone()),
            None => self.store.get(&self.namespace, key).await,
        }
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    async fn scan(&self, options: &ScanOptions) -> Result<Vec<(String, Value)>> {
        let prefix = options.storage_prefix()?;
        let mut merged: BTreeMap<String, Value> = self
            .store
            .entries(&self.namespace, prefix)
            .await?
            .into_iter()
            .collect();

        let prefix = prefix.unwrap_or_default();
        for (key, buffered) in self.overlay.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match buffered {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }

        options.select(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> KvStore {
        let store = KvStore::open_in_memory().await.unwrap();
        store
            .apply(
                "local",
                vec![
                    ("annotations/a".into(), Some(json!({ "id": "a", "article_id": "art1" }))),
                    ("annotations/b".into(), Some(json!({ "id": "b", "article_id": "art2" }))),
                    ("annotations/c".into(), Some(json!({ "id": "c", "article_id": "art1" }))),
                    ("articles/art1".into(), Some(json!({ "id": "art1", "topic_id": "t1" }))),
                    ("settings".into(), Some(json!({}))),
                ],
            )
            .await
            .unwrap();
        store
    }

    fn keys_of(entries: &[(String, Value)]) -> Vec<&str> {
        entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    #[tokio::test]
    async fn scan_applies_start_and_limit_after_prefix() {
        let tx = ReadTransaction::new(seeded().await, "local", Arc::new(SystemClock));

        let all = tx.scan(&ScanOptions::default()).await.unwrap();
        assert_eq!(
            keys_of(&all),
            vec!["annotations/a", "annotations/b", "annotations/c", "articles/art1", "settings"]
        );

        let options = ScanOptions {
            prefix: Some("annotations/".into()),
            start: Some(ScanStart {
                key: "annotations/a".into(),
                exclusive: true,
            }),
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(keys_of(&tx.scan(&options).await.unwrap()), vec!["annotations/b"]);
    }

    #[tokio::test]
    async fn index_scan_filters_by_indexed_field() {
        let tx = ReadTransaction::new(seeded().await, "local", Arc::new(SystemClock));

        let per_article = tx
            .scan(&ScanOptions::index(ANNOTATIONS_PER_ARTICLE, "art1"))
            .await
            .unwrap();
        assert_eq!(keys_of(&per_article), vec!["annotations/a", "annotations/c"]);

        let by_topic = tx.scan(&ScanOptions::index(ARTICLES_BY_TOPIC, "t1")).await.unwrap();
        assert_eq!(keys_of(&by_topic), vec!["articles/art1"]);

        let err = tx.scan(&ScanOptions::index("byColour", "red")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn write_overlay_is_visible_before_commit_only_to_itself() {
        let store = seeded().await;
        let mut tx = WriteTransaction::new(store.clone(), "local", Arc::new(ManualClock::new(0)));

        tx.put("annotations/d", json!({ "id": "d", "article_id": "art1" }));
        assert!(tx.delete("annotations/a").await.unwrap());
        assert!(!tx.delete("annotations/zzz").await.unwrap());

        let seen = tx.scan(&ScanOptions::prefix("annotations/")).await.unwrap();
        assert_eq!(keys_of(&seen), vec!["annotations/b", "annotations/c", "annotations/d"]);
        assert!(store.get("local", "annotations/d").await.unwrap().is_none());

        let changed = tx.commit().await.unwrap();
        assert_eq!(changed, vec!["annotations/a", "annotations/d", "annotations/zzz"]);
        assert!(store.get("local", "annotations/a").await.unwrap().is_none());
        assert!(store.get("local", "annotations/d").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropped_transaction_writes_nothing() {
        let store = seeded().await;
        {
            let mut tx = WriteTransaction::new(store.clone(), "local", Arc::new(SystemClock));
            tx.put("articles/new", json!({ "id": "new" }));
        }
        assert!(!store.has("local", "articles/new").await.unwrap());
    }
}
