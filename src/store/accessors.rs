use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{
    domain_of, keys, Annotation, Article, ArticleSortPosition, FeedSubscription, Settings,
    SyncProvider, SyncState, Tombstone, Topic, UserInfo, READING_PROGRESS_FULL,
};

use super::transaction::{
    get_as, scan_as, ReadTx, ScanOptions, ANNOTATIONS_PER_ARTICLE, ARTICLES_BY_TOPIC,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateFilter {
    #[default]
    All,
    Unread,
    Read,
    Favorite,
}

impl StateFilter {
    fn matches(self, article: &Article) -> bool {
        match self {
            Self::All => true,
            Self::Unread => !article.is_completed(),
            Self::Read => article.is_completed(),
            Self::Favorite => article.is_favorite,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingProgress {
    pub article_count: usize,
    pub completed_count: usize,
    pub queue_count: usize,
    pub annotation_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationWithArticle {
    #[serde(flatten)]
    pub annotation: Annotation,
    pub article: Option<Article>,
}

/// A titled group of the recent list: a week or month holding articles, or
/// a year holding month groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleBucket {
    pub key: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub articles: Option<Vec<Article>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ArticleBucket>>,
}

impl ArticleBucket {
    fn leaf(key: String, title: String) -> Self {
        Self {
            key,
            title,
            articles: Some(Vec::new()),
            children: None,
        }
    }
}

/// Highest position first, so new items can be placed in front.
pub fn sort_articles(articles: &mut [Article], position: ArticleSortPosition) {
    articles.sort_by(|a, b| {
        b.sort_position(position)
            .total_cmp(&a.sort_position(position))
    });
}

/* articles */

pub async fn get_article(tx: &dyn ReadTx, id: &str) -> Result<Option<Article>> {
    get_as(tx, &keys::article(id)).await
}

pub async fn list_articles(tx: &dyn ReadTx) -> Result<Vec<Article>> {
    scan_as(tx, &ScanOptions::prefix(keys::ARTICLES)).await
}

pub async fn get_articles_count(tx: &dyn ReadTx) -> Result<usize> {
    Ok(tx.scan(&ScanOptions::prefix(keys::ARTICLES)).await?.len())
}

/// Articles added since `since_ms`, with their annotation counts, most
/// recent first.
pub async fn list_recent_articles(
    tx: &dyn ReadTx,
    since_ms: Option<i64>,
    state_filter: Option<StateFilter>,
) -> Result<Vec<Article>> {
    let since_ms = since_ms.unwrap_or(0);
    let state_filter = state_filter.unwrap_or_default();

    let mut articles: Vec<Article> = list_articles(tx)
        .await?
        .into_iter()
        .filter(|a| a.time_added >= since_ms)
        .filter(|a| state_filter.matches(a))
        .collect();

    let mut per_article: HashMap<String, usize> = HashMap::new();
    for annotation in list_annotations(tx).await? {
        *per_article.entry(annotation.article_id).or_default() += 1;
    }
    for article in &mut articles {
        article.annotation_count = Some(per_article.get(&article.id).copied().unwrap_or(0));
    }

    sort_articles(&mut articles, ArticleSortPosition::Recency);
    Ok(articles)
}

pub async fn list_favorite_articles(tx: &dyn ReadTx) -> Result<Vec<Article>> {
    let mut articles: Vec<Article> = list_articles(tx)
        .await?
        .into_iter()
        .filter(|a| a.is_favorite)
        .collect();
    sort_articles(&mut articles, ArticleSortPosition::Favorites);
    Ok(articles)
}

pub async fn list_queue_articles(tx: &dyn ReadTx) -> Result<Vec<Article>> {
    let mut articles: Vec<Article> = list_articles(tx)
        .await?
        .into_iter()
        .filter(|a| a.is_queued)
        .collect();
    sort_articles(&mut articles, ArticleSortPosition::Queue);
    Ok(articles)
}

pub async fn list_topic_articles(tx: &dyn ReadTx, topic_id: &str) -> Result<Vec<Article>> {
    if topic_id.is_empty() {
        return Ok(Vec::new());
    }
    let mut articles: Vec<Article> =
        scan_as(tx, &ScanOptions::index(ARTICLES_BY_TOPIC, topic_id)).await?;
    sort_articles(&mut articles, ArticleSortPosition::Topic);
    Ok(articles)
}

pub async fn list_domain_articles(tx: &dyn ReadTx, domain: &str) -> Result<Vec<Article>> {
    let mut articles: Vec<Article> = list_articles(tx)
        .await?
        .into_iter()
        .filter(|a| domain_of(&a.url).as_deref() == Some(domain))
        .collect();
    sort_articles(&mut articles, ArticleSortPosition::Domain);
    Ok(articles)
}

pub async fn get_topic_articles_count(tx: &dyn ReadTx, topic_id: &str) -> Result<usize> {
    Ok(list_topic_articles(tx, topic_id).await?.len())
}

/// Recent articles grouped by when they were added. The current and the
/// previous week get their own groups, older articles are grouped by month.
/// With `aggregate_years` the groups are nested under their year, newest
/// first, and articles without a known add date land in `Imported`.
pub async fn group_recent_articles(
    tx: &dyn ReadTx,
    since_ms: Option<i64>,
    state_filter: Option<StateFilter>,
    aggregate_years: bool,
) -> Result<BTreeMap<String, ArticleBucket>> {
    let articles = list_recent_articles(tx, since_ms, state_filter).await?;
    let this_week = week_start(tx.now_ms());
    let last_week = this_week - Duration::weeks(1);

    let mut buckets: BTreeMap<String, ArticleBucket> = BTreeMap::new();
    for article in articles {
        let added = DateTime::<Utc>::from_timestamp_millis(article.time_added).unwrap_or_default();
        let day = added.date_naive();
        let (key, title) = if day >= this_week {
            (this_week.format("%G-W%V").to_string(), "This week".to_string())
        } else if day >= last_week {
            (last_week.format("%G-W%V").to_string(), "Last week".to_string())
        } else {
            (added.format("%Y-%m").to_string(), added.format("%B").to_string())
        };
        buckets
            .entry(key.clone())
            .or_insert_with(|| ArticleBucket::leaf(key, title))
            .articles
            .get_or_insert_with(Vec::new)
            .push(article);
    }

    if !aggregate_years {
        return Ok(buckets);
    }

    let mut years: BTreeMap<String, ArticleBucket> = BTreeMap::new();
    // Week keys sort after month keys of the same year, so this is newest first.
    for (key, bucket) in buckets.into_iter().rev() {
        let year = key.split('-').next().unwrap_or_default().to_string();
        years
            .entry(year.clone())
            .or_insert_with(|| ArticleBucket {
                key: year.clone(),
                title: year,
                articles: None,
                children: Some(Vec::new()),
            })
            .children
            .get_or_insert_with(Vec::new)
            .push(bucket);
    }
    if let Some(imported) = years.get_mut("1970") {
        let articles = imported
            .children
            .take()
            .unwrap_or_default()
            .into_iter()
            .flat_map(|month| month.articles.unwrap_or_default())
            .collect();
        imported.title = "Imported".to_string();
        imported.articles = Some(articles);
    }
    Ok(years)
}

/// Monday of the UTC week containing `now_ms`.
fn week_start(now_ms: i64) -> NaiveDate {
    let now = DateTime::<Utc>::from_timestamp_millis(now_ms).unwrap_or_default();
    let days_into_week = i64::from(now.weekday().num_days_from_monday());
    now.date_naive() - Duration::days(days_into_week)
}

/// Weekly reading summary over the current week and the three before it.
pub async fn get_reading_progress(tx: &dyn ReadTx) -> Result<ReadingProgress> {
    let since = reading_window_start(tx.now_ms());
    let recent = list_recent_articles(tx, Some(since), None).await?;
    let recent_ids: HashSet<&str> = recent.iter().map(|a| a.id.as_str()).collect();

    let annotation_count = list_annotations(tx)
        .await?
        .iter()
        .filter(|a| recent_ids.contains(a.article_id.as_str()))
        .count();
    let queue_count = list_articles(tx).await?.iter().filter(|a| a.is_queued).count();

    Ok(ReadingProgress {
        article_count: recent.len(),
        completed_count: recent
            .iter()
            .filter(|a| a.reading_progress >= READING_PROGRESS_FULL)
            .count(),
        queue_count,
        annotation_count,
    })
}

/// Monday 00:00 UTC of the week three weeks before the one containing `now_ms`.
fn reading_window_start(now_ms: i64) -> i64 {
    let window_start = week_start(now_ms) - Duration::weeks(3);
    window_start
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc().timestamp_millis())
        .unwrap_or(0)
}

/* topics */

pub async fn get_topic(tx: &dyn ReadTx, id: &str) -> Result<Option<Topic>> {
    get_as(tx, &keys::topic(id)).await
}

pub async fn list_topics(tx: &dyn ReadTx) -> Result<Vec<Topic>> {
    scan_as(tx, &ScanOptions::prefix(keys::TOPICS)).await
}

/* annotations */

pub async fn get_annotation(tx: &dyn ReadTx, id: &str) -> Result<Option<Annotation>> {
    get_as(tx, &keys::annotation(id)).await
}

pub async fn list_annotations(tx: &dyn ReadTx) -> Result<Vec<Annotation>> {
    scan_as(tx, &ScanOptions::prefix(keys::ANNOTATIONS)).await
}

pub async fn list_article_annotations(tx: &dyn ReadTx, article_id: &str) -> Result<Vec<Annotation>> {
    scan_as(tx, &ScanOptions::index(ANNOTATIONS_PER_ARTICLE, article_id)).await
}

pub async fn list_annotations_with_articles(tx: &dyn ReadTx) -> Result<Vec<AnnotationWithArticle>> {
    let articles: HashMap<String, Article> = list_articles(tx)
        .await?
        .into_iter()
        .map(|a| (a.id.clone(), a))
        .collect();

    Ok(list_annotations(tx)
        .await?
        .into_iter()
        .map(|annotation| AnnotationWithArticle {
            article: articles.get(&annotation.article_id).cloned(),
            annotation,
        })
        .collect())
}

/// Annotations on any article of the topic.
pub async fn list_topic_annotations(tx: &dyn ReadTx, topic_id: &str) -> Result<Vec<Annotation>> {
    let article_ids: HashSet<String> = list_topic_articles(tx, topic_id)
        .await?
        .into_iter()
        .map(|a| a.id)
        .collect();
    Ok(list_annotations(tx)
        .await?
        .into_iter()
        .filter(|a| article_ids.contains(&a.article_id))
        .collect())
}

pub async fn get_annotations_count(tx: &dyn ReadTx) -> Result<usize> {
    Ok(tx.scan(&ScanOptions::prefix(keys::ANNOTATIONS)).await?.len())
}

/* settings & user */

pub async fn get_settings(tx: &dyn ReadTx) -> Result<Settings> {
    Ok(get_as(tx, keys::SETTINGS).await?.unwrap_or_default())
}

pub async fn get_user_info(tx: &dyn ReadTx) -> Result<Option<UserInfo>> {
    get_as(tx, keys::USER_INFO).await
}

/* feed subscriptions */

pub async fn get_subscription(tx: &dyn ReadTx, id: &str) -> Result<Option<FeedSubscription>> {
    get_as(tx, &keys::subscription(id)).await
}

pub async fn list_subscriptions(tx: &dyn ReadTx) -> Result<Vec<FeedSubscription>> {
    scan_as(tx, &ScanOptions::prefix(keys::SUBSCRIPTIONS)).await
}

pub async fn get_domain_subscriptions(tx: &dyn ReadTx, domain: &str) -> Result<Vec<FeedSubscription>> {
    Ok(list_subscriptions(tx)
        .await?
        .into_iter()
        .filter(|s| s.domain == domain)
        .collect())
}

/* sync bookkeeping */

pub async fn get_sync_state(tx: &dyn ReadTx, provider: SyncProvider) -> Result<Option<SyncState>> {
    get_as(tx, &keys::sync_state(provider.as_str())).await
}

pub async fn list_sync_states(tx: &dyn ReadTx) -> Result<Vec<SyncState>> {
    scan_as(tx, &ScanOptions::prefix(keys::SYNC_STATE)).await
}

/// Deletes of `entity` records that still have to reach the remote service.
pub async fn list_tombstones(tx: &dyn ReadTx, entity: &str) -> Result<Vec<Tombstone>> {
    scan_as(tx, &ScanOptions::prefix(format!("{}{}/", keys::TOMBSTONES, entity))).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::KvStore;
    use crate::store::transaction::{ManualClock, ReadTransaction};
    use serde_json::json;

    // Wednesday 2024-05-15 12:00 UTC
    const NOW: i64 = 1_715_774_400_000;
    const DAY: i64 = 86_400_000;

    async fn tx_with(entries: Vec<(&str, serde_json::Value)>) -> ReadTransaction {
        let store = KvStore::open_in_memory().await.unwrap();
        let writes = entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), Some(v)))
            .collect();
        store.apply("local", writes).await.unwrap();
        ReadTransaction::new(store, "local", Arc::new(ManualClock::new(NOW)))
    }

    #[tokio::test]
    async fn recent_articles_are_filtered_counted_and_sorted() {
        let tx = tx_with(vec![
            ("articles/old", json!({ "id": "old", "url": "u1", "time_added": 1_000 })),
            ("articles/a", json!({ "id": "a", "url": "u2", "time_added": 5_000, "reading_progress": 1.0 })),
            ("articles/b", json!({ "id": "b", "url": "u3", "time_added": 4_000, "recency_sort_position": 9_000.0 })),
            ("annotations/x", json!({ "id": "x", "article_id": "b", "created_at": 1 })),
            ("annotations/y", json!({ "id": "y", "article_id": "b", "created_at": 2 })),
        ])
        .await;

        let recent = list_recent_articles(&tx, Some(2_000), None).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(recent[0].annotation_count, Some(2));
        assert_eq!(recent[1].annotation_count, Some(0));

        let unread = list_recent_articles(&tx, None, Some(StateFilter::Unread)).await.unwrap();
        let ids: Vec<&str> = unread.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "old"]);
    }

    #[tokio::test]
    async fn article_annotations_use_the_article_index() {
        let tx = tx_with(vec![
            ("annotations/1", json!({ "id": "1", "article_id": "art1", "created_at": 1 })),
            ("annotations/2", json!({ "id": "2", "article_id": "art2", "created_at": 1 })),
            ("annotations/3", json!({ "id": "3", "article_id": "art1", "created_at": 1 })),
        ])
        .await;

        let ids: Vec<String> = list_article_annotations(&tx, "art1")
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(get_annotations_count(&tx).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn reading_progress_covers_the_last_four_weeks() {
        let tx = tx_with(vec![
            ("articles/new", json!({ "id": "new", "url": "u1", "time_added": NOW - DAY, "reading_progress": 0.97 })),
            ("articles/mid", json!({ "id": "mid", "url": "u2", "time_added": NOW - 20 * DAY, "is_queued": true })),
            ("articles/old", json!({ "id": "old", "url": "u3", "time_added": NOW - 40 * DAY, "is_queued": true })),
            ("annotations/1", json!({ "id": "1", "article_id": "new", "created_at": 1 })),
            ("annotations/2", json!({ "id": "2", "article_id": "old", "created_at": 1 })),
        ])
        .await;

        let progress = get_reading_progress(&tx).await.unwrap();
        assert_eq!(
            progress,
            ReadingProgress {
                article_count: 2,
                completed_count: 1,
                queue_count: 2,
                annotation_count: 1,
            }
        );
    }

    #[tokio::test]
    async fn missing_settings_read_as_empty() {
        let tx = tx_with(vec![]).await;
        assert_eq!(get_settings(&tx).await.unwrap(), Settings::default());
        assert!(get_user_info(&tx).await.unwrap().is_none());
        assert!(get_sync_state(&tx, SyncProvider::Hypothesis).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn domain_and_topic_views() {
        let tx = tx_with(vec![
            ("articles/a", json!({ "id": "a", "url": "https://www.example.com/a", "time_added": 2_000, "topic_id": "t1" })),
            ("articles/b", json!({ "id": "b", "url": "https://example.com/b", "time_added": 3_000, "domain_sort_position": 1_500.0 })),
            ("articles/c", json!({ "id": "c", "url": "https://other.org/c", "time_added": 4_000, "topic_id": "t1" })),
            ("annotations/1", json!({ "id": "1", "article_id": "a", "created_at": 1 })),
            ("annotations/2", json!({ "id": "2", "article_id": "b", "created_at": 1 })),
        ])
        .await;

        let domain: Vec<String> = list_domain_articles(&tx, "example.com")
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(domain, vec!["a", "b"]);

        assert_eq!(get_topic_articles_count(&tx, "t1").await.unwrap(), 2);
        assert_eq!(get_topic_articles_count(&tx, "").await.unwrap(), 0);
        let annotations = list_topic_annotations(&tx, "t1").await.unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].id, "1");
    }

    #[tokio::test]
    async fn subscriptions_filter_by_domain() {
        let feed = |id: &str, domain: &str| json!({ "id": id, "rss_url": id, "domain": domain, "is_subscribed": true });
        let tx = tx_with(vec![
            ("subscription/f1", feed("f1", "example.com")),
            ("subscription/f2", feed("f2", "other.org")),
        ])
        .await;

        assert_eq!(list_subscriptions(&tx).await.unwrap().len(), 2);
        let domain = get_domain_subscriptions(&tx, "other.org").await.unwrap();
        assert_eq!(domain.len(), 1);
        assert_eq!(domain[0].id, "f2");
        assert!(get_subscription(&tx, "f1").await.unwrap().unwrap().is_subscribed);
        assert!(get_subscription(&tx, "f3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_articles_group_into_weeks_months_and_years() {
        let tx = tx_with(vec![
            ("articles/today", json!({ "id": "today", "url": "u1", "time_added": NOW })),
            ("articles/last", json!({ "id": "last", "url": "u2", "time_added": NOW - 7 * DAY })),
            // 2024-03-10
            ("articles/march", json!({ "id": "march", "url": "u3", "time_added": 1_710_072_000_000i64 })),
            // 2023-11-02
            ("articles/prev", json!({ "id": "prev", "url": "u4", "time_added": 1_698_926_400_000i64 })),
            ("articles/imported", json!({ "id": "imported", "url": "u5", "time_added": 0 })),
        ])
        .await;

        let months = group_recent_articles(&tx, None, None, false).await.unwrap();
        let keys: Vec<&str> = months.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["1970-01", "2023-11", "2024-03", "2024-W19", "2024-W20"]);
        assert_eq!(months["2024-W20"].title, "This week");
        assert_eq!(months["2024-W19"].title, "Last week");
        assert_eq!(months["2024-03"].title, "March");

        let years = group_recent_articles(&tx, None, None, true).await.unwrap();
        let children: Vec<&str> = years["2024"]
            .children
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.key.as_str())
            .collect();
        assert_eq!(children, vec!["2024-W20", "2024-W19", "2024-03"]);
        assert_eq!(years["1970"].title, "Imported");
        assert_eq!(years["1970"].articles.as_ref().unwrap()[0].id, "imported");
        assert!(years["1970"].children.is_none());
    }
}
