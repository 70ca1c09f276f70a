use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::models::{
    keys, Annotation, Article, ArticleSortPosition, FeedSubscription, RecordUpdate, Settings,
    SyncProvider, SyncState, Tombstone, Topic, UserInfo, READING_PROGRESS_FULL,
};

use super::accessors;
use super::transaction::{get_as, ReadTx, WriteTransaction};

/// Gap used when an article is moved past the first or last neighbour.
const POSITION_STEP: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ImportArticles {
    pub articles: Vec<Article>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SetFavorite {
    pub id: String,
    pub is_favorite: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingProgressUpdate {
    pub article_id: String,
    pub reading_progress: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveArticle {
    pub article_id: String,
    #[serde(default)]
    pub article_id_before_new_position: Option<String>,
    #[serde(default)]
    pub article_id_after_new_position: Option<String>,
    pub sort_position: ArticleSortPosition,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveToQueue {
    pub is_queued: bool,
    #[serde(flatten)]
    pub position: MoveArticle,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveToLibrary {
    /// An article shown to the user but not saved yet.
    pub temporary_article: Article,
    #[serde(default)]
    pub article_id_before_new_position: Option<String>,
    #[serde(default)]
    pub article_id_after_new_position: Option<String>,
    pub sort_position: ArticleSortPosition,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClearTombstones {
    pub entity: String,
    pub ids: Vec<String>,
}

/// Merge `update` into the stored record under `key`. The merged value
/// must still parse as `T`, otherwise nothing is written.
async fn update_record<T: DeserializeOwned>(
    tx: &mut WriteTransaction,
    method: &str,
    key: &str,
    update: &RecordUpdate,
) -> Result<T> {
    let mut record = tx
        .get(key)
        .await?
        .ok_or_else(|| AppError::invalid_argument(method, format!("no record {key}")))?;
    update.apply_to(&mut record);

    let parsed = serde_json::from_value(record.clone())
        .map_err(|e| AppError::invalid_argument(method, e))?;
    tx.put(key, record);
    Ok(parsed)
}

fn tombstone(tx: &mut WriteTransaction, entity: &str, id: &str, remote_id: &str) -> Result<()> {
    let marker = Tombstone {
        entity: entity.to_string(),
        id: id.to_string(),
        remote_id: remote_id.to_string(),
        deleted_at: tx.now_ms(),
    };
    tx.put_record(keys::tombstone(entity, id), &marker)
}

/* articles */

/// Returns whether the article was inserted. Existing articles are left
/// untouched, so applying the same download twice is harmless.
pub async fn put_article_if_not_exists(tx: &mut WriteTransaction, mut article: Article) -> Result<bool> {
    let key = keys::article(&article.id);
    if tx.has(&key).await? {
        return Ok(false);
    }

    let position = article.time_added as f64;
    article.recency_sort_position = Some(position);
    article.topic_sort_position = Some(position);
    article.annotation_count = None;
    tx.put_record(key, &article)?;
    Ok(true)
}

pub async fn import_articles(tx: &mut WriteTransaction, args: ImportArticles) -> Result<usize> {
    let mut inserted = 0;
    for article in args.articles {
        if put_article_if_not_exists(tx, article).await? {
            inserted += 1;
        }
    }
    Ok(inserted)
}

pub async fn update_article(tx: &mut WriteTransaction, update: RecordUpdate) -> Result<()> {
    let now = tx.now_ms();
    update_article_raw(tx, update.set("time_updated", now)).await
}

/// Field update without touching `time_updated`. Used when applying remote
/// state that must not trigger another upload.
pub async fn update_article_raw(tx: &mut WriteTransaction, update: RecordUpdate) -> Result<()> {
    let key = keys::article(&update.id);
    update_record::<Article>(tx, "updateArticleRaw", &key, &update).await?;
    Ok(())
}

pub async fn article_set_favorite(tx: &mut WriteTransaction, args: SetFavorite) -> Result<()> {
    let position = if args.is_favorite {
        Value::from(tx.now_ms())
    } else {
        Value::Null
    };
    let update = RecordUpdate::new(args.id)
        .set("is_favorite", args.is_favorite)
        .set(ArticleSortPosition::Favorites.field(), position);
    update_article(tx, update).await
}

pub async fn article_track_opened(tx: &mut WriteTransaction, article_id: String) -> Result<()> {
    let now = tx.now_ms();
    let update = RecordUpdate::new(article_id)
        .set("time_opened", now)
        .set(ArticleSortPosition::Recency.field(), now)
        .set(ArticleSortPosition::Topic.field(), now);
    update_article(tx, update).await
}

/// Progress never moves backwards; completing an article drops it from the queue.
pub async fn update_article_reading_progress(
    tx: &mut WriteTransaction,
    args: ReadingProgressUpdate,
) -> Result<()> {
    let Some(article) = accessors::get_article(&*tx, &args.article_id).await? else {
        return Err(AppError::invalid_argument(
            "updateArticleReadingProgress",
            format!("no article {}", args.article_id),
        ));
    };

    let progress = args.reading_progress.clamp(0.0, 1.0).max(article.reading_progress);
    let now = tx.now_ms();
    let mut update = RecordUpdate::new(args.article_id)
        .set("reading_progress", progress)
        .set(ArticleSortPosition::Recency.field(), now)
        .set(ArticleSortPosition::Topic.field(), now);
    if progress >= READING_PROGRESS_FULL {
        update = update.set("is_queued", false);
    }
    update_article(tx, update).await
}

/// Place an article between two neighbours of a list ordered by
/// descending position. Missing neighbours are a no-op.
pub async fn move_article_position(tx: &mut WriteTransaction, args: MoveArticle) -> Result<()> {
    let active = accessors::get_article(&*tx, &args.article_id).await?;
    let before = match &args.article_id_before_new_position {
        Some(id) => accessors::get_article(&*tx, id).await?,
        None => None,
    };
    let after = match &args.article_id_after_new_position {
        Some(id) => accessors::get_article(&*tx, id).await?,
        None => None,
    };

    let position = args.sort_position;
    let (upper, lower) = match (active, before, after) {
        (None, _, _) | (_, None, None) => return Ok(()),
        (Some(_), Some(b), Some(a)) => (b.sort_position(position), a.sort_position(position)),
        (Some(_), Some(b), None) => {
            let upper = b.sort_position(position);
            (upper, upper - POSITION_STEP)
        }
        (Some(_), None, Some(a)) => {
            let lower = a.sort_position(position);
            (lower + POSITION_STEP, lower)
        }
    };

    let update = RecordUpdate::new(args.article_id).set(position.field(), (upper + lower) / 2.0);
    update_article(tx, update).await
}

/// Queue or dequeue an article and move it in one write, so list views
/// never observe the intermediate order.
pub async fn article_add_move_to_queue(tx: &mut WriteTransaction, args: MoveToQueue) -> Result<()> {
    let article_id = args.position.article_id.clone();
    let mut update = RecordUpdate::new(article_id.clone()).set("is_queued", args.is_queued);
    if args.is_queued {
        update = update.set(ArticleSortPosition::Queue.field(), tx.now_ms());
        if let Some(article) = accessors::get_article(&*tx, &article_id).await? {
            if article.is_completed() {
                update = update.set("reading_progress", 0.0);
            }
        }
    }

    update_article(tx, update).await?;
    move_article_position(tx, args.position).await
}

/// Save an article the user has only been previewing, dated now, and place
/// it between the given neighbours.
pub async fn article_add_move_to_library(tx: &mut WriteTransaction, args: MoveToLibrary) -> Result<()> {
    let mut article = args.temporary_article;
    article.time_added = tx.now_ms();
    let position = MoveArticle {
        article_id: article.id.clone(),
        article_id_before_new_position: args.article_id_before_new_position,
        article_id_after_new_position: args.article_id_after_new_position,
        sort_position: args.sort_position,
    };
    put_article_if_not_exists(tx, article).await?;
    move_article_position(tx, position).await
}

/// Removes the article and its annotations. Records already known to a
/// remote service leave tombstones behind.
pub async fn delete_article(tx: &mut WriteTransaction, article_id: String) -> Result<bool> {
    for annotation in accessors::list_article_annotations(&*tx, &article_id).await? {
        delete_annotation(tx, annotation.id).await?;
    }

    let key = keys::article(&article_id);
    if let Some(article) = get_as::<Article>(&*tx, &key).await? {
        if let Some(pocket_id) = &article.pocket_id {
            tombstone(tx, "articles", &article_id, pocket_id)?;
        }
    }
    tx.delete(&key).await
}

pub async fn put_topic(tx: &mut WriteTransaction, topic: Topic) -> Result<()> {
    tx.put_record(keys::topic(&topic.id), &topic)
}

/* annotations */

pub async fn put_annotation(tx: &mut WriteTransaction, mut annotation: Annotation) -> Result<()> {
    if annotation.updated_at == 0 {
        annotation.updated_at = annotation.created_at;
    }
    tx.put_record(keys::annotation(&annotation.id), &annotation)
}

pub async fn update_annotation(tx: &mut WriteTransaction, update: RecordUpdate) -> Result<()> {
    let now = tx.now_ms();
    update_annotation_raw(tx, update.set("updated_at", now)).await
}

pub async fn update_annotation_raw(tx: &mut WriteTransaction, update: RecordUpdate) -> Result<()> {
    let key = keys::annotation(&update.id);
    update_record::<Annotation>(tx, "updateAnnotationRaw", &key, &update).await?;
    Ok(())
}

/// Upsert downloaded annotations. A remote annotation matching a local one
/// by `h_id` keeps the local id; otherwise records are matched by id.
/// Matched records only take the fields the remote service knows about, so
/// local-only fields such as the AI flags survive.
pub async fn merge_remote_annotations(
    tx: &mut WriteTransaction,
    annotations: Vec<Annotation>,
) -> Result<usize> {
    let existing = accessors::list_annotations(&*tx).await?;
    let mut merged = 0;

    for annotation in annotations {
        let local = match &annotation.h_id {
            Some(h_id) => existing.iter().find(|a| a.h_id.as_ref() == Some(h_id)),
            None => existing.iter().find(|a| a.id == annotation.id),
        };
        match local {
            Some(local) => {
                if local.modified_at() > annotation.modified_at() {
                    tracing::warn!(
                        "{}",
                        AppError::ConflictIgnored {
                            key: keys::annotation(&local.id)
                        }
                    );
                }
                let update = remote_fields(&local.id, annotation);
                update_record::<Annotation>(tx, "mergeRemoteAnnotations", &keys::annotation(&local.id), &update)
                    .await?;
            }
            None => put_annotation(tx, annotation).await?,
        }
        merged += 1;
    }
    Ok(merged)
}

fn remote_fields(local_id: &str, remote: Annotation) -> RecordUpdate {
    let updated_at = if remote.updated_at == 0 {
        remote.created_at
    } else {
        remote.updated_at
    };
    let mut update = RecordUpdate::new(local_id)
        .set("text", remote.text)
        .set("tags", remote.tags)
        .set("quote_text", remote.quote_text)
        .set("quote_html_selector", remote.quote_html_selector)
        .set("created_at", remote.created_at)
        .set("updated_at", updated_at);
    if let Some(h_id) = remote.h_id {
        update = update.set("h_id", h_id);
    }
    update
}

pub async fn delete_annotation(tx: &mut WriteTransaction, annotation_id: String) -> Result<bool> {
    let key = keys::annotation(&annotation_id);
    if let Some(annotation) = get_as::<Annotation>(&*tx, &key).await? {
        if let Some(h_id) = &annotation.h_id {
            tombstone(tx, "annotations", &annotation_id, h_id)?;
        }
    }
    tx.delete(&key).await
}

/* feed subscriptions */

pub async fn put_subscription(tx: &mut WriteTransaction, subscription: FeedSubscription) -> Result<()> {
    tx.put_record(keys::subscription(&subscription.id), &subscription)
}

pub async fn update_subscription(tx: &mut WriteTransaction, update: RecordUpdate) -> Result<()> {
    let key = keys::subscription(&update.id);
    update_record::<FeedSubscription>(tx, "updateSubscription", &key, &update).await?;
    Ok(())
}

/// Follow or unfollow a feed. New items are looked for from now on either
/// way. Unknown subscriptions are ignored.
pub async fn toggle_subscription_active(tx: &mut WriteTransaction, subscription_id: String) -> Result<bool> {
    let key = keys::subscription(&subscription_id);
    let Some(subscription) = get_as::<FeedSubscription>(&*tx, &key).await? else {
        return Ok(false);
    };
    let update = RecordUpdate::new(subscription_id)
        .set("is_subscribed", !subscription.is_subscribed)
        .set("last_fetched", tx.now_ms());
    update_record::<FeedSubscription>(tx, "toggleSubscriptionActive", &key, &update).await?;
    Ok(true)
}

pub async fn delete_subscription(tx: &mut WriteTransaction, subscription_id: String) -> Result<bool> {
    tx.delete(&keys::subscription(&subscription_id)).await
}

/* bulk */

/// Write entries verbatim. Overwrites per key, so re-running an import is safe.
pub async fn import_entries(tx: &mut WriteTransaction, entries: Vec<(String, Value)>) -> Result<usize> {
    let count = entries.len();
    for (key, value) in entries {
        tx.put(key, value);
    }
    Ok(count)
}

/* settings & user */

/// Shallow merge of `diff` into the object stored under `key`.
async fn merge_object<T: DeserializeOwned>(
    tx: &mut WriteTransaction,
    method: &str,
    key: &str,
    diff: Map<String, Value>,
) -> Result<()> {
    let mut saved = match tx.get(key).await? {
        Some(Value::Object(map)) => map,
        Some(_) | None => Map::new(),
    };
    saved.extend(diff);
    let merged = Value::Object(saved);
    serde_json::from_value::<T>(merged.clone()).map_err(|e| AppError::invalid_argument(method, e))?;
    tx.put(key, merged);
    Ok(())
}

pub async fn update_settings(tx: &mut WriteTransaction, diff: Map<String, Value>) -> Result<()> {
    merge_object::<Settings>(tx, "updateSettings", keys::SETTINGS, diff).await
}

pub async fn update_user_info(tx: &mut WriteTransaction, diff: Map<String, Value>) -> Result<()> {
    merge_object::<UserInfo>(tx, "updateUserInfo", keys::USER_INFO, diff).await
}

/* sync state */

pub async fn put_sync_state(tx: &mut WriteTransaction, state: SyncState) -> Result<()> {
    tx.put_record(keys::sync_state(&state.id), &state)
}

/// Watermarks in the update only ever move forward.
pub async fn update_sync_state(tx: &mut WriteTransaction, mut update: RecordUpdate) -> Result<()> {
    let key = keys::sync_state(&update.id);
    let current: SyncState = get_as(&*tx, &key).await?.ok_or_else(|| {
        AppError::invalid_argument("updateSyncState", format!("no sync state {}", update.id))
    })?;

    for (field, stored) in [("last_download", current.last_download), ("last_upload", current.last_upload)] {
        let proposed = update.fields.get(field).and_then(Value::as_i64);
        if let (Some(stored), Some(proposed)) = (stored, proposed) {
            if proposed < stored {
                update.fields.insert(field.to_string(), Value::from(stored));
            }
        }
        if update.fields.get(field) == Some(&Value::Null) && stored.is_some() {
            update.fields.remove(field);
        }
    }

    update_record::<SyncState>(tx, "updateSyncState", &key, &update).await?;
    Ok(())
}

pub async fn delete_sync_state(tx: &mut WriteTransaction, provider: SyncProvider) -> Result<bool> {
    tx.delete(&keys::sync_state(provider.as_str())).await
}

pub async fn clear_tombstones(tx: &mut WriteTransaction, args: ClearTombstones) -> Result<usize> {
    let mut cleared = 0;
    for id in &args.ids {
        if tx.delete(&keys::tombstone(&args.entity, id)).await? {
            cleared += 1;
        }
    }
    Ok(cleared)
}
