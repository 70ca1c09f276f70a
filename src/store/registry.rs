//! Closed set of named operations runnable against any backend.
//!
//! Queries take positional arguments (`args` is a JSON array), mutations a
//! single JSON value. Both resolve the method name before looking at the
//! arguments, so a typo is reported as an unknown method rather than as a
//! malformed argument.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::models::{
    Annotation, Article, FeedSubscription, RecordUpdate, SyncProvider, SyncState, Topic,
};

use super::accessors::{self, StateFilter};
use super::mutators::{
    self, ClearTombstones, ImportArticles, MoveArticle, MoveToLibrary, MoveToQueue,
    ReadingProgressUpdate, SetFavorite,
};
use super::transaction::{ReadTx, WriteTransaction};

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    GetArticle(String),
    ListArticles,
    GetArticlesCount,
    ListRecentArticles {
        since_ms: Option<i64>,
        state_filter: Option<StateFilter>,
    },
    GroupRecentArticles {
        since_ms: Option<i64>,
        state_filter: Option<StateFilter>,
        aggregate_years: Option<bool>,
    },
    ListFavoriteArticles,
    ListQueueArticles,
    ListDomainArticles(String),
    ListTopicArticles(String),
    GetTopicArticlesCount(String),
    GetTopic(String),
    ListTopics,
    GetAnnotation(String),
    ListAnnotations,
    ListArticleAnnotations(String),
    ListAnnotationsWithArticles,
    ListTopicAnnotations(String),
    GetAnnotationsCount,
    GetReadingProgress,
    GetSettings,
    GetUserInfo,
    GetSubscription(String),
    ListSubscriptions,
    GetDomainSubscriptions(String),
    GetSyncState(SyncProvider),
    ListSyncStates,
    ListTombstones(String),
}

impl Query {
    pub const NAMES: &'static [&'static str] = &[
        "getArticle",
        "listArticles",
        "getArticlesCount",
        "listRecentArticles",
        "groupRecentArticles",
        "listFavoriteArticles",
        "listQueueArticles",
        "listDomainArticles",
        "listTopicArticles",
        "getTopicArticlesCount",
        "getTopic",
        "listTopics",
        "getAnnotation",
        "listAnnotations",
        "listArticleAnnotations",
        "listAnnotationsWithArticles",
        "listTopicAnnotations",
        "getAnnotationsCount",
        "getReadingProgress",
        "getSettings",
        "getUserInfo",
        "getSubscription",
        "listSubscriptions",
        "getDomainSubscriptions",
        "getSyncState",
        "listSyncStates",
        "listTombstones",
    ];

    pub fn parse(method: &str, args: Value) -> Result<Self> {
        let args = Positional::new(method, args);
        let query = match method {
            "getArticle" => Self::GetArticle(args.at(0)?),
            "listArticles" => Self::ListArticles,
            "getArticlesCount" => Self::GetArticlesCount,
            "listRecentArticles" => Self::ListRecentArticles {
                since_ms: args.at(0)?,
                state_filter: args.at(1)?,
            },
            "groupRecentArticles" => Self::GroupRecentArticles {
                since_ms: args.at(0)?,
                state_filter: args.at(1)?,
                aggregate_years: args.at(2)?,
            },
            "listFavoriteArticles" => Self::ListFavoriteArticles,
            "listQueueArticles" => Self::ListQueueArticles,
            "listDomainArticles" => Self::ListDomainArticles(args.at(0)?),
            "listTopicArticles" => Self::ListTopicArticles(args.at(0)?),
            "getTopicArticlesCount" => Self::GetTopicArticlesCount(args.at(0)?),
            "getTopic" => Self::GetTopic(args.at(0)?),
            "listTopics" => Self::ListTopics,
            "getAnnotation" => Self::GetAnnotation(args.at(0)?),
            "listAnnotations" => Self::ListAnnotations,
            "listArticleAnnotations" => Self::ListArticleAnnotations(args.at(0)?),
            "listAnnotationsWithArticles" => Self::ListAnnotationsWithArticles,
            "listTopicAnnotations" => Self::ListTopicAnnotations(args.at(0)?),
            "getAnnotationsCount" => Self::GetAnnotationsCount,
            "getReadingProgress" => Self::GetReadingProgress,
            "getSettings" => Self::GetSettings,
            "getUserInfo" => Self::GetUserInfo,
            "getSubscription" => Self::GetSubscription(args.at(0)?),
            "listSubscriptions" => Self::ListSubscriptions,
            "getDomainSubscriptions" => Self::GetDomainSubscriptions(args.at(0)?),
            "getSyncState" => Self::GetSyncState(args.at(0)?),
            "listSyncStates" => Self::ListSyncStates,
            "listTombstones" => Self::ListTombstones(args.at(0)?),
            other => return Err(AppError::UnknownMethod(other.to_string())),
        };
        Ok(query)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GetArticle(_) => "getArticle",
            Self::ListArticles => "listArticles",
            Self::GetArticlesCount => "getArticlesCount",
            Self::ListRecentArticles { .. } => "listRecentArticles",
            Self::GroupRecentArticles { .. } => "groupRecentArticles",
            Self::ListFavoriteArticles => "listFavoriteArticles",
            Self::ListQueueArticles => "listQueueArticles",
            Self::ListDomainArticles(_) => "listDomainArticles",
            Self::ListTopicArticles(_) => "listTopicArticles",
            Self::GetTopicArticlesCount(_) => "getTopicArticlesCount",
            Self::GetTopic(_) => "getTopic",
            Self::ListTopics => "listTopics",
            Self::GetAnnotation(_) => "getAnnotation",
            Self::ListAnnotations => "listAnnotations",
            Self::ListArticleAnnotations(_) => "listArticleAnnotations",
            Self::ListAnnotationsWithArticles => "listAnnotationsWithArticles",
            Self::ListTopicAnnotations(_) => "listTopicAnnotations",
            Self::GetAnnotationsCount => "getAnnotationsCount",
            Self::GetReadingProgress => "getReadingProgress",
            Self::GetSettings => "getSettings",
            Self::GetUserInfo => "getUserInfo",
            Self::GetSubscription(_) => "getSubscription",
            Self::ListSubscriptions => "listSubscriptions",
            Self::GetDomainSubscriptions(_) => "getDomainSubscriptions",
            Self::GetSyncState(_) => "getSyncState",
            Self::ListSyncStates => "listSyncStates",
            Self::ListTombstones(_) => "listTombstones",
        }
    }

    pub async fn run(&self, tx: &dyn ReadTx) -> Result<Value> {
        let result = match self {
            Self::GetArticle(id) => encode(accessors::get_article(tx, id).await?)?,
            Self::ListArticles => encode(accessors::list_articles(tx).await?)?,
            Self::GetArticlesCount => encode(accessors::get_articles_count(tx).await?)?,
            Self::ListRecentArticles {
                since_ms,
                state_filter,
            } => encode(accessors::list_recent_articles(tx, *since_ms, *state_filter).await?)?,
            Self::GroupRecentArticles {
                since_ms,
                state_filter,
                aggregate_years,
            } => encode(
                accessors::group_recent_articles(
                    tx,
                    *since_ms,
                    *state_filter,
                    aggregate_years.unwrap_or(true),
                )
                .await?,
            )?,
            Self::ListFavoriteArticles => encode(accessors::list_favorite_articles(tx).await?)?,
            Self::ListQueueArticles => encode(accessors::list_queue_articles(tx).await?)?,
            Self::ListDomainArticles(domain) => {
                encode(accessors::list_domain_articles(tx, domain).await?)?
            }
            Self::ListTopicArticles(topic_id) => {
                encode(accessors::list_topic_articles(tx, topic_id).await?)?
            }
            Self::GetTopicArticlesCount(topic_id) => {
                encode(accessors::get_topic_articles_count(tx, topic_id).await?)?
            }
            Self::GetTopic(id) => encode(accessors::get_topic(tx, id).await?)?,
            Self::ListTopics => encode(accessors::list_topics(tx).await?)?,
            Self::GetAnnotation(id) => encode(accessors::get_annotation(tx, id).await?)?,
            Self::ListAnnotations => encode(accessors::list_annotations(tx).await?)?,
            Self::ListArticleAnnotations(article_id) => {
                encode(accessors::list_article_annotations(tx, article_id).await?)?
            }
            Self::ListAnnotationsWithArticles => {
                encode(accessors::list_annotations_with_articles(tx).await?)?
            }
            Self::ListTopicAnnotations(topic_id) => {
                encode(accessors::list_topic_annotations(tx, topic_id).await?)?
            }
            Self::GetAnnotationsCount => encode(accessors::get_annotations_count(tx).await?)?,
            Self::GetReadingProgress => encode(accessors::get_reading_progress(tx).await?)?,
            Self::GetSettings => encode(accessors::get_settings(tx).await?)?,
            Self::GetUserInfo => encode(accessors::get_user_info(tx).await?)?,
            Self::GetSubscription(id) => encode(accessors::get_subscription(tx, id).await?)?,
            Self::ListSubscriptions => encode(accessors::list_subscriptions(tx).await?)?,
            Self::GetDomainSubscriptions(domain) => {
                encode(accessors::get_domain_subscriptions(tx, domain).await?)?
            }
            Self::GetSyncState(provider) => encode(accessors::get_sync_state(tx, *provider).await?)?,
            Self::ListSyncStates => encode(accessors::list_sync_states(tx).await?)?,
            Self::ListTombstones(entity) => encode(accessors::list_tombstones(tx, entity).await?)?,
        };
        Ok(result)
    }
}

fn encode<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Positional query arguments. Missing trailing arguments read as `null`.
struct Positional<'a> {
    method: &'a str,
    values: Vec<Value>,
}

impl<'a> Positional<'a> {
    fn new(method: &'a str, args: Value) -> Self {
        let values = match args {
            Value::Array(values) => values,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        Self { method, values }
    }

    fn at<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.values.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| AppError::invalid_argument(self.method, format!("argument {index}: {e}")))
    }
}

/// Every write operation with its typed arguments. The serialized form is
/// the wire shape `{"methodName": ..., "args": ...}`, which is also what
/// the account backend queues for push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "methodName", content = "args", rename_all = "camelCase")]
pub enum Mutation {
    PutArticleIfNotExists(Article),
    ImportArticles(ImportArticles),
    UpdateArticle(RecordUpdate),
    UpdateArticleRaw(RecordUpdate),
    ArticleSetFavorite(SetFavorite),
    ArticleTrackOpened(String),
    UpdateArticleReadingProgress(ReadingProgressUpdate),
    ArticleAddMoveToQueue(MoveToQueue),
    ArticleAddMoveToLibrary(MoveToLibrary),
    MoveArticlePosition(MoveArticle),
    DeleteArticle(String),
    PutTopic(Topic),
    PutAnnotation(Annotation),
    UpdateAnnotation(RecordUpdate),
    UpdateAnnotationRaw(RecordUpdate),
    MergeRemoteAnnotations(Vec<Annotation>),
    DeleteAnnotation(String),
    ImportEntries(Vec<(String, Value)>),
    UpdateSettings(Map<String, Value>),
    UpdateUserInfo(Map<String, Value>),
    PutSubscription(FeedSubscription),
    UpdateSubscription(RecordUpdate),
    ToggleSubscriptionActive(String),
    DeleteSubscription(String),
    PutSyncState(SyncState),
    UpdateSyncState(RecordUpdate),
    DeleteSyncState(SyncProvider),
    ClearTombstones(ClearTombstones),
}

impl Mutation {
    pub const NAMES: &'static [&'static str] = &[
        "putArticleIfNotExists",
        "importArticles",
        "updateArticle",
        "updateArticleRaw",
        "articleSetFavorite",
        "articleTrackOpened",
        "updateArticleReadingProgress",
        "articleAddMoveToQueue",
        "articleAddMoveToLibrary",
        "moveArticlePosition",
        "deleteArticle",
        "putTopic",
        "putAnnotation",
        "updateAnnotation",
        "updateAnnotationRaw",
        "mergeRemoteAnnotations",
        "deleteAnnotation",
        "importEntries",
        "updateSettings",
        "updateUserInfo",
        "putSubscription",
        "updateSubscription",
        "toggleSubscriptionActive",
        "deleteSubscription",
        "putSyncState",
        "updateSyncState",
        "deleteSyncState",
        "clearTombstones",
    ];

    pub fn parse(method: &str, args: Value) -> Result<Self> {
        if !Self::NAMES.contains(&method) {
            return Err(AppError::UnknownMethod(method.to_string()));
        }
        let mut frame = Map::new();
        frame.insert("methodName".to_string(), Value::from(method));
        frame.insert("args".to_string(), args);
        serde_json::from_value(Value::Object(frame))
            .map_err(|e| AppError::invalid_argument(method, e))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PutArticleIfNotExists(_) => "putArticleIfNotExists",
            Self::ImportArticles(_) => "importArticles",
            Self::UpdateArticle(_) => "updateArticle",
            Self::UpdateArticleRaw(_) => "updateArticleRaw",
            Self::ArticleSetFavorite(_) => "articleSetFavorite",
            Self::ArticleTrackOpened(_) => "articleTrackOpened",
            Self::UpdateArticleReadingProgress(_) => "updateArticleReadingProgress",
            Self::ArticleAddMoveToQueue(_) => "articleAddMoveToQueue",
            Self::ArticleAddMoveToLibrary(_) => "articleAddMoveToLibrary",
            Self::MoveArticlePosition(_) => "moveArticlePosition",
            Self::DeleteArticle(_) => "deleteArticle",
            Self::PutTopic(_) => "putTopic",
            Self::PutAnnotation(_) => "putAnnotation",
            Self::UpdateAnnotation(_) => "updateAnnotation",
            Self::UpdateAnnotationRaw(_) => "updateAnnotationRaw",
            Self::MergeRemoteAnnotations(_) => "mergeRemoteAnnotations",
            Self::DeleteAnnotation(_) => "deleteAnnotation",
            Self::ImportEntries(_) => "importEntries",
            Self::UpdateSettings(_) => "updateSettings",
            Self::UpdateUserInfo(_) => "updateUserInfo",
            Self::PutSubscription(_) => "putSubscription",
            Self::UpdateSubscription(_) => "updateSubscription",
            Self::ToggleSubscriptionActive(_) => "toggleSubscriptionActive",
            Self::DeleteSubscription(_) => "deleteSubscription",
            Self::PutSyncState(_) => "putSyncState",
            Self::UpdateSyncState(_) => "updateSyncState",
            Self::DeleteSyncState(_) => "deleteSyncState",
            Self::ClearTombstones(_) => "clearTombstones",
        }
    }

    /// Sync bookkeeping stays on the device and is never pushed to an account.
    pub fn is_local_only(&self) -> bool {
        matches!(
            self,
            Self::PutSyncState(_)
                | Self::UpdateSyncState(_)
                | Self::DeleteSyncState(_)
                | Self::ClearTombstones(_)
        )
    }

    pub async fn apply(self, tx: &mut WriteTransaction) -> Result<Value> {
        let result = match self {
            Self::PutArticleIfNotExists(article) => {
                encode(mutators::put_article_if_not_exists(tx, article).await?)?
            }
            Self::ImportArticles(args) => encode(mutators::import_articles(tx, args).await?)?,
            Self::UpdateArticle(update) => encode(mutators::update_article(tx, update).await?)?,
            Self::UpdateArticleRaw(update) => {
                encode(mutators::update_article_raw(tx, update).await?)?
            }
            Self::ArticleSetFavorite(args) => {
                encode(mutators::article_set_favorite(tx, args).await?)?
            }
            Self::ArticleTrackOpened(id) => encode(mutators::article_track_opened(tx, id).await?)?,
            Self::UpdateArticleReadingProgress(args) => {
                encode(mutators::update_article_reading_progress(tx, args).await?)?
            }
            Self::ArticleAddMoveToQueue(args) => {
                encode(mutators::article_add_move_to_queue(tx, args).await?)?
            }
            Self::ArticleAddMoveToLibrary(args) => {
                encode(mutators::article_add_move_to_library(tx, args).await?)?
            }
            Self::MoveArticlePosition(args) => {
                encode(mutators::move_article_position(tx, args).await?)?
            }
            Self::DeleteArticle(id) => encode(mutators::delete_article(tx, id).await?)?,
            Self::PutTopic(topic) => encode(mutators::put_topic(tx, topic).await?)?,
            Self::PutAnnotation(annotation) => {
                encode(mutators::put_annotation(tx, annotation).await?)?
            }
            Self::UpdateAnnotation(update) => {
                encode(mutators::update_annotation(tx, update).await?)?
            }
            Self::UpdateAnnotationRaw(update) => {
                encode(mutators::update_annotation_raw(tx, update).await?)?
            }
            Self::MergeRemoteAnnotations(annotations) => {
                encode(mutators::merge_remote_annotations(tx, annotations).await?)?
            }
            Self::DeleteAnnotation(id) => encode(mutators::delete_annotation(tx, id).await?)?,
            Self::ImportEntries(entries) => encode(mutators::import_entries(tx, entries).await?)?,
            Self::UpdateSettings(diff) => encode(mutators::update_settings(tx, diff).await?)?,
            Self::UpdateUserInfo(diff) => encode(mutators::update_user_info(tx, diff).await?)?,
            Self::PutSubscription(subscription) => {
                encode(mutators::put_subscription(tx, subscription).await?)?
            }
            Self::UpdateSubscription(update) => {
                encode(mutators::update_subscription(tx, update).await?)?
            }
            Self::ToggleSubscriptionActive(id) => {
                encode(mutators::toggle_subscription_active(tx, id).await?)?
            }
            Self::DeleteSubscription(id) => encode(mutators::delete_subscription(tx, id).await?)?,
            Self::PutSyncState(state) => encode(mutators::put_sync_state(tx, state).await?)?,
            Self::UpdateSyncState(update) => {
                encode(mutators::update_sync_state(tx, update).await?)?
            }
            Self::DeleteSyncState(provider) => {
                encode(mutators::delete_sync_state(tx, provider).await?)?
            }
            Self::ClearTombstones(args) => encode(mutators::clear_tombstones(tx, args).await?)?,
        };
        Ok(result)
    }
}
