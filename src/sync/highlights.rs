//! Annotations against the highlights service.

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::backend::Library;
use crate::error::{AppError, Result};
use crate::models::{Annotation, Article, RecordUpdate, SyncProvider, SyncState};
use crate::store::mutators::ImportArticles;
use crate::store::{Mutation, Query};

use super::remote::{HighlightsRemote, RemoteHighlight};
use super::state::{self, UploadReport, Watermark};

const PROVIDER: SyncProvider = SyncProvider::Hypothesis;
const ENTITY: &str = "annotations";
const DELETE_CONCURRENCY: usize = 5;

/// Fill in the account name when only a token is known.
pub(super) async fn resolve_username(
    library: &Library,
    remote: &dyn HighlightsRemote,
    sync_state: &SyncState,
) -> Result<()> {
    if sync_state.username.is_some() {
        return Ok(());
    }
    let username = remote
        .username(&sync_state.api_token)
        .await?
        .ok_or_else(|| AppError::remote(PROVIDER.as_str(), "no account for api token"))?;
    state::update(library, RecordUpdate::new(PROVIDER.as_str()).set("username", username)).await
}

/// Send pending deletes, then every annotation changed since the last
/// upload, oldest first.
pub(super) async fn upload(library: &Library, remote: &dyn HighlightsRemote) -> Result<UploadReport> {
    let Some(sync_state) = state::load(library, PROVIDER).await? else {
        return Ok(UploadReport::default());
    };
    state::set_syncing(library, PROVIDER, true).await?;
    let started = library.now_ms();
    let mut report = UploadReport::default();

    let mut sent = Vec::new();
    for tombstone in state::tombstones(library, ENTITY).await? {
        remote.delete(&sync_state, &tombstone.remote_id).await?;
        sent.push(tombstone.id);
    }
    report.deleted = sent.len();
    state::clear_tombstones(library, ENTITY, sent).await?;

    let last_upload = sync_state.last_upload;
    let annotations: Vec<Annotation> = state::query_as(library, Query::ListAnnotations).await?;
    let mut pending = pending_uploads(annotations, last_upload);
    pending.sort_by_key(Annotation::modified_at);

    for annotation in pending {
        let article: Option<Article> =
            state::query_as(library, Query::GetArticle(annotation.article_id.clone())).await?;
        let Some(article) = article else {
            tracing::debug!(annotation = %annotation.id, "skipping annotation without article");
            continue;
        };

        if annotation.is_published() {
            remote.update(&sync_state, &annotation).await?;
            report.updated += 1;
        } else {
            let remote_id = remote.create(&sync_state, &annotation, &article).await?;
            // Raw update: learning the remote id is not a user edit.
            let update = RecordUpdate::new(annotation.id.as_str()).set("h_id", remote_id);
            library.mutate(Mutation::UpdateAnnotationRaw(update)).await?;
            report.created += 1;
        }
    }

    state::advance(library, PROVIDER, Watermark::Upload, started).await?;
    tracing::info!(
        event = "upload_done",
        provider = PROVIDER.as_str(),
        created = report.created,
        updated = report.updated,
        deleted = report.deleted
    );
    Ok(report)
}

/// Annotations that have to be sent. Without a watermark only drafts
/// qualify, so a lost sync state does not re-send everything.
fn pending_uploads(annotations: Vec<Annotation>, last_upload: Option<i64>) -> Vec<Annotation> {
    let since = last_upload.unwrap_or(0);
    annotations
        .into_iter()
        .filter(|a| a.modified_at() > since)
        .filter(Annotation::should_upload)
        .filter(|a| last_upload.is_some() || !a.is_published())
        .collect()
}

/// Fetch everything changed remotely since the last download and merge it.
pub(super) async fn download(library: &Library, remote: &dyn HighlightsRemote, cap: usize) -> Result<usize> {
    let Some(sync_state) = state::load(library, PROVIDER).await? else {
        return Ok(0);
    };
    state::set_syncing(library, PROVIDER, true).await?;
    let started = library.now_ms();

    let mut cursor = state::cursor_for(sync_state.last_download);
    let mut highlights: Vec<RemoteHighlight> = Vec::new();
    while highlights.len() < cap {
        let page = remote.search_page(&sync_state, &cursor).await?;
        highlights.extend(page.highlights);
        match page.next_cursor {
            Some(next_cursor) => cursor = next_cursor,
            None => break,
        }
    }

    let count = highlights.len();
    let articles = articles_for(&highlights);
    if !articles.is_empty() {
        library
            .mutate(Mutation::ImportArticles(ImportArticles { articles }))
            .await?;
    }
    if !highlights.is_empty() {
        let annotations = highlights.into_iter().map(|h| h.annotation).collect();
        library
            .mutate(Mutation::MergeRemoteAnnotations(annotations))
            .await?;
    }

    state::advance(library, PROVIDER, Watermark::Download, started).await?;
    tracing::info!(event = "download_done", provider = PROVIDER.as_str(), annotations = count);
    Ok(count)
}

/// One completed article per annotated page, dated to its oldest annotation.
fn articles_for(highlights: &[RemoteHighlight]) -> Vec<Article> {
    let mut pages: BTreeMap<&str, Article> = BTreeMap::new();
    for highlight in highlights {
        let article = pages
            .entry(highlight.annotation.article_id.as_str())
            .or_insert_with(|| {
                let mut article = Article::from_url(
                    &highlight.page_url,
                    highlight.page_title.clone(),
                    highlight.annotation.created_at,
                );
                article.id = highlight.annotation.article_id.clone();
                article.reading_progress = 1.0;
                article
            });
        article.time_added = article.time_added.min(highlight.annotation.created_at);
    }
    pages.into_values().collect()
}

/// Delete annotations removed locally that were already published. Their
/// tombstones are cleared once the remote delete went through.
pub(super) async fn delete_removed(
    library: &Library,
    remote: &dyn HighlightsRemote,
    removed: Vec<Value>,
) -> Result<usize> {
    let published: Vec<(String, String)> = removed
        .iter()
        .filter_map(|record| {
            let id = record.get("id")?.as_str()?;
            let h_id = record.get("h_id")?.as_str()?;
            Some((id.to_string(), h_id.to_string()))
        })
        .collect();
    if published.is_empty() {
        return Ok(0);
    }
    let Some(sync_state) = state::load(library, PROVIDER).await? else {
        return Ok(0);
    };

    tracing::info!(event = "remote_delete", provider = PROVIDER.as_str(), count = published.len());
    let results: Vec<(String, Result<()>)> = stream::iter(published)
        .map(|(id, h_id)| {
            let sync_state = &sync_state;
            async move { (id, remote.delete(sync_state, &h_id).await) }
        })
        .buffer_unordered(DELETE_CONCURRENCY)
        .collect()
        .await;

    let mut deleted = Vec::new();
    for (id, result) in results {
        match result {
            Ok(()) => deleted.push(id),
            Err(e) => tracing::warn!("Remote delete of annotation {} failed: {}", id, e),
        }
    }
    let count = deleted.len();
    state::clear_tombstones(library, ENTITY, deleted).await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotation(id: &str, updated_at: i64, h_id: Option<&str>) -> Annotation {
        let mut annotation = Annotation::new("art1", "note", updated_at);
        annotation.id = id.to_string();
        annotation.h_id = h_id.map(str::to_string);
        annotation
    }

    #[test]
    fn uploads_only_changes_since_the_watermark() {
        let annotations = vec![
            annotation("old", 500, Some("h-old")),
            annotation("new", 1500, None),
            annotation("edited", 1600, Some("h-edited")),
        ];
        let ids: Vec<String> = pending_uploads(annotations, Some(1000))
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["new", "edited"]);
    }

    #[test]
    fn lost_watermark_only_uploads_drafts() {
        let mut suggestion = annotation("ai", 10, None);
        suggestion.ai_created = true;
        suggestion.text.clear();
        let annotations = vec![annotation("published", 10, Some("h-1")), annotation("draft", 10, None), suggestion];

        let ids: Vec<String> = pending_uploads(annotations, None).into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["draft"]);
    }

    #[test]
    fn one_completed_article_per_page() {
        let highlight = |id: &str, created_at: i64| {
            let mut annotation = annotation(id, created_at, Some(id));
            annotation.article_id = crate::models::url_hash("https://example.com/post");
            RemoteHighlight {
                annotation,
                page_url: "https://example.com/post".into(),
                page_title: Some("Post".into()),
            }
        };
        let articles = articles_for(&[highlight("h1", 300), highlight("h2", 100)]);

        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].time_added, 100);
        assert_eq!(articles[0].reading_progress, 1.0);
        assert_eq!(articles[0].title.as_deref(), Some("Post"));
    }
}
