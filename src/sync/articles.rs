//! Saved articles against the read-it-later service.

use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::backend::Library;
use crate::error::Result;
use crate::models::{Article, RecordUpdate, SyncProvider};
use crate::store::mutators::ImportArticles;
use crate::store::{Mutation, Query};

use super::remote::ArticlesRemote;
use super::state::{self, UploadReport, Watermark};

const PROVIDER: SyncProvider = SyncProvider::Pocket;
const ENTITY: &str = "articles";
const UPLOAD_CONCURRENCY: usize = 5;

/// Send pending deletes, then every article changed since the last upload,
/// oldest first.
///
/// Up to five uploads are in flight at once and their results come back in
/// upload order. Remote ids learned along the way are kept even when another
/// article fails, but the watermark only moves if all succeeded.
pub(super) async fn upload(library: &Library, remote: &dyn ArticlesRemote) -> Result<UploadReport> {
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

    let articles: Vec<Article> = state::query_as(library, Query::ListArticles).await?;
    let mut pending = pending_uploads(articles, sync_state.last_upload);
    pending.sort_by_key(Article::modified_at);

    let results: Vec<(Article, Result<Option<String>>)> = stream::iter(pending)
        .map(|article| {
            let sync_state = &sync_state;
            async move {
                let result = remote.upsert(sync_state, &article).await;
                (article, result)
            }
        })
        .buffered(UPLOAD_CONCURRENCY)
        .collect()
        .await;

    let mut failure = None;
    for (article, result) in results {
        match result {
            Ok(_) if article.pocket_id.is_some() => report.updated += 1,
            Ok(Some(remote_id)) => {
                let update = RecordUpdate::new(article.id.as_str()).set("pocket_id", remote_id);
                library.mutate(Mutation::UpdateArticleRaw(update)).await?;
                report.created += 1;
            }
            Ok(None) => {
                tracing::warn!("No remote id returned for article {}", article.url);
                report.created += 1;
            }
            Err(e) => {
                tracing::warn!("Upload of article {} failed: {}", article.url, e);
                failure.get_or_insert(e);
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
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

fn pending_uploads(articles: Vec<Article>, last_upload: Option<i64>) -> Vec<Article> {
    let since = last_upload.unwrap_or(0);
    articles
        .into_iter()
        .filter(|a| a.modified_at() > since)
        .filter(|a| last_upload.is_some() || a.pocket_id.is_none())
        .collect()
}

/// Import articles saved remotely since the last download. Articles that
/// already exist locally are left as they are.
pub(super) async fn download(library: &Library, remote: &dyn ArticlesRemote) -> Result<usize> {
    let Some(sync_state) = state::load(library, PROVIDER).await? else {
        return Ok(0);
    };
    state::set_syncing(library, PROVIDER, true).await?;
    let started = library.now_ms();

    let articles = remote.fetch_since(&sync_state, sync_state.last_download).await?;
    let count = articles.len();
    if !articles.is_empty() {
        library
            .mutate(Mutation::ImportArticles(ImportArticles { articles }))
            .await?;
    }

    state::advance(library, PROVIDER, Watermark::Download, started).await?;
    tracing::info!(event = "download_done", provider = PROVIDER.as_str(), articles = count);
    Ok(count)
}

/// Delete articles removed locally that exist remotely.
pub(super) async fn delete_removed(
    library: &Library,
    remote: &dyn ArticlesRemote,
    removed: Vec<Value>,
) -> Result<usize> {
    let saved: Vec<(String, String)> = removed
        .iter()
        .filter_map(|record| {
            let id = record.get("id")?.as_str()?;
            let pocket_id = record.get("pocket_id")?.as_str()?;
            Some((id.to_string(), pocket_id.to_string()))
        })
        .collect();
    if saved.is_empty() {
        return Ok(0);
    }
    let Some(sync_state) = state::load(library, PROVIDER).await? else {
        return Ok(0);
    };

    tracing::info!(event = "remote_delete", provider = PROVIDER.as_str(), count = saved.len());
    let results: Vec<(String, Result<()>)> = stream::iter(saved)
        .map(|(id, pocket_id)| {
            let sync_state = &sync_state;
            async move { (id, remote.delete(sync_state, &pocket_id).await) }
        })
        .buffer_unordered(UPLOAD_CONCURRENCY)
        .collect()
        .await;

    let mut deleted = Vec::new();
    for (id, result) in results {
        match result {
            Ok(()) => deleted.push(id),
            Err(e) => tracing::warn!("Remote delete of article {} failed: {}", id, e),
        }
    }
    let count = deleted.len();
    state::clear_tombstones(library, ENTITY, deleted).await?;
    Ok(count)
}
