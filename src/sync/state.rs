use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::Library;
use crate::error::Result;
use crate::models::{RecordUpdate, SyncProvider, SyncState, Tombstone};
use crate::store::mutators::ClearTombstones;
use crate::store::{Mutation, Query};

/// What one upload step sent to the remote service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl UploadReport {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Watermark {
    Upload,
    Download,
}

impl Watermark {
    fn field(self) -> &'static str {
        match self {
            Self::Upload => "last_upload",
            Self::Download => "last_download",
        }
    }
}

pub(super) async fn query_as<T: DeserializeOwned>(library: &Library, query: Query) -> Result<T> {
    Ok(serde_json::from_value(library.query(&query).await?)?)
}

pub(super) async fn load(library: &Library, provider: SyncProvider) -> Result<Option<SyncState>> {
    query_as(library, Query::GetSyncState(provider)).await
}

pub(super) async fn update(library: &Library, update: RecordUpdate) -> Result<()> {
    library.mutate(Mutation::UpdateSyncState(update)).await?;
    Ok(())
}

pub(super) async fn set_syncing(library: &Library, provider: SyncProvider, syncing: bool) -> Result<()> {
    update(library, RecordUpdate::new(provider.as_str()).set("is_syncing", syncing)).await
}

/// Record a completed step. `at` is the time captured before the step began.
pub(super) async fn advance(library: &Library, provider: SyncProvider, watermark: Watermark, at: i64) -> Result<()> {
    let update = RecordUpdate::new(provider.as_str())
        .set(watermark.field(), at)
        .set("is_syncing", false);
    self::update(library, update).await
}

pub(super) async fn tombstones(library: &Library, entity: &str) -> Result<Vec<Tombstone>> {
    query_as(library, Query::ListTombstones(entity.to_string())).await
}

pub(super) async fn clear_tombstones(library: &Library, entity: &str, ids: Vec<String>) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let args = ClearTombstones {
        entity: entity.to_string(),
        ids,
    };
    library.mutate(Mutation::ClearTombstones(args)).await?;
    Ok(())
}

/// Remote search cursor for a download watermark.
pub(super) fn cursor_for(last_download: Option<i64>) -> String {
    last_download
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|at| at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| "1970-01-01".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_starts_at_epoch_without_watermark() {
        assert_eq!(cursor_for(None), "1970-01-01");
        assert_eq!(cursor_for(Some(900)), "1970-01-01T00:00:00.900Z");
    }
}
