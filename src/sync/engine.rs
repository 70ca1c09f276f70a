use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::Library;
use crate::config::SyncConfig;
use crate::error::{AppError, Result};
use crate::legacy::LegacyStore;
use crate::models::{keys, SyncProvider, SyncState};
use crate::reactive::PrefixChange;
use crate::store::Mutation;

use super::debounce::Debouncer;
use super::remote::{ArticlesRemote, HighlightsRemote};
use super::state::{self, UploadReport};
use super::{articles, highlights};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub upload_debounce: Duration,
    pub download_cap: usize,
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            upload_debounce: Duration::from_secs(config.upload_debounce_secs),
            download_cap: config.download_cap,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// How one invocation of a flow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum FlowOutcome {
    /// Another run of the same flow was in progress.
    Busy,
    /// No credentials for the provider.
    NotConfigured,
    Completed { uploaded: usize, downloaded: usize },
    /// Logged; watermarks were left where they were.
    Failed,
}

/// Per-flow bookkeeping. `running` is the single in-flight guard shared by
/// full cycles and debounced uploads.
struct Flow {
    running: AtomicBool,
    watching: AtomicBool,
    debounce: Debouncer,
}

impl Flow {
    fn new(debounce: Duration) -> Self {
        Self {
            running: AtomicBool::new(false),
            watching: AtomicBool::new(false),
            debounce: Debouncer::new(debounce),
        }
    }
}

struct FlowGuard<'a>(&'a AtomicBool);

impl<'a> FlowGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(running))
    }
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Two-way sync of highlights and articles. Each flow uploads, then
/// downloads, then keeps watching local changes.
///
/// Conflicts are resolved by whichever direction runs later: a record
/// edited both locally and remotely within one cycle ends up with the
/// remote version after the download step.
pub struct SyncEngine {
    library: Arc<Library>,
    highlights_remote: Arc<dyn HighlightsRemote>,
    articles_remote: Arc<dyn ArticlesRemote>,
    legacy: Option<LegacyStore>,
    options: SyncOptions,
    highlights: Flow,
    articles: Flow,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        library: Arc<Library>,
        highlights_remote: Arc<dyn HighlightsRemote>,
        articles_remote: Arc<dyn ArticlesRemote>,
        options: SyncOptions,
    ) -> Self {
        Self {
            library,
            highlights_remote,
            articles_remote,
            legacy: None,
            options,
            highlights: Flow::new(options.upload_debounce),
            articles: Flow::new(options.upload_debounce),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Allow the highlights flow to pick up credentials from legacy settings.
    pub fn with_legacy(mut self, legacy: LegacyStore) -> Self {
        self.legacy = Some(legacy);
        self
    }

    fn flow(&self, provider: SyncProvider) -> &Flow {
        match provider {
            SyncProvider::Hypothesis => &self.highlights,
            SyncProvider::Pocket => &self.articles,
        }
    }

    /// Store credentials for a provider the user just connected.
    pub async fn connect(&self, sync_state: SyncState) -> Result<()> {
        tracing::info!(event = "provider_connected", provider = %sync_state.id);
        self.library.mutate(Mutation::PutSyncState(sync_state)).await?;
        Ok(())
    }

    pub async fn sync_all(self: &Arc<Self>) -> (FlowOutcome, FlowOutcome) {
        tokio::join!(
            self.sync(SyncProvider::Hypothesis),
            self.sync(SyncProvider::Pocket)
        )
    }

    /// One full cycle of a flow. Re-entrant calls return `Busy`.
    pub async fn sync(self: &Arc<Self>, provider: SyncProvider) -> FlowOutcome {
        let Some(_guard) = FlowGuard::acquire(&self.flow(provider).running) else {
            tracing::debug!(provider = provider.as_str(), "sync already running");
            return FlowOutcome::Busy;
        };
        tracing::info!(event = "sync_start", provider = provider.as_str());

        let outcome = match self.run_cycle(provider).await {
            Ok(None) => FlowOutcome::NotConfigured,
            Ok(Some((uploaded, downloaded))) => {
                self.start_watch(provider);
                FlowOutcome::Completed {
                    uploaded: uploaded.total(),
                    downloaded,
                }
            }
            Err(e) => self.fail(provider, e).await,
        };
        tracing::info!(event = "sync_done", provider = provider.as_str(), ?outcome);
        outcome
    }

    /// Upload only, sharing the in-flight guard with full cycles.
    pub async fn upload(&self, provider: SyncProvider) -> FlowOutcome {
        let Some(_guard) = FlowGuard::acquire(&self.flow(provider).running) else {
            tracing::debug!(provider = provider.as_str(), "upload skipped, sync in flight");
            return FlowOutcome::Busy;
        };

        let result = match provider {
            SyncProvider::Hypothesis => highlights::upload(&self.library, self.highlights_remote.as_ref()).await,
            SyncProvider::Pocket => articles::upload(&self.library, self.articles_remote.as_ref()).await,
        };
        match result {
            Ok(report) => FlowOutcome::Completed {
                uploaded: report.total(),
                downloaded: 0,
            },
            Err(e) => self.fail(provider, e).await,
        }
    }

    async fn run_cycle(&self, provider: SyncProvider) -> Result<Option<(UploadReport, usize)>> {
        let Some(sync_state) = self.sync_state(provider).await? else {
            return Ok(None);
        };
        let cap = self.options.download_cap;

        let (uploaded, downloaded) = match provider {
            SyncProvider::Hypothesis => {
                let remote = self.highlights_remote.as_ref();
                highlights::resolve_username(&self.library, remote, &sync_state).await?;
                let uploaded = highlights::upload(&self.library, remote).await?;
                (uploaded, highlights::download(&self.library, remote, cap).await?)
            }
            SyncProvider::Pocket => {
                let remote = self.articles_remote.as_ref();
                let uploaded = articles::upload(&self.library, remote).await?;
                (uploaded, articles::download(&self.library, remote).await?)
            }
        };
        Ok(Some((uploaded, downloaded)))
    }

    /// Stored sync state, or one migrated from legacy settings. The legacy
    /// credentials are adopted at most once.
    async fn sync_state(&self, provider: SyncProvider) -> Result<Option<SyncState>> {
        if let Some(existing) = state::load(&self.library, provider).await? {
            return Ok(Some(existing));
        }
        let Some(legacy) = self.legacy.as_ref().filter(|_| provider == SyncProvider::Hypothesis) else {
            return Ok(None);
        };
        let Some(migrated) = legacy.hypothesis_sync_state().await? else {
            return Ok(None);
        };
        tracing::info!(event = "legacy_credentials_migrated", provider = provider.as_str());
        self.library.mutate(Mutation::PutSyncState(migrated.clone())).await?;
        legacy.mark_credentials_adopted().await?;
        Ok(Some(migrated))
    }

    async fn fail(&self, provider: SyncProvider, error: AppError) -> FlowOutcome {
        if error.is_network() {
            tracing::warn!("{} sync failed, retrying next cycle: {}", provider, error);
        } else {
            tracing::error!("{} sync failed: {}", provider, error);
        }
        if let Ok(Some(_)) = state::load(&self.library, provider).await {
            if let Err(e) = state::set_syncing(&self.library, provider, false).await {
                tracing::warn!("Could not reset {} sync status: {}", provider, e);
            }
        }
        FlowOutcome::Failed
    }

    /// Watch local records of a flow once it completed its first cycle:
    /// changes schedule a debounced upload, removals of records known
    /// remotely are deleted there right away.
    fn start_watch(self: &Arc<Self>, provider: SyncProvider) {
        if self.flow(provider).watching.swap(true, Ordering::AcqRel) {
            return;
        }
        let prefix = match provider {
            SyncProvider::Hypothesis => keys::ANNOTATIONS,
            SyncProvider::Pocket => keys::ARTICLES,
        };
        tracing::info!(event = "watch_start", provider = provider.as_str(), prefix);

        let mut watch = self.library.watch_prefix(prefix);
        let engine = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(change) = watch.next().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.on_local_change(provider, change).await;
            }
        });
        self.watchers.lock().push(task);
    }

    async fn on_local_change(self: &Arc<Self>, provider: SyncProvider, change: PrefixChange) {
        if !change.added.is_empty() {
            self.schedule_upload(provider);
        }
        if change.removed.is_empty() {
            return;
        }
        let result = match provider {
            SyncProvider::Hypothesis => {
                highlights::delete_removed(&self.library, self.highlights_remote.as_ref(), change.removed).await
            }
            SyncProvider::Pocket => {
                articles::delete_removed(&self.library, self.articles_remote.as_ref(), change.removed).await
            }
        };
        if let Err(e) = result {
            tracing::warn!("Propagating {} deletes failed: {}", provider, e);
        }
    }

    fn schedule_upload(self: &Arc<Self>, provider: SyncProvider) {
        let engine: Weak<Self> = Arc::downgrade(self);
        self.flow(provider).debounce.schedule(move || async move {
            if let Some(engine) = engine.upgrade() {
                engine.upload(provider).await;
            }
        });
    }

    /// Run both flows every `every` until `shutdown` turns true. The first
    /// cycle starts immediately.
    pub fn spawn_periodic(self: &Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let (highlights, articles) = engine.sync_all().await;
                        tracing::debug!(?highlights, ?articles, "periodic sync finished");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(event = "sync_scheduler_stopped");
        })
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.watchers.lock().drain(..) {
            task.abort();
        }
    }
}
