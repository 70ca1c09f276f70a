use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::db::KvStore;
use crate::error::{AppError, Result};
use crate::reactive::{ChangeNotifier, PrefixWatch, Subscription};
use crate::services::LibraryRemote;
use crate::store::{Clock, Mutation, Query, ScanOptions};

use super::migrate::{drain, run_hooks};
use super::{AccountBackend, Backend, LocalBackend, Message, MigrationHooks, MigrationReport};

/// Which backend serves requests. While migrating, the local backend keeps
/// answering so callers are never blocked.
#[derive(Clone)]
pub enum BackendState {
    Local,
    Migrating(Arc<AccountBackend>),
    Account(Arc<AccountBackend>),
}

impl BackendState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Migrating(_) => "migrating",
            Self::Account(_) => "account",
        }
    }
}

/// Session context: the store, the active backend and change propagation.
/// Everything that reads or writes library data goes through one of these.
pub struct Library {
    store: KvStore,
    clock: Arc<dyn Clock>,
    notifier: ChangeNotifier,
    local: Arc<LocalBackend>,
    state: RwLock<BackendState>,
}

impl Library {
    pub fn new(store: KvStore, clock: Arc<dyn Clock>) -> Self {
        let notifier = ChangeNotifier::new();
        let local = Arc::new(LocalBackend::new(store.clone(), clock.clone(), notifier.clone()));
        Self {
            store,
            clock,
            notifier,
            local,
            state: RwLock::new(BackendState::Local),
        }
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub async fn state(&self) -> BackendState {
        self.state.read().await.clone()
    }

    pub async fn active(&self) -> Arc<dyn Backend> {
        self.route(&*self.state.read().await)
    }

    fn route(&self, state: &BackendState) -> Arc<dyn Backend> {
        match state {
            BackendState::Local | BackendState::Migrating(_) => self.local.clone(),
            BackendState::Account(account) => account.clone(),
        }
    }

    /// Switch to the account of `user_id`, moving local data into it first.
    /// Signing in again as the current user is a no-op. On failure the
    /// library stays local and the sign-in can simply be retried.
    pub async fn sign_in(
        &self,
        user_id: &str,
        remote: Arc<dyn LibraryRemote>,
        hooks: &dyn MigrationHooks,
    ) -> Result<MigrationReport> {
        let account = {
            let mut state = self.state.write().await;
            match &*state {
                BackendState::Account(current) | BackendState::Migrating(current)
                    if current.user_id() == user_id =>
                {
                    return Ok(MigrationReport { migrated: 0 });
                }
                _ => {}
            }
            let account = Arc::new(AccountBackend::new(
                self.store.clone(),
                user_id,
                self.clock.clone(),
                self.notifier.clone(),
                remote,
            ));
            *state = BackendState::Migrating(account.clone());
            account
        };

        // Writers keep landing on local during the first drain. The final one
        // runs under the state lock, which waits out in-flight mutations.
        let result: Result<MigrationReport> = async {
            let mut moved = drain(self.local.as_ref(), account.as_ref()).await?;
            let mut state = self.state.write().await;
            moved.extend(drain(self.local.as_ref(), account.as_ref()).await?);
            let remaining = self.local.scan_all().await?.len();
            if remaining > 0 {
                return Err(AppError::MigrationPartial {
                    migrated: moved.len(),
                    remaining,
                });
            }
            *state = BackendState::Account(account.clone());
            Ok(MigrationReport { migrated: moved.len() })
        }
        .await;

        match result {
            Ok(report) => {
                self.notifier.invalidate();
                if report.migrated > 0 {
                    run_hooks(hooks, user_id).await;
                }
                tracing::info!(event = "signed_in", user = user_id, migrated = report.migrated);
                Ok(report)
            }
            Err(e) => {
                *self.state.write().await = BackendState::Local;
                tracing::error!("Migration into account {} failed: {}", user_id, e);
                Err(e)
            }
        }
    }

    /// Route back to the local backend. Account data stays on disk.
    pub async fn sign_out(&self) {
        *self.state.write().await = BackendState::Local;
        self.notifier.invalidate();
        tracing::info!(event = "signed_out");
    }

    pub async fn handle(&self, message: Message) -> Result<Value> {
        tracing::debug!(kind = message.kind(), method = message.method(), "handling message");
        match message {
            Message::Query(query) => self.query(&query).await,
            Message::Mutate(mutation) => self.mutate(mutation).await,
            Message::Pull => {
                self.pull().await?;
                Ok(Value::Null)
            }
        }
    }

    pub async fn query(&self, query: &Query) -> Result<Value> {
        self.active().await.query(query).await
    }

    /// The routing guard is held until the write lands, so a sign-in never
    /// flips backends under an in-flight mutation.
    pub async fn mutate(&self, mutation: Mutation) -> Result<Value> {
        let state = self.state.read().await;
        self.route(&state).mutate(mutation).await
    }

    pub async fn pull(&self) -> Result<()> {
        self.active().await.pull().await
    }

    pub async fn scan(&self, options: &ScanOptions) -> Result<Vec<(String, Value)>> {
        let backend = self.active().await;
        let tx = backend.read();
        crate::store::ReadTx::scan(&tx, options).await
    }

    /// Live query result, re-evaluated against whichever backend is active.
    pub fn subscribe(self: &Arc<Self>, query: Query) -> Subscription {
        let library = Arc::downgrade(self);
        Subscription::spawn(&self.notifier, move || {
            let library = library.clone();
            let query = query.clone();
            async move {
                match library.upgrade() {
                    Some(library) => library.query(&query).await,
                    None => Ok(Value::Null),
                }
            }
        })
    }

    pub fn watch_prefix(self: &Arc<Self>, prefix: &str) -> PrefixWatch {
        let library = Arc::downgrade(self);
        let options = ScanOptions::prefix(prefix);
        PrefixWatch::spawn(&self.notifier, prefix, move || {
            let library = library.clone();
            let options = options.clone();
            async move {
                match library.upgrade() {
                    Some(library) => library.scan(&options).await,
                    None => Ok(Vec::new()),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::backend::LoggingHooks;
    use crate::services::{PendingMutation, PullResponse};
    use crate::store::ManualClock;

    #[derive(Default)]
    struct MockRemote {
        pushed: Mutex<Vec<PendingMutation>>,
    }

    #[async_trait]
    impl LibraryRemote for MockRemote {
        async fn push(&self, _space_id: &str, _client_id: &str, mutations: &[PendingMutation]) -> Result<()> {
            self.pushed.lock().extend_from_slice(mutations);
            Ok(())
        }

        async fn pull(&self, _space_id: &str, _client_id: &str, _cookie: &Value) -> Result<PullResponse> {
            Ok(PullResponse {
                cookie: json!(1),
                last_mutation_id: 0,
                patch: Vec::new(),
            })
        }
    }

    async fn library() -> Arc<Library> {
        let store = KvStore::open_in_memory().await.unwrap();
        Arc::new(Library::new(store, Arc::new(ManualClock::new(1_000))))
    }

    fn put_topic(id: &str) -> Message {
        Message::parse("mutate", "putTopic", json!({ "id": id, "name": id })).unwrap()
    }

    #[tokio::test]
    async fn sign_in_moves_routing_and_data_to_the_account() {
        let library = library().await;
        library.handle(put_topic("t1")).await.unwrap();
        assert_eq!(library.active().await.namespace(), "local");

        let remote = Arc::new(MockRemote::default());
        let report = library.sign_in("u1", remote.clone(), &LoggingHooks).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(library.active().await.namespace(), "account/u1");

        let topics = library.query(&Query::ListTopics).await.unwrap();
        assert_eq!(topics[0]["id"], json!("t1"));

        // Signing in twice does not migrate again.
        let again = library.sign_in("u1", remote.clone(), &LoggingHooks).await.unwrap();
        assert_eq!(again.migrated, 0);

        library.handle(Message::Pull).await.unwrap();
        assert_eq!(remote.pushed.lock()[0].name, "importEntries");

        library.sign_out().await;
        assert_eq!(library.state().await.name(), "local");
        assert_eq!(library.query(&Query::ListTopics).await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn writes_racing_a_sign_in_end_up_in_the_account() {
        let library = library().await;
        library.handle(put_topic("t0")).await.unwrap();

        let writers: Vec<_> = (1..=20)
            .map(|i| {
                let library = library.clone();
                tokio::spawn(async move { library.handle(put_topic(&format!("t{i}"))).await })
            })
            .collect();
        library
            .sign_in("u1", Arc::new(MockRemote::default()), &LoggingHooks)
            .await
            .unwrap();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        assert_eq!(library.store().count("local").await.unwrap(), 0);
        let topics = library.query(&Query::ListTopics).await.unwrap();
        assert_eq!(topics.as_array().unwrap().len(), 21);
    }

    #[tokio::test]
    async fn pull_is_a_no_op_while_local() {
        let library = library().await;
        assert_eq!(library.handle(Message::Pull).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn subscriptions_skip_unchanged_results() {
        let library = library().await;
        let mut subscription = library.subscribe(Query::GetArticlesCount);
        assert_eq!(subscription.next().await, Some(json!(0)));

        let article = json!({ "id": "art1", "url": "https://example.com", "time_added": 1 });
        library
            .handle(Message::parse("mutate", "putArticleIfNotExists", article).unwrap())
            .await
            .unwrap();
        assert_eq!(subscription.next().await, Some(json!(1)));

        library.handle(put_topic("t1")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(subscription.try_next().is_none());
    }
}
