use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::KvStore;
use crate::error::Result;
use crate::reactive::ChangeNotifier;
use crate::services::{LibraryRemote, PatchOperation, PendingMutation};
use crate::store::{Clock, Mutation, ReadTransaction};

use super::{Backend, Namespace};

const PENDING_PREFIX: &str = "pending/";
const COOKIE_KEY: &str = "cookie";
const CLIENT_ID_KEY: &str = "clientID";
const LAST_MUTATION_ID_KEY: &str = "lastMutationID";

/// Store of a signed-in user. Mutations apply locally first and are queued
/// in an outbox namespace; `pull` pushes the queue and applies the remote
/// patch.
pub struct AccountBackend {
    user_id: String,
    data: Namespace,
    outbox: Namespace,
    remote: Arc<dyn LibraryRemote>,
    /// Keeps outbox order identical to apply order.
    queue: Mutex<()>,
}

impl AccountBackend {
    pub fn new(
        store: KvStore,
        user_id: &str,
        clock: Arc<dyn Clock>,
        notifier: ChangeNotifier,
        remote: Arc<dyn LibraryRemote>,
    ) -> Self {
        // The outbox gets its own notifier: queue bookkeeping is not a store change.
        let data = Namespace::new(store.clone(), format!("account/{user_id}"), clock.clone(), notifier);
        let outbox = Namespace::new(store, format!("outbox/{user_id}"), clock, ChangeNotifier::new());
        Self {
            user_id: user_id.to_string(),
            data,
            outbox,
            remote,
            queue: Mutex::new(()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn pending(&self) -> Result<Vec<PendingMutation>> {
        let entries = self
            .outbox
            .store()
            .entries(self.outbox.name(), Some(PENDING_PREFIX))
            .await?;
        entries
            .into_iter()
            .map(|(_, value)| Ok(serde_json::from_value(value)?))
            .collect()
    }

    /// Highest mutation id ever issued by this client. Never decreases, so
    /// ids stay unique after the queue was flushed.
    async fn last_mutation_id(&self) -> Result<u64> {
        let stored = self
            .outbox
            .store()
            .get(self.outbox.name(), LAST_MUTATION_ID_KEY)
            .await?
            .and_then(|value| value.as_u64())
            .unwrap_or(0);
        let queued = self.pending().await?.last().map(|m| m.id).unwrap_or(0);
        Ok(stored.max(queued))
    }

    async fn enqueue(&self, mutation: &Mutation) -> Result<()> {
        let next_id = self.last_mutation_id().await? + 1;
        let encoded = serde_json::to_value(mutation)?;
        let pending = PendingMutation {
            id: next_id,
            name: mutation.name().to_string(),
            args: encoded.get("args").cloned().unwrap_or(Value::Null),
            timestamp: self.outbox.now_ms(),
        };
        self.outbox
            .apply_raw(vec![
                (pending_key(next_id), Some(serde_json::to_value(&pending)?)),
                (LAST_MUTATION_ID_KEY.to_string(), Some(Value::from(next_id))),
            ])
            .await
    }

    async fn client_id(&self) -> Result<String> {
        let store = self.outbox.store();
        if let Some(Value::String(id)) = store.get(self.outbox.name(), CLIENT_ID_KEY).await? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        store
            .put(self.outbox.name(), CLIENT_ID_KEY, &Value::String(id.clone()))
            .await?;
        Ok(id)
    }

    async fn push_and_pull(&self) -> Result<usize> {
        let client_id = self.client_id().await?;

        let pending = self.pending().await?;
        if !pending.is_empty() {
            self.remote.push(&self.user_id, &client_id, &pending).await?;
            let sent = pending.iter().map(|m| (pending_key(m.id), None)).collect();
            self.outbox.apply_raw(sent).await?;
        }

        let cookie = self
            .outbox
            .store()
            .get(self.outbox.name(), COOKIE_KEY)
            .await?
            .unwrap_or(Value::Null);
        let response = self.remote.pull(&self.user_id, &client_id, &cookie).await?;

        let mut writes = Vec::new();
        for operation in response.patch {
            match operation {
                PatchOperation::Put { key, value } => writes.push((key, Some(value))),
                PatchOperation::Del { key } => writes.push((key, None)),
                PatchOperation::Clear => {
                    writes.clear();
                    for (key, _) in self.data.scan_all().await? {
                        writes.push((key, None));
                    }
                }
            }
        }
        let applied = writes.len();
        self.data.apply_raw(writes).await?;
        let last_mutation_id = self.last_mutation_id().await?.max(response.last_mutation_id);
        self.outbox
            .apply_raw(vec![
                (COOKIE_KEY.to_string(), Some(response.cookie)),
                (LAST_MUTATION_ID_KEY.to_string(), Some(Value::from(last_mutation_id))),
            ])
            .await?;
        Ok(applied)
    }
}

fn pending_key(id: u64) -> String {
    format!("{PENDING_PREFIX}{id:012}")
}

#[async_trait]
impl Backend for AccountBackend {
    fn namespace(&self) -> &str {
        self.data.name()
    }

    fn read(&self) -> ReadTransaction {
        self.data.read()
    }

    async fn mutate(&self, mutation: Mutation) -> Result<Value> {
        let _queue = self.queue.lock().await;
        let queued = (!mutation.is_local_only()).then(|| mutation.clone());
        let result = self.data.mutate(mutation).await?;
        if let Some(mutation) = queued {
            self.enqueue(&mutation).await?;
        }
        Ok(result)
    }

    async fn pull(&self) -> Result<()> {
        match self.push_and_pull().await {
            Ok(applied) => {
                tracing::debug!(user = %self.user_id, applied, "pulled account changes");
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Account sync for {} failed: {}", self.user_id, e);
                Err(e)
            }
        }
    }

    async fn scan_all(&self) -> Result<Vec<(String, Value)>> {
        self.data.scan_all().await
    }

    async fn delete_unchanged(&self, entries: &[(String, Value)]) -> Result<Vec<String>> {
        self.data.delete_unchanged(entries).await
    }
}
