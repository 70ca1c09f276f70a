//! Storage targets that execute the shared query/mutation registry.

mod account;
mod library;
mod local;
mod migrate;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::KvStore;
use crate::error::{AppError, Result};
use crate::reactive::ChangeNotifier;
use crate::store::{Clock, Mutation, Query, ReadTransaction, WriteTransaction};

pub use account::AccountBackend;
pub use library::{BackendState, Library};
pub use local::LocalBackend;
pub use migrate::{migrate, LoggingHooks, MigrationHooks, MigrationReport};

pub const LOCAL_NAMESPACE: &str = "local";

/// One inbound request, already resolved against the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Query(Query),
    Mutate(Mutation),
    Pull,
}

impl Message {
    pub fn parse(kind: &str, method: &str, args: Value) -> Result<Self> {
        match kind {
            "query" => Ok(Self::Query(Query::parse(method, args)?)),
            "mutate" => Ok(Self::Mutate(Mutation::parse(method, args)?)),
            "pull" => Ok(Self::Pull),
            other => Err(AppError::invalid_argument(
                method,
                format!("unknown message type {other}"),
            )),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::Mutate(_) => "mutate",
            Self::Pull => "pull",
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Query(query) => query.name(),
            Self::Mutate(mutation) => mutation.name(),
            Self::Pull => "pull",
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn namespace(&self) -> &str;

    fn read(&self) -> ReadTransaction;

    async fn query(&self, query: &Query) -> Result<Value> {
        query.run(&self.read()).await
    }

    async fn mutate(&self, mutation: Mutation) -> Result<Value>;

    /// Exchange state with the remote store, if there is one.
    async fn pull(&self) -> Result<()>;

    /// Every entry of the backend in key order.
    async fn scan_all(&self) -> Result<Vec<(String, Value)>>;

    /// Delete the given entries whose stored value is still the one given.
    /// Returns the keys that were removed.
    async fn delete_unchanged(&self, entries: &[(String, Value)]) -> Result<Vec<String>>;
}

/// One namespace of the KV store with single-writer mutation semantics.
#[derive(Clone)]
pub(crate) struct Namespace {
    store: KvStore,
    name: String,
    clock: Arc<dyn Clock>,
    notifier: ChangeNotifier,
    writer: Arc<Mutex<()>>,
}

impl Namespace {
    pub(crate) fn new(
        store: KvStore,
        name: impl Into<String>,
        clock: Arc<dyn Clock>,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            clock,
            notifier,
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn store(&self) -> &KvStore {
        &self.store
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn read(&self) -> ReadTransaction {
        ReadTransaction::new(self.store.clone(), self.name.clone(), self.clock.clone())
    }

    /// Run one mutation in its own write transaction. Mutations on the same
    /// namespace are applied strictly one after another.
    pub(crate) async fn mutate(&self, mutation: Mutation) -> Result<Value> {
        let _writer = self.writer.lock().await;
        let mut tx = WriteTransaction::new(self.store.clone(), self.name.clone(), self.clock.clone());
        let result = mutation.apply(&mut tx).await?;
        let changed = tx.commit().await?;
        self.notifier.notify(&changed);
        Ok(result)
    }

    /// Write raw entries outside the registry, e.g. patches from a pull.
    pub(crate) async fn apply_raw(&self, writes: Vec<(String, Option<Value>)>) -> Result<()> {
        let _writer = self.writer.lock().await;
        let changed: Vec<String> = writes.iter().map(|(key, _)| key.clone()).collect();
        self.store.apply(&self.name, writes).await?;
        self.notifier.notify(&changed);
        Ok(())
    }

    pub(crate) async fn scan_all(&self) -> Result<Vec<(String, Value)>> {
        self.store.entries(&self.name, None).await
    }

    /// Compare and delete under the writer lock, so a mutation cannot slip
    /// in between the comparison and the delete.
    pub(crate) async fn delete_unchanged(&self, entries: &[(String, Value)]) -> Result<Vec<String>> {
        let _writer = self.writer.lock().await;
        let current: BTreeMap<String, Value> = self.store.entries(&self.name, None).await?.into_iter().collect();
        let removed: Vec<String> = entries
            .iter()
            .filter(|(key, value)| current.get(key) == Some(value))
            .map(|(key, _)| key.clone())
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }
        self.store
            .apply(&self.name, removed.iter().map(|key| (key.clone(), None)).collect())
            .await?;
        self.notifier.notify(&removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_resolve_to_registry_entries() {
        let message = Message::parse("query", "listArticleAnnotations", json!(["art1"])).unwrap();
        assert_eq!(message, Message::Query(Query::ListArticleAnnotations("art1".into())));
        assert_eq!(message.kind(), "query");

        assert_eq!(Message::parse("pull", "", Value::Null).unwrap(), Message::Pull);
        assert!(matches!(
            Message::parse("mutate", "noSuchMutator", json!({})),
            Err(AppError::UnknownMethod(_))
        ));
        assert!(matches!(
            Message::parse("subscribe", "getSettings", json!([])),
            Err(AppError::InvalidArgument { .. })
        ));
    }
}
