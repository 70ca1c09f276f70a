use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::KvStore;
use crate::error::Result;
use crate::reactive::ChangeNotifier;
use crate::store::{Clock, Mutation, ReadTransaction};

use super::{Backend, Namespace, LOCAL_NAMESPACE};

/// Device-only store used before anyone signs in.
pub struct LocalBackend {
    namespace: Namespace,
}

impl LocalBackend {
    pub fn new(store: KvStore, clock: Arc<dyn Clock>, notifier: ChangeNotifier) -> Self {
        Self {
            namespace: Namespace::new(store, LOCAL_NAMESPACE, clock, notifier),
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn namespace(&self) -> &str {
        self.namespace.name()
    }

    fn read(&self) -> ReadTransaction {
        self.namespace.read()
    }

    async fn mutate(&self, mutation: Mutation) -> Result<Value> {
        self.namespace.mutate(mutation).await
    }

    async fn pull(&self) -> Result<()> {
        Ok(())
    }

    async fn scan_all(&self) -> Result<Vec<(String, Value)>> {
        self.namespace.scan_all().await
    }

    async fn delete_unchanged(&self, entries: &[(String, Value)]) -> Result<Vec<String>> {
        self.namespace.delete_unchanged(entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ManualClock, Query};
    use serde_json::json;

    #[tokio::test]
    async fn mutations_commit_and_notify() {
        let store = KvStore::open_in_memory().await.unwrap();
        let notifier = ChangeNotifier::new();
        let backend = LocalBackend::new(store, Arc::new(ManualClock::new(1_000)), notifier.clone());

        backend
            .mutate(Mutation::parse("putTopic", json!({ "id": "t1", "name": "Rust" })).unwrap())
            .await
            .unwrap();
        assert_eq!(notifier.revision(), 1);

        let topics = backend.query(&Query::ListTopics).await.unwrap();
        assert_eq!(topics, json!([{ "id": "t1", "name": "Rust", "emoji": null, "group_id": null }]));
        backend.pull().await.unwrap();
    }

    #[tokio::test]
    async fn failed_mutation_leaves_no_trace() {
        let store = KvStore::open_in_memory().await.unwrap();
        let notifier = ChangeNotifier::new();
        let backend = LocalBackend::new(store, Arc::new(ManualClock::new(1_000)), notifier.clone());

        let update = Mutation::parse("updateAnnotation", json!({ "id": "missing", "text": "x" })).unwrap();
        assert!(backend.mutate(update).await.is_err());
        assert_eq!(notifier.revision(), 0);
        assert!(backend.scan_all().await.unwrap().is_empty());
    }
}
