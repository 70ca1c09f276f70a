use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::store::Mutation;

use super::Backend;

/// Collaborators that run once the data of a signed-out device has moved
/// into the account.
#[async_trait]
pub trait MigrationHooks: Send + Sync {
    async fn clear_local_screenshots(&self) -> Result<()>;

    async fn alias_metrics_user(&self, user_id: &str) -> Result<()>;
}

/// Hooks for hosts without screenshot caches or usage metrics.
pub struct LoggingHooks;

#[async_trait]
impl MigrationHooks for LoggingHooks {
    async fn clear_local_screenshots(&self) -> Result<()> {
        tracing::debug!("no local screenshots to clear");
        Ok(())
    }

    async fn alias_metrics_user(&self, user_id: &str) -> Result<()> {
        tracing::debug!(user = user_id, "no metrics identity to alias");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
}

/// Copy passes before giving up on a local store that keeps changing.
const MAX_PASSES: usize = 8;

/// Move every local record into the account backend, then remove it locally.
///
/// The import overwrites per key, so a run interrupted between import and
/// local delete is completed by simply running again.
pub async fn migrate(
    local: &dyn Backend,
    account: &dyn Backend,
    user_id: &str,
    hooks: &dyn MigrationHooks,
) -> Result<MigrationReport> {
    let moved = drain(local, account).await?;
    let remaining = local.scan_all().await?.len();
    if remaining > 0 {
        return Err(AppError::MigrationPartial {
            migrated: moved.len(),
            remaining,
        });
    }
    if !moved.is_empty() {
        run_hooks(hooks, user_id).await;
    }
    Ok(MigrationReport { migrated: moved.len() })
}

/// Copy local entries into the account and delete each one that was not
/// rewritten in the meantime. Rewritten and new entries are picked up by
/// the next pass. Returns every key moved.
pub(crate) async fn drain(local: &dyn Backend, account: &dyn Backend) -> Result<BTreeSet<String>> {
    let mut moved = BTreeSet::new();
    for pass in 0..MAX_PASSES {
        let entries = local.scan_all().await?;
        if entries.is_empty() {
            break;
        }
        tracing::info!(
            event = "migration_pass",
            pass,
            entries = entries.len(),
            from = local.namespace(),
            to = account.namespace()
        );

        account.mutate(Mutation::ImportEntries(entries.clone())).await?;

        match local.delete_unchanged(&entries).await {
            Ok(removed) => moved.extend(removed),
            Err(e) => {
                tracing::error!("Migrated entries could not be removed locally: {}", e);
                let remaining = local.scan_all().await.map(|rest| rest.len()).unwrap_or(entries.len());
                return Err(AppError::MigrationPartial {
                    migrated: moved.len(),
                    remaining,
                });
            }
        }
    }
    if !moved.is_empty() {
        tracing::info!(event = "migration_done", entries = moved.len());
    }
    Ok(moved)
}

/// Hook failures are logged; the data has moved either way.
pub(crate) async fn run_hooks(hooks: &dyn MigrationHooks, user_id: &str) {
    if let Err(e) = hooks.clear_local_screenshots().await {
        tracing::warn!("Failed to clear local screenshots: {}", e);
    }
    if let Err(e) = hooks.alias_metrics_user(user_id).await {
        tracing::warn!("Failed to alias metrics user: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::LocalBackend;
    use crate::db::KvStore;
    use crate::reactive::ChangeNotifier;
    use crate::store::{ManualClock, ReadTransaction};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    /// Backend in another namespace of the same store, standing in for an account.
    struct OtherNamespace(crate::backend::Namespace);

    #[async_trait]
    impl Backend for OtherNamespace {
        fn namespace(&self) -> &str {
            self.0.name()
        }
        fn read(&self) -> ReadTransaction {
            self.0.read()
        }
        async fn mutate(&self, mutation: Mutation) -> Result<Value> {
            self.0.mutate(mutation).await
        }
        async fn pull(&self) -> Result<()> {
            Ok(())
        }
        async fn scan_all(&self) -> Result<Vec<(String, Value)>> {
            self.0.scan_all().await
        }
        async fn delete_unchanged(&self, entries: &[(String, Value)]) -> Result<Vec<String>> {
            self.0.delete_unchanged(entries).await
        }
    }

    #[derive(Default)]
    struct RecordingHooks(Mutex<Vec<String>>);

    #[async_trait]
    impl MigrationHooks for RecordingHooks {
        async fn clear_local_screenshots(&self) -> Result<()> {
            self.0.lock().push("screenshots".into());
            Ok(())
        }
        async fn alias_metrics_user(&self, user_id: &str) -> Result<()> {
            self.0.lock().push(format!("alias:{user_id}"));
            Ok(())
        }
    }

    async fn backends() -> (LocalBackend, OtherNamespace) {
        let store = KvStore::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let notifier = ChangeNotifier::new();
        let local = LocalBackend::new(store.clone(), clock.clone(), notifier.clone());
        let account = OtherNamespace(crate::backend::Namespace::new(store, "account/u1", clock, notifier));
        (local, account)
    }

    #[tokio::test]
    async fn moves_everything_then_runs_hooks() {
        let (local, account) = backends().await;
        for (id, text) in [("a1", "foo"), ("a2", "bar")] {
            let annotation = json!({ "id": id, "article_id": "art1", "text": text, "created_at": 10 });
            local
                .mutate(Mutation::parse("putAnnotation", annotation).unwrap())
                .await
                .unwrap();
        }
        let before = local.scan_all().await.unwrap();

        let hooks = RecordingHooks::default();
        let report = migrate(&local, &account, "u1", &hooks).await.unwrap();

        assert_eq!(report.migrated, 2);
        assert!(local.scan_all().await.unwrap().is_empty());
        assert_eq!(account.scan_all().await.unwrap(), before);
        assert_eq!(hooks.0.lock().clone(), vec!["screenshots", "alias:u1"]);
    }

    #[tokio::test]
    async fn empty_local_store_is_a_no_op() {
        let (local, account) = backends().await;
        let hooks = RecordingHooks::default();

        let report = migrate(&local, &account, "u1", &hooks).await.unwrap();
        assert_eq!(report.migrated, 0);
        assert!(hooks.0.lock().is_empty());
    }

    #[tokio::test]
    async fn rerunning_after_an_interrupted_delete_is_safe() {
        let (local, account) = backends().await;
        local
            .mutate(Mutation::parse("putTopic", json!({ "id": "t1", "name": "Rust" })).unwrap())
            .await
            .unwrap();

        // Import landed but the local delete never happened.
        account
            .mutate(Mutation::ImportEntries(local.scan_all().await.unwrap()))
            .await
            .unwrap();

        let report = migrate(&local, &account, "u1", &LoggingHooks).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(account.scan_all().await.unwrap().len(), 1);
        assert!(local.scan_all().await.unwrap().is_empty());
    }

    /// Local store that receives one more write right after each snapshot,
    /// like a user editing while the migration runs.
    struct BusyLocal {
        inner: LocalBackend,
        writes: Mutex<Vec<Mutation>>,
    }

    #[async_trait]
    impl Backend for BusyLocal {
        fn namespace(&self) -> &str {
            self.inner.namespace()
        }
        fn read(&self) -> ReadTransaction {
            self.inner.read()
        }
        async fn mutate(&self, mutation: Mutation) -> Result<Value> {
            self.inner.mutate(mutation).await
        }
        async fn pull(&self) -> Result<()> {
            Ok(())
        }
        async fn scan_all(&self) -> Result<Vec<(String, Value)>> {
            let entries = self.inner.scan_all().await?;
            let next = self.writes.lock().pop();
            if let Some(mutation) = next {
                self.inner.mutate(mutation).await?;
            }
            Ok(entries)
        }
        async fn delete_unchanged(&self, entries: &[(String, Value)]) -> Result<Vec<String>> {
            self.inner.delete_unchanged(entries).await
        }
    }

    #[tokio::test]
    async fn writes_during_migration_are_carried_over() {
        let (local, account) = backends().await;
        let topic = |id: &str, name: &str| Mutation::parse("putTopic", json!({ "id": id, "name": name })).unwrap();
        local.mutate(topic("t1", "Rust")).await.unwrap();

        // Popped from the back: the edit lands during the first pass, the new topic during the second.
        let busy = BusyLocal {
            inner: local,
            writes: Mutex::new(vec![topic("t2", "Go"), topic("t1", "Rust 2024")]),
        };
        let report = migrate(&busy, &account, "u1", &LoggingHooks).await.unwrap();

        assert_eq!(report.migrated, 2);
        assert!(busy.inner.scan_all().await.unwrap().is_empty());
        let migrated = account.scan_all().await.unwrap();
        assert_eq!(migrated.len(), 2);
        assert_eq!(migrated[0].1["name"], json!("Rust 2024"));
        assert_eq!(migrated[1].1["name"], json!("Go"));
    }
}
