use std::collections::BTreeMap;
use std::future::Future;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

use super::ChangeNotifier;

/// Difference between two consecutive scans of a prefix, keyed by record id.
/// `added` holds records that are new or whose value changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefixChange {
    pub added: Vec<Value>,
    pub removed: Vec<Value>,
}

impl PrefixChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Reports how the records under a key prefix change over time. The scan at
/// creation is the baseline and is not reported.
pub struct PrefixWatch {
    changes: mpsc::UnboundedReceiver<PrefixChange>,
    task: JoinHandle<()>,
}

impl PrefixWatch {
    pub fn spawn<F, Fut>(notifier: &ChangeNotifier, prefix: &str, scan: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<(String, Value)>>> + Send + 'static,
    {
        let (tx, changes) = mpsc::unbounded_channel();
        let mut revisions = notifier.changes();
        let prefix = prefix.to_string();

        let task = tokio::spawn(async move {
            revisions.borrow_and_update();
            let mut previous = match scan().await {
                Ok(entries) => by_id(&prefix, entries),
                Err(e) => {
                    tracing::warn!("Initial scan of {} failed: {}", prefix, e);
                    BTreeMap::new()
                }
            };

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    changed = revisions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                revisions.borrow_and_update();

                let current = match scan().await {
                    Ok(entries) => by_id(&prefix, entries),
                    Err(e) => {
                        tracing::warn!("Scan of {} failed: {}", prefix, e);
                        continue;
                    }
                };
                let change = diff(&previous, &current);
                previous = current;
                if !change.is_empty() && tx.send(change).is_err() {
                    break;
                }
            }
        });

        Self { changes, task }
    }

    pub async fn next(&mut self) -> Option<PrefixChange> {
        self.changes.recv().await
    }
}

impl Drop for PrefixWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Index entries by their `id` field, falling back to the key suffix.
fn by_id(prefix: &str, entries: Vec<(String, Value)>) -> BTreeMap<String, Value> {
    entries
        .into_iter()
        .map(|(key, value)| {
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| key.strip_prefix(prefix).unwrap_or(&key).to_string());
            (id, value)
        })
        .collect()
}

fn diff(previous: &BTreeMap<String, Value>, current: &BTreeMap<String, Value>) -> PrefixChange {
    let added = current
        .iter()
        .filter(|(id, value)| previous.get(*id) != Some(*value))
        .map(|(_, value)| value.clone())
        .collect();
    let removed = previous
        .iter()
        .filter(|(id, _)| !current.contains_key(*id))
        .map(|(_, value)| value.clone())
        .collect();
    PrefixChange { added, removed }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[tokio::test]
    async fn reports_added_changed_and_removed_records() {
        let notifier = ChangeNotifier::new();
        let entries = Arc::new(Mutex::new(vec![
            ("annotations/a".to_string(), json!({ "id": "a", "text": "1" })),
            ("annotations/b".to_string(), json!({ "id": "b", "text": "2" })),
        ]));

        let source = entries.clone();
        let mut watch = PrefixWatch::spawn(&notifier, "annotations/", move || {
            let snapshot = source.lock().clone();
            async move { Ok(snapshot) }
        });
        tokio::task::yield_now().await;

        *entries.lock() = vec![
            ("annotations/b".to_string(), json!({ "id": "b", "text": "changed" })),
            ("annotations/c".to_string(), json!({ "id": "c", "text": "3" })),
        ];
        notifier.notify(&["annotations/a".to_string()]);

        let change = watch.next().await.unwrap();
        assert_eq!(
            change.added,
            vec![json!({ "id": "b", "text": "changed" }), json!({ "id": "c", "text": "3" })]
        );
        assert_eq!(change.removed, vec![json!({ "id": "a", "text": "1" })]);
    }

    #[test]
    fn ids_fall_back_to_key_suffix() {
        let indexed = by_id("topics/", vec![("topics/t1".to_string(), json!({ "name": "x" }))]);
        assert!(indexed.contains_key("t1"));
    }
}
