use std::future::Future;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

use super::ChangeNotifier;

const BUFFER: usize = 16;

/// Live result of one query. Delivers the first result right away, then a
/// new result after every store change that actually alters it.
///
/// Dropping the subscription stops its evaluation task.
pub struct Subscription {
    results: mpsc::Receiver<Value>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn spawn<F, Fut>(notifier: &ChangeNotifier, evaluate: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let (tx, results) = mpsc::channel(BUFFER);
        let mut changes = notifier.changes();

        let task = tokio::spawn(async move {
            let mut last: Option<Value> = None;
            loop {
                changes.borrow_and_update();
                match evaluate().await {
                    Ok(result) if last.as_ref() != Some(&result) => {
                        if tx.send(result.clone()).await.is_err() {
                            break;
                        }
                        last = Some(result);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Subscription query failed: {}", e),
                }

                tokio::select! {
                    _ = tx.closed() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { results, task }
    }

    /// Next distinct result, or `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Value> {
        self.results.recv().await
    }

    pub fn try_next(&mut self) -> Option<Value> {
        self.results.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
