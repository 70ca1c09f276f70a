use std::sync::Arc;

use tokio::sync::watch;

/// Store-wide revision counter, bumped once per commit that changed keys.
/// Observers only learn that something changed and re-read what they need.
#[derive(Clone)]
pub struct ChangeNotifier {
    revision: Arc<watch::Sender<u64>>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            revision: Arc::new(revision),
        }
    }

    pub fn notify(&self, changed_keys: &[String]) {
        if changed_keys.is_empty() {
            return;
        }
        tracing::debug!(keys = changed_keys.len(), "store changed");
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Force every observer to re-read, e.g. after the active backend changed.
    pub fn invalidate(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_real_changes_bump_the_revision() {
        let notifier = ChangeNotifier::new();
        let mut changes = notifier.changes();

        notifier.notify(&[]);
        assert_eq!(notifier.revision(), 0);
        assert!(!changes.has_changed().unwrap());

        notifier.notify(&["articles/a".to_string()]);
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), 1);
    }
}
