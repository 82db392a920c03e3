use log::debug;
use std::sync::RwLock;
use tokio::sync::watch;

use crate::models::queue::QueueEntry;
use crate::traits::QueueStore;

/// Queue held in memory, seeded from the settings file. Edits bump the
/// revision so the mining loop recomputes right away.
pub struct MemoryQueueStore {
    entries: RwLock<Vec<QueueEntry>>,
    revision: watch::Sender<u64>,
}

impl MemoryQueueStore {
    pub fn new(entries: Vec<QueueEntry>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            entries: RwLock::new(entries),
            revision,
        }
    }

    pub fn set_entries(&self, entries: Vec<QueueEntry>) {
        debug!("[Queue] Replacing queue with {} entries", entries.len());
        if let Ok(mut guard) = self.entries.write() {
            *guard = entries;
        }
        self.revision.send_modify(|rev| *rev += 1);
    }
}

impl QueueStore for MemoryQueueStore {
    fn entries(&self) -> Vec<QueueEntry> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_entries_notifies_subscribers() {
        let store = MemoryQueueStore::new(vec![QueueEntry::channel("a", 1)]);
        let mut rx = store.subscribe();
        assert_eq!(*rx.borrow(), 0);

        store.set_entries(vec![QueueEntry::channel("b", 1), QueueEntry::campaign("c1", 2)]);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
        assert_eq!(store.entries().len(), 2);
        assert_eq!(store.entries()[0].channel.as_deref(), Some("b"));
    }
}
