use tokio::sync::watch;

use crate::models::queue::QueueEntry;

/// User-owned, read-only (from the core's point of view) watch queue.
pub trait QueueStore: Send + Sync {
    /// Entries in the user's order; priority is carried by each entry's rank.
    fn entries(&self) -> Vec<QueueEntry>;

    /// Fires whenever the entries change. The value is a revision counter.
    fn subscribe(&self) -> watch::Receiver<u64>;
}
