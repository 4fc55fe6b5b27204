use serde::{Deserialize, Serialize};

/// Counters kept by every packet queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Enqueue attempts, merged or not.
    pub access: u64,
    /// Enqueues absorbed by an entry with the same block address.
    pub merged: u64,
    /// Enqueues rejected because the queue was at capacity.
    pub full: u64,
    /// Reads serviced straight out of a pending writeback.
    pub forward: u64,
    /// Entries that actually landed in a slot.
    pub to_cache: u64,
}
