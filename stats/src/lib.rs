pub mod cache;
pub mod queue;
pub mod report;

pub use cache::{AccessCounters, AccessType, CacheStats, PrefetchStats, TypeCounts};
pub use queue::QueueStats;
pub use report::{CacheReport, Report};
