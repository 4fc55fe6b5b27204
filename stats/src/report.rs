use crate::{CacheStats, QueueStats};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Everything one cache contributes to the end-of-run report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheReport {
    pub stats: CacheStats,
    pub rq: QueueStats,
    pub wq: QueueStats,
    pub pq: QueueStats,
}

/// Per-run report over the whole hierarchy, caches in traversal order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    pub cycles: Vec<u64>,
    caches: IndexMap<String, CacheReport>,
}

impl Report {
    #[must_use]
    pub fn new(cycles: Vec<u64>) -> Self {
        Self {
            cycles,
            caches: IndexMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, report: CacheReport) {
        self.caches.insert(name.into(), report);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CacheReport> {
        self.caches.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CacheReport)> {
        self.caches.iter()
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "cycles: {}", self.cycles.iter().join(" "))?;
        for (name, cache) in &self.caches {
            let stats = &cache.stats;
            writeln!(
                f,
                "{name}: access {} hit {} miss {} merged {} forwarded {} \
                 miss latency {} pf issued {} pf useful {}",
                stats.total_accesses(),
                stats.total_hits(),
                stats.total_misses(),
                cache.rq.merged + cache.wq.merged + cache.pq.merged,
                cache.wq.forward,
                stats.total_miss_latency,
                stats.prefetch.issued,
                stats.prefetch.useful,
            )?;
        }
        Ok(())
    }
}
