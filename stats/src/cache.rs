use serde::{Deserialize, Serialize};
use strum::EnumCount;

/// Request classes tracked at every cache level.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumCount,
    strum::EnumIter,
    strum::Display,
)]
pub enum AccessType {
    Load,
    Rfo,
    Prefetch,
    Writeback,
    Translation,
}

/// One counter per [`AccessType`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCounts([u64; AccessType::COUNT]);

impl TypeCounts {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }
}

impl std::ops::Index<AccessType> for TypeCounts {
    type Output = u64;

    fn index(&self, ty: AccessType) -> &Self::Output {
        &self.0[ty as usize]
    }
}

impl std::ops::IndexMut<AccessType> for TypeCounts {
    fn index_mut(&mut self, ty: AccessType) -> &mut Self::Output {
        &mut self.0[ty as usize]
    }
}

/// Access / hit / miss tallies for one cpu.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCounters {
    pub access: TypeCounts,
    pub hit: TypeCounts,
    pub miss: TypeCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchStats {
    pub requested: u64,
    pub issued: u64,
    pub useful: u64,
    pub useless: u64,
    pub fill: u64,
}

/// Counters owned by a single cache.
///
/// Two families coexist on purpose: the per-cpu `sim`/`roi` tables count
/// hits at hit time and misses at fill time (so a coalesced miss is charged
/// once, when its line is installed), while the aggregate `access`/`hit`/
/// `miss` tables count at request-handling time, including reads serviced
/// straight from a pending writeback. `sim` runs from cycle zero, `roi`
/// only after the warm-up boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub sim: Vec<AccessCounters>,
    pub roi: Vec<AccessCounters>,
    pub access: TypeCounts,
    pub hit: TypeCounts,
    pub miss: TypeCounts,
    pub stall: TypeCounts,
    pub mshr_merged: TypeCounts,
    pub total_miss_latency: u64,
    pub prefetch: PrefetchStats,
}

impl CacheStats {
    #[must_use]
    pub fn new(num_cpus: usize) -> Self {
        Self {
            sim: vec![AccessCounters::default(); num_cpus],
            roi: vec![AccessCounters::default(); num_cpus],
            ..Self::default()
        }
    }

    /// A request found its block resident.
    pub fn record_hit(&mut self, cpu: usize, ty: AccessType, post_warmup: bool) {
        self.sim[cpu].access[ty] += 1;
        self.sim[cpu].hit[ty] += 1;
        if post_warmup {
            self.roi[cpu].access[ty] += 1;
            self.roi[cpu].hit[ty] += 1;
        }
        self.hit[ty] += 1;
        self.access[ty] += 1;
    }

    /// A read was serviced out of a pending writeback; only the aggregate
    /// family sees it.
    pub fn record_forward_hit(&mut self, ty: AccessType) {
        self.hit[ty] += 1;
        self.access[ty] += 1;
    }

    /// A miss left the handler (queued below, coalesced, or self-completed).
    pub fn record_miss_handled(&mut self, ty: AccessType) {
        self.miss[ty] += 1;
        self.access[ty] += 1;
    }

    /// A missed line was installed (or bypassed); this is where the per-cpu
    /// tables charge the miss.
    pub fn record_fill(&mut self, cpu: usize, ty: AccessType, post_warmup: bool) {
        self.sim[cpu].access[ty] += 1;
        self.sim[cpu].miss[ty] += 1;
        if post_warmup {
            self.roi[cpu].access[ty] += 1;
            self.roi[cpu].miss[ty] += 1;
        }
    }

    #[must_use]
    pub fn total_hits(&self) -> u64 {
        self.sim.iter().map(|c| c.hit.total()).sum()
    }

    #[must_use]
    pub fn total_misses(&self) -> u64 {
        self.sim.iter().map(|c| c.miss.total()).sum()
    }

    #[must_use]
    pub fn total_accesses(&self) -> u64 {
        self.sim.iter().map(|c| c.access.total()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessType, CacheStats};
    use strum::{EnumCount, IntoEnumIterator};

    #[test]
    fn type_counts_cover_every_access_type() {
        let mut stats = CacheStats::new(1);
        for ty in AccessType::iter() {
            stats.record_hit(0, ty, true);
        }
        assert_eq!(stats.total_hits(), AccessType::COUNT as u64);
        assert_eq!(stats.total_accesses(), AccessType::COUNT as u64);
        assert_eq!(stats.sim[0].hit[AccessType::Load], 1);
    }

    #[test]
    fn warmup_gates_roi_counters() {
        let mut stats = CacheStats::new(2);
        stats.record_fill(1, AccessType::Rfo, false);
        stats.record_fill(1, AccessType::Rfo, true);
        assert_eq!(stats.sim[1].miss[AccessType::Rfo], 2);
        assert_eq!(stats.roi[1].miss[AccessType::Rfo], 1);
    }

    #[test]
    fn families_diverge_on_forwards_and_coalesced_misses() {
        let mut stats = CacheStats::new(1);
        stats.record_forward_hit(AccessType::Load);
        stats.record_miss_handled(AccessType::Load);
        stats.record_miss_handled(AccessType::Load);
        // two requests missed but only one line was installed
        stats.record_fill(0, AccessType::Load, true);
        assert_eq!(stats.hit[AccessType::Load], 1);
        assert_eq!(stats.miss[AccessType::Load], 2);
        assert_eq!(stats.access[AccessType::Load], 3);
        assert_eq!(stats.sim[0].miss[AccessType::Load], 1);
        assert_eq!(stats.sim[0].hit[AccessType::Load], 0);
    }
}
