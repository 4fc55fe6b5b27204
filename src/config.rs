//! Per-cache geometry and hierarchy-wide configuration.

use crate::atd::NUM_SAMPLED_SETS;
use crate::packet::FillLevel;
use crate::ROB_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cache level identifiers, from the core outwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Itlb,
    Dtlb,
    Stlb,
    L1i,
    L1d,
    L2c,
    Llc,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name}: number of sets {num_sets} is not a power of two")]
    SetsNotPowerOfTwo { name: String, num_sets: usize },

    #[error("{name}: {num_ways} ways cannot be striped evenly over {num_cpus} cpus")]
    UnevenPartition {
        name: String,
        num_ways: usize,
        num_cpus: usize,
    },

    #[error("{name}: {num_sets} sets cannot host {NUM_SAMPLED_SETS} sampled sets")]
    TooFewSets { name: String, num_sets: usize },

    #[error("hierarchy needs at least one cpu")]
    NoCpus,
}

/// Geometry and queue sizing for one cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub name: String,
    pub kind: Kind,
    pub num_sets: usize,
    pub num_ways: usize,
    /// Tag-lookup pipeline depth added to every accepted packet.
    pub latency: u64,
    pub fill_level: FillLevel,
    pub rq_size: usize,
    pub wq_size: usize,
    pub pq_size: usize,
    pub mshr_size: usize,
    pub processed_size: usize,
    pub max_read: usize,
    pub max_fill: usize,
}

impl CacheConfig {
    #[must_use]
    pub fn itlb(cpu: usize) -> Self {
        Self {
            name: format!("cpu{cpu}_ITLB"),
            kind: Kind::Itlb,
            num_sets: 16,
            num_ways: 4,
            latency: 1,
            fill_level: FillLevel::L1,
            rq_size: 16,
            wq_size: 16,
            pq_size: 0,
            mshr_size: 8,
            processed_size: ROB_SIZE,
            max_read: 1,
            max_fill: 1,
        }
    }

    #[must_use]
    pub fn dtlb(cpu: usize) -> Self {
        Self {
            name: format!("cpu{cpu}_DTLB"),
            kind: Kind::Dtlb,
            ..Self::itlb(cpu)
        }
    }

    #[must_use]
    pub fn stlb(cpu: usize) -> Self {
        Self {
            name: format!("cpu{cpu}_STLB"),
            kind: Kind::Stlb,
            num_sets: 128,
            num_ways: 12,
            latency: 8,
            fill_level: FillLevel::L2,
            rq_size: 32,
            wq_size: 32,
            pq_size: 0,
            mshr_size: 16,
            processed_size: ROB_SIZE,
            max_read: 1,
            max_fill: 1,
        }
    }

    #[must_use]
    pub fn l1i(cpu: usize) -> Self {
        Self {
            name: format!("cpu{cpu}_L1I"),
            kind: Kind::L1i,
            num_sets: 64,
            num_ways: 8,
            latency: 4,
            fill_level: FillLevel::L1,
            rq_size: 64,
            wq_size: 64,
            pq_size: 32,
            mshr_size: 8,
            processed_size: ROB_SIZE,
            max_read: 1,
            max_fill: 1,
        }
    }

    #[must_use]
    pub fn l1d(cpu: usize) -> Self {
        Self {
            name: format!("cpu{cpu}_L1D"),
            kind: Kind::L1d,
            num_sets: 64,
            num_ways: 12,
            latency: 5,
            fill_level: FillLevel::L1,
            rq_size: 64,
            wq_size: 64,
            pq_size: 8,
            mshr_size: 16,
            processed_size: ROB_SIZE,
            max_read: 1,
            max_fill: 1,
        }
    }

    #[must_use]
    pub fn l2c(cpu: usize) -> Self {
        Self {
            name: format!("cpu{cpu}_L2C"),
            kind: Kind::L2c,
            num_sets: 1024,
            num_ways: 8,
            latency: 10,
            fill_level: FillLevel::L2,
            rq_size: 32,
            wq_size: 32,
            pq_size: 16,
            mshr_size: 32,
            processed_size: ROB_SIZE,
            max_read: 1,
            max_fill: 1,
        }
    }

    /// The LLC scales with the number of cpus sharing it.
    #[must_use]
    pub fn llc(num_cpus: usize) -> Self {
        Self {
            name: "LLC".to_string(),
            kind: Kind::Llc,
            num_sets: num_cpus * 2048,
            num_ways: 16,
            latency: 20,
            fill_level: FillLevel::Llc,
            rq_size: num_cpus * 32,
            wq_size: num_cpus * 32,
            pq_size: num_cpus * 32,
            mshr_size: num_cpus * 64,
            processed_size: ROB_SIZE,
            max_read: 1,
            max_fill: 1,
        }
    }

    pub fn validate(&self, num_cpus: usize) -> Result<(), ConfigError> {
        if !self.num_sets.is_power_of_two() {
            return Err(ConfigError::SetsNotPowerOfTwo {
                name: self.name.clone(),
                num_sets: self.num_sets,
            });
        }
        if self.kind == Kind::Llc {
            if self.num_ways % num_cpus != 0 {
                return Err(ConfigError::UnevenPartition {
                    name: self.name.clone(),
                    num_ways: self.num_ways,
                    num_cpus,
                });
            }
            if self.num_sets < NUM_SAMPLED_SETS {
                return Err(ConfigError::TooFewSets {
                    name: self.name.clone(),
                    num_sets: self.num_sets,
                });
            }
        }
        Ok(())
    }
}

/// Knobs for assembling a whole hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyConfig {
    pub num_cpus: usize,
    pub dram_latency: u64,
    /// Whether the LLC may decline to install prefetch fills.
    pub llc_bypass_prefetch_fill: bool,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            dram_latency: 200,
            llc_bypass_prefetch_fill: false,
        }
    }
}

impl HierarchyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        CacheConfig::llc(self.num_cpus).validate(self.num_cpus)
    }
}
