//! Shared per-cpu cycle counters and the warm-up boundary.
//!
//! Caches hold a clone of [`Clock`] instead of reading process globals; the
//! top-level driver advances it once per tick.

use crate::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct Clock {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cycles: Vec<AtomicU64>,
    warmup_complete: Vec<AtomicBool>,
}

impl Clock {
    #[must_use]
    pub fn new(num_cpus: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                cycles: (0..num_cpus).map(|_| AtomicU64::new(0)).collect(),
                warmup_complete: (0..num_cpus).map(|_| AtomicBool::new(false)).collect(),
            }),
        }
    }

    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.inner.cycles.len()
    }

    #[must_use]
    pub fn cycle(&self, cpu: usize) -> u64 {
        self.inner.cycles[cpu].load(Ordering::Relaxed)
    }

    pub fn set_cycle(&self, cpu: usize, cycle: u64) {
        self.inner.cycles[cpu].store(cycle, Ordering::Relaxed);
    }

    /// Advance every core clock by one cycle.
    pub fn tick_all(&self) {
        for cycle in &self.inner.cycles {
            cycle.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn warmup_complete(&self, cpu: usize) -> bool {
        self.inner.warmup_complete[cpu].load(Ordering::Relaxed)
    }

    pub fn complete_warmup(&self) {
        for flag in &self.inner.warmup_complete {
            flag.store(true, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn cycles(&self) -> Vec<u64> {
        (0..self.num_cpus()).map(|cpu| self.cycle(cpu)).collect()
    }
}
