//! Assembles per-cpu cache stacks around the shared LLC and walks them one
//! cycle at a time.

use crate::cache::{Builder, Cache};
use crate::clock::Clock;
use crate::config::{CacheConfig, ConfigError, HierarchyConfig};
use crate::dram::MainMemory;
use crate::mem::{AddressTranslator, FixedOffsetTranslator, Memory, MemoryRef};
use crate::sync::{Arc, Mutex};

pub struct Hierarchy {
    clock: Clock,
    num_cpus: usize,
    pub itlb: Vec<Arc<Mutex<Cache>>>,
    pub dtlb: Vec<Arc<Mutex<Cache>>>,
    pub stlb: Vec<Arc<Mutex<Cache>>>,
    pub l1i: Vec<Arc<Mutex<Cache>>>,
    pub l1d: Vec<Arc<Mutex<Cache>>>,
    pub l2: Vec<Arc<Mutex<Cache>>>,
    pub llc: Arc<Mutex<Cache>>,
    pub dram: Arc<Mutex<MainMemory>>,
}

impl Hierarchy {
    pub fn new(config: &HierarchyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let num_cpus = config.num_cpus;
        let clock = Clock::new(num_cpus);

        let build = |cache_config: CacheConfig| -> Result<Arc<Mutex<Cache>>, ConfigError> {
            Ok(Arc::new(Mutex::new(
                Builder {
                    config: cache_config,
                    num_cpus,
                    clock: clock.clone(),
                }
                .build()?,
            )))
        };

        let dram = Arc::new(Mutex::new(MainMemory::new(
            clock.clone(),
            config.dram_latency,
            num_cpus * 64,
            num_cpus * 64,
        )));

        let llc = build(CacheConfig::llc(num_cpus))?;
        {
            let mut llc = llc.lock();
            let lower: MemoryRef = dram.clone();
            llc.set_lower_level(lower);
            llc.set_bypass_prefetch_fill(config.llc_bypass_prefetch_fill);
        }
        {
            let upper: MemoryRef = llc.clone();
            dram.lock().set_upper_level(upper);
        }

        let translator: Arc<dyn AddressTranslator> =
            Arc::new(FixedOffsetTranslator { offset_pages: 0x0100_0000 });

        let mut itlb = Vec::new();
        let mut dtlb = Vec::new();
        let mut stlb = Vec::new();
        let mut l1i = Vec::new();
        let mut l1d = Vec::new();
        let mut l2 = Vec::new();

        for cpu in 0..num_cpus {
            let cpu_stlb = build(CacheConfig::stlb(cpu))?;
            cpu_stlb.lock().set_translator(translator.clone());

            let cpu_itlb = build(CacheConfig::itlb(cpu))?;
            let cpu_dtlb = build(CacheConfig::dtlb(cpu))?;
            {
                let lower: MemoryRef = cpu_stlb.clone();
                cpu_itlb.lock().set_lower_level(lower);
                let lower: MemoryRef = cpu_stlb.clone();
                cpu_dtlb.lock().set_lower_level(lower);
                let upper: MemoryRef = cpu_itlb.clone();
                cpu_stlb.lock().set_upper_level_icache(cpu, upper);
                let upper: MemoryRef = cpu_dtlb.clone();
                cpu_stlb.lock().set_upper_level_dcache(cpu, upper);
            }

            let cpu_l2 = build(CacheConfig::l2c(cpu))?;
            let cpu_l1i = build(CacheConfig::l1i(cpu))?;
            let cpu_l1d = build(CacheConfig::l1d(cpu))?;
            {
                let lower: MemoryRef = cpu_l2.clone();
                cpu_l1i.lock().set_lower_level(lower);
                let lower: MemoryRef = cpu_l2.clone();
                cpu_l1d.lock().set_lower_level(lower);

                let mut l2_guard = cpu_l2.lock();
                let upper: MemoryRef = cpu_l1i.clone();
                l2_guard.set_upper_level_icache(cpu, upper);
                let upper: MemoryRef = cpu_l1d.clone();
                l2_guard.set_upper_level_dcache(cpu, upper);
                let lower: MemoryRef = llc.clone();
                l2_guard.set_lower_level(lower);
            }
            {
                let mut llc_guard = llc.lock();
                let upper: MemoryRef = cpu_l2.clone();
                llc_guard.set_upper_level_icache(cpu, upper);
                let upper: MemoryRef = cpu_l2.clone();
                llc_guard.set_upper_level_dcache(cpu, upper);
            }

            itlb.push(cpu_itlb);
            dtlb.push(cpu_dtlb);
            stlb.push(cpu_stlb);
            l1i.push(cpu_l1i);
            l1d.push(cpu_l1d);
            l2.push(cpu_l2);
        }

        Ok(Self {
            clock,
            num_cpus,
            itlb,
            dtlb,
            stlb,
            l1i,
            l1d,
            l2,
            llc,
            dram,
        })
    }

    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// One simulated cycle over the whole hierarchy, in a fixed traversal
    /// order: every cpu's private stack from the TLBs down, then the shared
    /// LLC, then memory.
    pub fn tick(&self) {
        self.clock.tick_all();
        for cpu in 0..self.num_cpus {
            self.itlb[cpu].lock().operate();
            self.dtlb[cpu].lock().operate();
            self.stlb[cpu].lock().operate();
            self.l1i[cpu].lock().operate();
            self.l1d[cpu].lock().operate();
            self.l2[cpu].lock().operate();
        }
        self.llc.lock().operate();
        self.dram.lock().operate();
    }

    pub fn run(&self, cycles: u64) {
        for _ in 0..cycles {
            self.tick();
        }
    }

    #[must_use]
    pub fn report(&self) -> stats::Report {
        let mut report = stats::Report::new(self.clock.cycles());
        for cpu in 0..self.num_cpus {
            for cache in [
                &self.itlb[cpu],
                &self.dtlb[cpu],
                &self.stlb[cpu],
                &self.l1i[cpu],
                &self.l1d[cpu],
                &self.l2[cpu],
            ] {
                let cache = cache.lock();
                report.insert(cache.name().to_string(), cache.report());
            }
        }
        let llc = self.llc.lock();
        report.insert(llc.name().to_string(), llc.report());
        report
    }
}
