//! One cache level: storage, queues, MSHR and the enqueue-side protocol.
//!
//! The per-cycle pipeline (fill, writeback, read, prefetch) lives in
//! [`pipeline`]; victim selection and LRU bookkeeping in [`replacement`].

pub mod pipeline;
pub mod replacement;

use crate::atd::Atd;
use crate::block::Block;
use crate::clock::Clock;
use crate::config::{CacheConfig, ConfigError, Kind};
use crate::mem::{AddressTranslator, Memory, MemoryRef, QueueKind, QueueResult};
use crate::mshr::MshrTable;
use crate::packet::{AccessType, FillLevel, Packet};
use crate::partition::UtilityPartitioner;
use crate::prefetch::Prefetcher;
use crate::queue::PacketQueue;
use crate::sync::Arc;
use crate::{address, LOG2_BLOCK_SIZE, LOG2_PAGE_SIZE};
use itertools::Itertools;

/// Way-partitioning state carried only by the LLC.
#[derive(Debug)]
pub struct LlcState {
    /// Ways currently granted to each cpu; always sums to the associativity.
    pub partitions: Vec<usize>,
    pub atd: Atd,
    pub partitioner: UtilityPartitioner,
    /// Policy toggle: when set, prefetch-typed fills are not installed.
    pub bypass_prefetch_fill: bool,
}

pub struct Builder {
    pub config: CacheConfig,
    pub num_cpus: usize,
    pub clock: Clock,
}

impl Builder {
    pub fn build(self) -> Result<Cache, ConfigError> {
        self.config.validate(self.num_cpus)?;
        let c = self.config;
        let num_cpus = self.num_cpus;

        let mut block: Vec<Vec<Block>> = (0..c.num_sets)
            .map(|_| {
                (0..c.num_ways)
                    .map(|way| Block {
                        lru: way,
                        ..Block::default()
                    })
                    .collect()
            })
            .collect();

        let llc = if c.kind == Kind::Llc {
            // stripe ways over cpus: each cpu starts with an equal partition
            // and its own 0..stripe LRU stack
            let stripe = c.num_ways / num_cpus;
            for set_blocks in &mut block {
                for (way, b) in set_blocks.iter_mut().enumerate() {
                    b.lru = way % stripe;
                    b.cpu = way / stripe;
                }
            }
            Some(LlcState {
                partitions: vec![stripe; num_cpus],
                atd: Atd::new(num_cpus, c.num_sets, c.num_ways),
                partitioner: UtilityPartitioner::new(num_cpus, c.num_ways),
                bypass_prefetch_fill: false,
            })
        } else {
            None
        };

        Ok(Cache {
            wq: PacketQueue::new(format!("{}_WQ", c.name), c.wq_size),
            rq: PacketQueue::new(format!("{}_RQ", c.name), c.rq_size),
            pq: PacketQueue::new(format!("{}_PQ", c.name), c.pq_size),
            mshr: MshrTable::new(format!("{}_MSHR", c.name), c.mshr_size),
            processed: PacketQueue::new(format!("{}_PROCESSED", c.name), c.processed_size),
            name: c.name,
            kind: c.kind,
            num_cpus,
            num_sets: c.num_sets,
            num_ways: c.num_ways,
            latency: c.latency,
            fill_level: c.fill_level,
            max_read: c.max_read,
            max_fill: c.max_fill,
            reads_available_this_cycle: 0,
            clock: self.clock,
            block,
            llc,
            lower_level: None,
            upper_level_icache: (0..num_cpus).map(|_| None).collect(),
            upper_level_dcache: (0..num_cpus).map(|_| None).collect(),
            translator: None,
            prefetcher: None,
            pending_returns: Vec::new(),
            stats: stats::CacheStats::new(num_cpus),
        })
    }
}

pub struct Cache {
    name: String,
    kind: Kind,
    num_cpus: usize,
    num_sets: usize,
    num_ways: usize,
    latency: u64,
    fill_level: FillLevel,
    max_read: usize,
    max_fill: usize,
    pub(crate) reads_available_this_cycle: usize,
    clock: Clock,

    pub block: Vec<Vec<Block>>,
    pub wq: PacketQueue,
    pub rq: PacketQueue,
    pub pq: PacketQueue,
    pub mshr: MshrTable,
    /// Replies ready for the core front-end to consume.
    pub processed: PacketQueue,

    pub(crate) lower_level: Option<MemoryRef>,
    pub(crate) upper_level_icache: Vec<Option<MemoryRef>>,
    pub(crate) upper_level_dcache: Vec<Option<MemoryRef>>,
    pub(crate) translator: Option<Arc<dyn AddressTranslator>>,
    prefetcher: Option<Box<dyn Prefetcher>>,

    pub llc: Option<LlcState>,

    /// Upward replies discovered while an upper level held its own lock
    /// (write-queue forwarding); delivered at the start of the next cycle.
    pending_returns: Vec<Packet>,

    pub stats: stats::CacheStats,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("sets", &self.num_sets)
            .field("ways", &self.num_ways)
            .field("rq", &self.rq.occupancy())
            .field("wq", &self.wq.occupancy())
            .field("pq", &self.pq.occupancy())
            .field("mshr", &self.mshr.occupancy())
            .finish_non_exhaustive()
    }
}

impl Cache {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn fill_level(&self) -> FillLevel {
        self.fill_level
    }

    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.num_sets
    }

    #[must_use]
    pub fn num_ways(&self) -> usize {
        self.num_ways
    }

    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn set_lower_level(&mut self, lower: MemoryRef) {
        self.lower_level = Some(lower);
    }

    pub fn set_upper_level_icache(&mut self, cpu: usize, upper: MemoryRef) {
        self.upper_level_icache[cpu] = Some(upper);
    }

    pub fn set_upper_level_dcache(&mut self, cpu: usize, upper: MemoryRef) {
        self.upper_level_dcache[cpu] = Some(upper);
    }

    pub fn set_translator(&mut self, translator: Arc<dyn AddressTranslator>) {
        self.translator = Some(translator);
    }

    pub fn set_prefetcher(&mut self, prefetcher: Box<dyn Prefetcher>) {
        self.prefetcher = Some(prefetcher);
        if let Some(mut prefetcher) = self.prefetcher.take() {
            prefetcher.initialize(self);
            self.prefetcher = Some(prefetcher);
        }
    }

    pub fn set_bypass_prefetch_fill(&mut self, enabled: bool) {
        if let Some(llc) = self.llc.as_mut() {
            llc.bypass_prefetch_fill = enabled;
        }
    }

    /// Low bits of the block address select the set.
    #[must_use]
    pub fn get_set(&self, address: address) -> usize {
        (address & (self.num_sets as u64 - 1)) as usize
    }

    /// Tag probe without replacement side effects.
    #[must_use]
    pub fn get_way(&self, address: address, set: usize) -> Option<usize> {
        self.block[set]
            .iter()
            .position(|b| b.valid && b.tag == address)
    }

    /// Way holding `packet`'s block, if resident. LLC tags are additionally
    /// qualified by the owning cpu.
    #[must_use]
    pub fn check_hit(&self, packet: &Packet) -> Option<usize> {
        let set = self.get_set(packet.address);
        assert!(
            set < self.num_sets,
            "[{}] invalid set index {set} for address {:#x}",
            self.name,
            packet.address
        );
        self.block[set].iter().position(|b| {
            b.valid
                && b.tag == packet.address
                && (self.kind != Kind::Llc || b.cpu == packet.cpu)
        })
    }

    /// Drop a resident block, reporting the way it occupied.
    pub fn invalidate_entry(&mut self, inval_addr: address) -> Option<usize> {
        let set = self.get_set(inval_addr);
        let way = self.get_way(inval_addr, set)?;
        self.block[set][way].valid = false;
        Some(way)
    }

    fn stamp_latency(&self, packet: &mut Packet) {
        let now = self.clock.cycle(packet.cpu);
        if packet.event_cycle < now {
            packet.event_cycle = now + self.latency;
        } else {
            packet.event_cycle += self.latency;
        }
    }

    pub fn add_rq(&mut self, packet: &mut Packet) -> QueueResult {
        // a pending writeback already carries the data
        if let Some(wq_index) = self.wq.check_queue(packet) {
            packet.data = self.wq.get(wq_index).expect("checked index").data;
            if packet.fill_level < self.fill_level {
                self.pending_returns.push(packet.clone());
            }
            debug_assert!(
                !matches!(self.kind, Kind::Itlb | Kind::Dtlb | Kind::L1i),
                "[{}] unexpected write-forward",
                self.name
            );
            if self.kind == Kind::L1d
                && packet.ty != AccessType::Prefetch
                && !self.processed.is_full()
            {
                self.processed.push(packet.clone());
            }
            log::trace!(
                "[{}_RQ] instr_id {} found recent writeback for {:#x}",
                self.name,
                packet.instr_id,
                packet.address
            );
            self.stats.record_forward_hit(packet.ty);
            self.wq.stats.forward += 1;
            self.rq.stats.access += 1;
            return QueueResult::Queued;
        }

        if let Some(index) = self.rq.check_queue(packet) {
            let entry = self.rq.get_mut(index).expect("checked index");
            if packet.instruction {
                entry.rob_index_depend_on_me.set(packet.rob_index, true);
                entry.instruction = true;
                entry.instr_merged = true;
            } else {
                if packet.ty == AccessType::Rfo {
                    entry.sq_index_depend_on_me.set(packet.sq_index, true);
                    entry.store_merged = true;
                } else {
                    entry.lq_index_depend_on_me.set(packet.lq_index, true);
                    entry.load_merged = true;
                }
                entry.is_data = true;
            }
            entry.merge_routing(packet);
            self.rq.stats.merged += 1;
            self.rq.stats.access += 1;
            return QueueResult::Merged(index);
        }

        if self.rq.is_full() {
            self.rq.stats.full += 1;
            return QueueResult::Full;
        }

        let mut entry = packet.clone();
        self.stamp_latency(&mut entry);
        log::trace!(
            "[{}_RQ] queue instr_id {} address {:#x} type {} event {}",
            self.name,
            entry.instr_id,
            entry.address,
            entry.ty,
            entry.event_cycle
        );
        self.rq.push(entry);
        self.rq.stats.to_cache += 1;
        self.rq.stats.access += 1;
        QueueResult::Queued
    }

    pub fn add_wq(&mut self, packet: &mut Packet) -> QueueResult {
        if let Some(index) = self.wq.check_queue(packet) {
            self.wq.stats.merged += 1;
            self.wq.stats.access += 1;
            return QueueResult::Merged(index);
        }

        if self.wq.is_full() {
            self.wq.stats.full += 1;
            return QueueResult::Full;
        }

        let mut entry = packet.clone();
        self.stamp_latency(&mut entry);
        log::trace!(
            "[{}_WQ] queue instr_id {} address {:#x} event {}",
            self.name,
            entry.instr_id,
            entry.address,
            entry.event_cycle
        );
        self.wq.push(entry);
        self.wq.stats.to_cache += 1;
        self.wq.stats.access += 1;
        QueueResult::Queued
    }

    pub fn add_pq(&mut self, packet: &mut Packet) -> QueueResult {
        if let Some(wq_index) = self.wq.check_queue(packet) {
            packet.data = self.wq.get(wq_index).expect("checked index").data;
            if packet.fill_level < self.fill_level {
                self.pending_returns.push(packet.clone());
            }
            self.stats.record_forward_hit(packet.ty);
            self.wq.stats.forward += 1;
            self.pq.stats.access += 1;
            return QueueResult::Queued;
        }

        if let Some(index) = self.pq.check_queue(packet) {
            let entry = self.pq.get_mut(index).expect("checked index");
            entry.instruction |= packet.instruction;
            entry.is_data |= packet.is_data;
            entry.merge_routing(packet);
            self.pq.stats.merged += 1;
            self.pq.stats.access += 1;
            return QueueResult::Merged(index);
        }

        if self.pq.is_full() {
            self.pq.stats.full += 1;
            return QueueResult::Full;
        }

        let mut entry = packet.clone();
        self.stamp_latency(&mut entry);
        self.pq.push(entry);
        self.pq.stats.to_cache += 1;
        self.pq.stats.access += 1;
        QueueResult::Queued
    }

    pub(crate) fn return_data_inner(&mut self, packet: &Packet) {
        let Some(index) = self.mshr.check(packet) else {
            panic!(
                "[{}] return_data: no MSHR entry for address {:#x} instr_id {}",
                self.name, packet.address, packet.instr_id
            );
        };
        let now = self.clock.cycle(packet.cpu);
        let entry = self.mshr.get(index).expect("checked index");
        let event_cycle = if entry.event_cycle < now {
            now + self.latency
        } else {
            entry.event_cycle + self.latency
        };
        self.mshr.complete(index, packet, event_cycle);
        log::debug!(
            "[{}_MSHR] return_data address {:#x} matures at {}",
            self.name,
            packet.address,
            event_cycle
        );
    }

    /// Inject a prefetch into this cache's own PQ. Rejected without side
    /// effects (beyond the request counter) when the PQ is full or the
    /// prefetch would cross a page boundary.
    pub fn prefetch_line(
        &mut self,
        cpu: usize,
        ip: address,
        base_addr: address,
        pf_addr: address,
        fill_level: FillLevel,
        metadata: u32,
    ) -> bool {
        self.stats.prefetch.requested += 1;
        if self.pq.is_full() {
            return false;
        }
        if base_addr >> LOG2_PAGE_SIZE != pf_addr >> LOG2_PAGE_SIZE {
            return false;
        }
        let mut packet = Packet {
            fill_level,
            pf_origin_level: self.fill_level,
            fill_l1d: fill_level == FillLevel::L1,
            pf_metadata: metadata,
            cpu,
            address: pf_addr >> LOG2_BLOCK_SIZE,
            full_addr: pf_addr,
            ip,
            ty: AccessType::Prefetch,
            event_cycle: self.clock.cycle(cpu),
            ..Packet::default()
        };
        self.add_pq(&mut packet);
        self.stats.prefetch.issued += 1;
        true
    }

    /// [`Self::prefetch_line`] variant carrying replacement metadata for
    /// lookahead prefetchers; the metadata lands in the installed block.
    #[allow(clippy::too_many_arguments)]
    pub fn kpc_prefetch_line(
        &mut self,
        cpu: usize,
        base_addr: address,
        pf_addr: address,
        fill_level: FillLevel,
        delta: i32,
        depth: i32,
        signature: u32,
        confidence: u32,
        metadata: u32,
    ) -> bool {
        if self.pq.is_full() {
            return false;
        }
        if base_addr >> LOG2_PAGE_SIZE != pf_addr >> LOG2_PAGE_SIZE {
            return false;
        }
        let mut packet = Packet {
            fill_level,
            pf_origin_level: self.fill_level,
            fill_l1d: fill_level == FillLevel::L1,
            pf_metadata: metadata,
            cpu,
            address: pf_addr >> LOG2_BLOCK_SIZE,
            full_addr: pf_addr,
            ip: 0,
            ty: AccessType::Prefetch,
            delta,
            depth,
            signature,
            confidence,
            event_cycle: self.clock.cycle(cpu),
            ..Packet::default()
        };
        self.add_pq(&mut packet);
        self.stats.prefetch.issued += 1;
        true
    }

    /// Advance one simulated cycle: deferred replies, partition upkeep, then
    /// fills, writebacks, reads and leftover-bandwidth prefetches.
    pub fn operate(&mut self) {
        self.drain_pending_returns();
        if self.kind == Kind::Llc {
            self.check_partition();
        }
        self.handle_fill();
        self.handle_writeback();
        self.reads_available_this_cycle = self.max_read;
        self.handle_read();
        if self.pq.occupancy() > 0 && self.reads_available_this_cycle > 0 {
            self.handle_prefetch();
        }
    }

    fn check_partition(&mut self) {
        let cycle = self.clock.cycle(0);
        let Some(llc) = self.llc.as_mut() else { return };
        if !llc.partitioner.due(cycle) {
            return;
        }
        if llc.partitioner.epoch() == 0 {
            eprintln!(
                "partition changes every {} cycles:",
                crate::partition::PARTITION_INTERVAL
            );
        }
        let new_alloc = llc.partitioner.reallocate(&mut llc.atd.hit_counts);
        eprintln!(
            "{} {}",
            llc.partitioner.epoch() * crate::partition::PARTITION_INTERVAL,
            new_alloc.iter().join(" ")
        );
        log::debug!(
            "{}",
            console::style(format!(
                "[{}] repartition at cycle {cycle}: {new_alloc:?}",
                self.name
            ))
            .magenta()
        );
        crate::partition::apply_allocations(&mut self.block, &mut llc.partitions, &new_alloc);
    }

    fn drain_pending_returns(&mut self) {
        if self.pending_returns.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_returns);
        for packet in &pending {
            self.return_data_upward(packet);
        }
    }

    /// Deliver a resolved packet to the upper level(s) its routing bits name.
    pub(crate) fn return_data_upward(&self, packet: &Packet) {
        let cpu = packet.cpu;
        if self.fill_level == FillLevel::L2 {
            if packet.fill_l1i {
                if let Some(upper) = &self.upper_level_icache[cpu] {
                    upper.lock().return_data(packet);
                }
            }
            if packet.fill_l1d {
                if let Some(upper) = &self.upper_level_dcache[cpu] {
                    upper.lock().return_data(packet);
                }
            }
        } else {
            if packet.instruction {
                if let Some(upper) = &self.upper_level_icache[cpu] {
                    upper.lock().return_data(packet);
                }
            }
            if packet.is_data {
                if let Some(upper) = &self.upper_level_dcache[cpu] {
                    upper.lock().return_data(packet);
                }
            }
        }
    }

    pub(crate) fn prefetcher_operate(
        &mut self,
        cpu: usize,
        addr: address,
        ip: address,
        cache_hit: bool,
        ty: AccessType,
        metadata_in: u32,
    ) -> u32 {
        let Some(mut prefetcher) = self.prefetcher.take() else {
            return metadata_in;
        };
        let metadata = prefetcher.operate(self, cpu, addr, ip, cache_hit, ty, metadata_in);
        self.prefetcher = Some(prefetcher);
        metadata
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn prefetcher_cache_fill(
        &mut self,
        cpu: usize,
        addr: address,
        set: usize,
        way: usize,
        prefetch: bool,
        evicted_addr: address,
        metadata_in: u32,
    ) -> u32 {
        let Some(mut prefetcher) = self.prefetcher.take() else {
            return metadata_in;
        };
        let metadata =
            prefetcher.cache_fill(self, cpu, addr, set, way, prefetch, evicted_addr, metadata_in);
        self.prefetcher = Some(prefetcher);
        metadata
    }

    pub fn prefetcher_final_stats(&mut self) {
        if let Some(prefetcher) = self.prefetcher.take() {
            prefetcher.final_stats(self);
            self.prefetcher = Some(prefetcher);
        }
    }

    #[must_use]
    pub fn report(&self) -> stats::CacheReport {
        stats::CacheReport {
            stats: self.stats.clone(),
            rq: self.rq.stats,
            wq: self.wq.stats,
            pq: self.pq.stats,
        }
    }
}

impl Memory for Cache {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_rq(&mut self, packet: &mut Packet) -> QueueResult {
        Cache::add_rq(self, packet)
    }

    fn add_wq(&mut self, packet: &mut Packet) -> QueueResult {
        Cache::add_wq(self, packet)
    }

    fn add_pq(&mut self, packet: &mut Packet) -> QueueResult {
        Cache::add_pq(self, packet)
    }

    fn return_data(&mut self, packet: &Packet) {
        self.return_data_inner(packet);
    }

    fn operate(&mut self) {
        Cache::operate(self);
    }

    fn get_occupancy(&self, queue: QueueKind, _address: address) -> usize {
        match queue {
            QueueKind::Mshr => self.mshr.occupancy(),
            QueueKind::Read => self.rq.occupancy(),
            QueueKind::Write => self.wq.occupancy(),
            QueueKind::Prefetch => self.pq.occupancy(),
        }
    }

    fn get_size(&self, queue: QueueKind, _address: address) -> usize {
        match queue {
            QueueKind::Mshr => self.mshr.size(),
            QueueKind::Read => self.rq.size(),
            QueueKind::Write => self.wq.size(),
            QueueKind::Prefetch => self.pq.size(),
        }
    }

    fn increment_wq_full(&mut self, _address: address) {
        self.wq.stats.full += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::{Builder, Cache};
    use crate::clock::Clock;
    use crate::config::CacheConfig;
    use crate::mem::{FixedOffsetTranslator, Memory, MemoryRef, QueueKind, QueueResult};
    use crate::packet::{AccessType, FillLevel, Packet, ReturnState};
    use crate::sync::{Arc, Mutex};
    use crate::{LOG2_BLOCK_SIZE, LOG2_PAGE_SIZE};

    /// Records whatever its neighbour sends it; capacities are adjustable to
    /// provoke back-pressure.
    #[derive(Debug)]
    struct MockLevel {
        rq: Vec<Packet>,
        wq: Vec<Packet>,
        pq: Vec<Packet>,
        rq_capacity: usize,
        wq_capacity: usize,
        pq_capacity: usize,
        returned: Vec<Packet>,
        wq_full_notifications: u64,
    }

    impl Default for MockLevel {
        fn default() -> Self {
            Self {
                rq: Vec::new(),
                wq: Vec::new(),
                pq: Vec::new(),
                rq_capacity: 64,
                wq_capacity: 64,
                pq_capacity: 64,
                returned: Vec::new(),
                wq_full_notifications: 0,
            }
        }
    }

    impl Memory for MockLevel {
        fn name(&self) -> &str {
            "mock"
        }

        fn add_rq(&mut self, packet: &mut Packet) -> QueueResult {
            if self.rq.len() >= self.rq_capacity {
                return QueueResult::Full;
            }
            self.rq.push(packet.clone());
            QueueResult::Queued
        }

        fn add_wq(&mut self, packet: &mut Packet) -> QueueResult {
            if self.wq.len() >= self.wq_capacity {
                return QueueResult::Full;
            }
            self.wq.push(packet.clone());
            QueueResult::Queued
        }

        fn add_pq(&mut self, packet: &mut Packet) -> QueueResult {
            if self.pq.len() >= self.pq_capacity {
                return QueueResult::Full;
            }
            self.pq.push(packet.clone());
            QueueResult::Queued
        }

        fn return_data(&mut self, packet: &Packet) {
            self.returned.push(packet.clone());
        }

        fn operate(&mut self) {}

        fn get_occupancy(&self, queue: QueueKind, _address: u64) -> usize {
            match queue {
                QueueKind::Mshr => 0,
                QueueKind::Read => self.rq.len(),
                QueueKind::Write => self.wq.len(),
                QueueKind::Prefetch => self.pq.len(),
            }
        }

        fn get_size(&self, queue: QueueKind, _address: u64) -> usize {
            match queue {
                QueueKind::Mshr => usize::MAX,
                QueueKind::Read => self.rq_capacity,
                QueueKind::Write => self.wq_capacity,
                QueueKind::Prefetch => self.pq_capacity,
            }
        }

        fn increment_wq_full(&mut self, _address: u64) {
            self.wq_full_notifications += 1;
        }
    }

    fn build(config: CacheConfig, num_cpus: usize, clock: &Clock) -> Cache {
        Builder {
            config,
            num_cpus,
            clock: clock.clone(),
        }
        .build()
        .unwrap()
    }

    fn attach_lower(cache: &mut Cache) -> Arc<Mutex<MockLevel>> {
        let lower = Arc::new(Mutex::new(MockLevel::default()));
        let handle: MemoryRef = lower.clone();
        cache.set_lower_level(handle);
        lower
    }

    fn run(cache: &mut Cache, clock: &Clock, cycles: u64) {
        for _ in 0..cycles {
            clock.tick_all();
            cache.operate();
        }
    }

    fn load(address: u64) -> Packet {
        Packet {
            address,
            full_addr: address << LOG2_BLOCK_SIZE,
            ty: AccessType::Load,
            fill_level: FillLevel::L1,
            fill_l1d: true,
            is_data: true,
            ..Packet::default()
        }
    }

    fn rfo(address: u64) -> Packet {
        Packet {
            ty: AccessType::Rfo,
            ..load(address)
        }
    }

    /// Drive one demand miss through allocation, completion and fill.
    fn miss_round_trip(cache: &mut Cache, clock: &Clock, mut packet: Packet) {
        assert_eq!(cache.add_rq(&mut packet), QueueResult::Queued);
        run(cache, clock, 10);
        cache.return_data_inner(&packet);
        run(cache, clock, 10);
    }

    #[test]
    fn rq_duplicates_merge_without_growing_occupancy() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l1d(0), 1, &clock);

        let mut first = load(0x40);
        first.lq_index = 2;
        assert_eq!(cache.add_rq(&mut first), QueueResult::Queued);
        assert_eq!(cache.rq.occupancy(), 1);

        let mut second = Packet {
            lq_index: 9,
            ..load(0x40)
        };
        let merged = cache.add_rq(&mut second);
        assert!(matches!(merged, QueueResult::Merged(_)));
        assert_eq!(cache.rq.occupancy(), 1);
        assert_eq!(cache.rq.stats.merged, 1);

        let QueueResult::Merged(index) = merged else {
            unreachable!()
        };
        let entry = cache.rq.get(index).unwrap();
        assert!(entry.load_merged);
        assert!(entry.lq_index_depend_on_me[9]);
        assert!(entry.is_data);
    }

    #[test]
    fn rq_full_returns_full_and_counts() {
        let clock = Clock::new(1);
        let config = CacheConfig {
            rq_size: 2,
            ..CacheConfig::l1d(0)
        };
        let mut cache = build(config, 1, &clock);
        assert_eq!(cache.add_rq(&mut load(0x40)), QueueResult::Queued);
        assert_eq!(cache.add_rq(&mut load(0x80)), QueueResult::Queued);
        assert_eq!(cache.add_rq(&mut load(0xc0)), QueueResult::Full);
        assert_eq!(cache.rq.stats.full, 1);
        assert_eq!(cache.rq.occupancy(), 2);
    }

    #[test]
    fn pending_writeback_forwards_reads() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l2c(0), 1, &clock);
        let mut writeback = Packet {
            ty: AccessType::Writeback,
            data: 0xfeed,
            fill_level: FillLevel::Llc,
            ..load(0x40)
        };
        assert_eq!(cache.add_wq(&mut writeback), QueueResult::Queued);

        let mut read = load(0x40);
        assert_eq!(cache.add_rq(&mut read), QueueResult::Queued);
        assert_eq!(read.data, 0xfeed);
        assert_eq!(cache.rq.occupancy(), 0, "forwarded read never queues");
        assert_eq!(cache.wq.stats.forward, 1);
        assert_eq!(cache.stats.hit[AccessType::Load], 1);
    }

    #[test]
    fn demand_miss_allocates_mshr_and_forwards_down() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l1d(0), 1, &clock);
        let lower = attach_lower(&mut cache);

        let mut packet = load(0x7c0);
        assert_eq!(cache.add_rq(&mut packet), QueueResult::Queued);
        run(&mut cache, &clock, 10);

        assert_eq!(cache.mshr.occupancy(), 1);
        assert_eq!(cache.rq.occupancy(), 0);
        assert_eq!(cache.stats.miss[AccessType::Load], 1);
        assert_eq!(lower.lock().rq.len(), 1);
        assert_eq!(lower.lock().rq[0].address, 0x7c0);
    }

    #[test]
    fn mshr_coalesces_followup_demand() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l1d(0), 1, &clock);
        let _lower = attach_lower(&mut cache);

        let mut first = load(0x200);
        cache.add_rq(&mut first);
        run(&mut cache, &clock, 10);
        assert_eq!(cache.mshr.occupancy(), 1);

        let mut second = Packet {
            lq_index: 17,
            ..load(0x200)
        };
        cache.add_rq(&mut second);
        run(&mut cache, &clock, 10);

        assert_eq!(cache.mshr.occupancy(), 1, "no second entry for the block");
        assert_eq!(cache.stats.mshr_merged[AccessType::Load], 1);
        let index = cache.mshr.check(&second).unwrap();
        let entry = cache.mshr.get(index).unwrap();
        assert!(entry.load_merged);
        assert!(entry.lq_index_depend_on_me[17]);
    }

    #[test]
    fn cold_miss_round_trip_installs_mru_block() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l1d(0), 1, &clock);
        let _lower = attach_lower(&mut cache);

        miss_round_trip(&mut cache, &clock, load(0x3c0));

        let set = cache.get_set(0x3c0);
        let way = cache.get_way(0x3c0, set).expect("installed");
        assert!(cache.block[set][way].valid);
        assert_eq!(cache.block[set][way].lru, 0);
        assert_eq!(cache.mshr.occupancy(), 0);
        assert_eq!(cache.stats.sim[0].miss[AccessType::Load], 1);
        assert_eq!(cache.processed.occupancy(), 1);

        assert_eq!(cache.invalidate_entry(0x3c0), Some(way));
        assert!(cache.get_way(0x3c0, set).is_none());
        assert_eq!(cache.invalidate_entry(0x3c0), None);
    }

    #[test]
    fn next_line_prefetcher_injects_into_own_pq() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l1d(0), 1, &clock);
        let lower = attach_lower(&mut cache);
        cache.set_prefetcher(Box::new(crate::prefetch::NextLinePrefetcher));

        let mut packet = load(0x40);
        cache.add_rq(&mut packet);
        run(&mut cache, &clock, 10);

        // the demand miss went down the RQ, its next-line shadow into our PQ
        assert_eq!(lower.lock().rq.len(), 1);
        assert_eq!(cache.stats.prefetch.issued, 1);
        let next = Packet {
            address: 0x41,
            ..Packet::default()
        };
        assert!(cache.pq.check_queue(&next).is_some() || cache.mshr.check(&next).is_some());
    }

    #[test]
    fn thirteenth_fill_evicts_dirty_rfo_victim_to_lower_wq() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l1d(0), 1, &clock);
        let lower = attach_lower(&mut cache);

        // twelve RFO fills land in set 0 and are born dirty
        for i in 1..=12u64 {
            miss_round_trip(&mut cache, &clock, rfo(i * 64));
        }
        let set = cache.get_set(64);
        assert!(cache.block[set].iter().all(|b| b.valid && b.dirty));
        let victim_way = cache
            .block[set]
            .iter()
            .position(|b| b.lru == cache.num_ways() - 1)
            .unwrap();
        let victim_addr = cache.block[set][victim_way].address;
        assert_eq!(victim_addr, 64, "first fill is stalest");

        let wb_before = lower.lock().wq.len();
        miss_round_trip(&mut cache, &clock, load(13 * 64));

        let lower = lower.lock();
        assert_eq!(lower.wq.len(), wb_before + 1);
        let writeback = lower.wq.last().unwrap();
        assert_eq!(writeback.ty, AccessType::Writeback);
        assert_eq!(writeback.address, victim_addr);
        assert_eq!(writeback.fill_level, FillLevel::L2);
        assert!(cache.get_way(13 * 64, set).is_some());
        assert!(cache.get_way(victim_addr, set).is_none());
    }

    #[test]
    fn full_lower_wq_stalls_fill_and_preserves_victim() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l1d(0), 1, &clock);
        let lower = attach_lower(&mut cache);

        for i in 1..=12u64 {
            miss_round_trip(&mut cache, &clock, rfo(i * 64));
        }
        lower.lock().wq_capacity = 0;

        let mut packet = load(13 * 64);
        cache.add_rq(&mut packet);
        run(&mut cache, &clock, 10);
        cache.return_data_inner(&packet);
        run(&mut cache, &clock, 10);

        // the fill could not displace its dirty victim
        let set = cache.get_set(64);
        assert!(cache.get_way(13 * 64, set).is_none());
        assert!(cache.get_way(64, set).is_some());
        assert_eq!(cache.mshr.occupancy(), 1, "entry survives the stall");
        assert!(lower.lock().wq_full_notifications > 0);
        assert!(cache.stats.stall[AccessType::Load] > 0);

        // releasing the back-pressure lets the retry through
        lower.lock().wq_capacity = 64;
        run(&mut cache, &clock, 2);
        assert!(cache.get_way(13 * 64, set).is_some());
        assert_eq!(cache.mshr.occupancy(), 0);
        assert_eq!(lower.lock().wq.len(), 1);
    }

    #[test]
    fn demand_supersedes_inflight_prefetch_preserving_completion() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l2c(0), 1, &clock);
        let lower = attach_lower(&mut cache);

        // a prefetch destined for this level goes out first
        assert!(cache.prefetch_line(0, 0x4000, 0x9000, 0x9040, FillLevel::L2, 7));
        run(&mut cache, &clock, 12);
        let probe = Packet {
            address: 0x9040 >> LOG2_BLOCK_SIZE,
            ..Packet::default()
        };
        let index = cache.mshr.check(&probe).expect("prefetch in flight");
        assert_eq!(cache.mshr.get(index).unwrap().ty, AccessType::Prefetch);
        assert_eq!(lower.lock().pq.len(), 1);
        let prior_event = cache.mshr.get(index).unwrap().event_cycle;

        // the demand overtakes it
        let mut demand = load(0x9040 >> LOG2_BLOCK_SIZE);
        demand.instr_id = 42;
        cache.add_rq(&mut demand);
        run(&mut cache, &clock, 12);

        let entry = cache.mshr.get(index).unwrap();
        assert_eq!(entry.ty, AccessType::Load);
        assert_eq!(entry.instr_id, 42);
        assert!(entry.fill_l1d);
        assert_eq!(entry.fill_level, FillLevel::L1);
        assert_eq!(entry.returned, ReturnState::InFlight);
        assert_eq!(entry.event_cycle, prior_event);
        assert_eq!(cache.stats.mshr_merged[AccessType::Load], 1);
    }

    #[test]
    fn prefetch_for_higher_level_passes_through_without_mshr() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l2c(0), 1, &clock);
        let lower = attach_lower(&mut cache);

        // fill level LLC at an L2: pass through to the lower PQ
        let mut packet = Packet {
            ty: AccessType::Prefetch,
            fill_level: FillLevel::Llc,
            pf_origin_level: FillLevel::Llc,
            ..load(0x5500)
        };
        packet.fill_l1d = false;
        cache.add_pq(&mut packet);
        run(&mut cache, &clock, 12);

        assert_eq!(cache.mshr.occupancy(), 0);
        assert_eq!(lower.lock().pq.len(), 1);
        assert_eq!(cache.stats.miss[AccessType::Prefetch], 1);
    }

    #[test]
    fn cross_page_prefetch_rejected() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l1d(0), 1, &clock);
        let base = 0x4000u64;
        let cross = base + crate::PAGE_SIZE;
        assert!(!cache.prefetch_line(0, 0, base, cross, FillLevel::L1, 0));
        assert_eq!(cache.pq.occupancy(), 0);
        assert_eq!(cache.stats.prefetch.requested, 1);
        assert_eq!(cache.stats.prefetch.issued, 0);

        let same_page = base + 64;
        assert!(cache.prefetch_line(0, 0, base, same_page, FillLevel::L1, 0));
        assert_eq!(cache.pq.occupancy(), 1);
        assert_eq!(cache.stats.prefetch.issued, 1);
    }

    #[test]
    fn kpc_prefetch_metadata_lands_in_the_block() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l2c(0), 1, &clock);
        let _lower = attach_lower(&mut cache);

        let pf_addr = 0xa0c0u64;
        assert!(cache.kpc_prefetch_line(0, 0xa000, pf_addr, FillLevel::L2, -2, 3, 0xbeef, 5, 0));
        run(&mut cache, &clock, 12);
        let reply = Packet {
            address: pf_addr >> LOG2_BLOCK_SIZE,
            ..Packet::default()
        };
        cache.return_data_inner(&reply);
        run(&mut cache, &clock, 12);

        let set = cache.get_set(pf_addr >> LOG2_BLOCK_SIZE);
        let way = cache.get_way(pf_addr >> LOG2_BLOCK_SIZE, set).expect("installed");
        let block = &cache.block[set][way];
        assert!(block.prefetch);
        assert_eq!(block.delta, -2);
        assert_eq!(block.depth, 3);
        assert_eq!(block.signature, 0xbeef);
        assert_eq!(block.confidence, 5);
    }

    #[test]
    fn prefetched_block_counts_useful_once_on_demand_hit() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l1d(0), 1, &clock);
        let _lower = attach_lower(&mut cache);

        let mut prefetch = Packet {
            ty: AccessType::Prefetch,
            fill_level: FillLevel::L1,
            ..load(0x140)
        };
        cache.add_pq(&mut prefetch);
        run(&mut cache, &clock, 10);
        cache.return_data_inner(&prefetch);
        run(&mut cache, &clock, 10);
        assert_eq!(cache.stats.prefetch.fill, 1);

        let mut demand = load(0x140);
        cache.add_rq(&mut demand);
        run(&mut cache, &clock, 10);
        assert_eq!(cache.stats.prefetch.useful, 1);
        let set = cache.get_set(0x140);
        let way = cache.get_way(0x140, set).unwrap();
        assert!(!cache.block[set][way].prefetch);
        assert!(cache.block[set][way].used);
    }

    #[test]
    fn stlb_miss_walks_page_table_and_self_completes() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::stlb(0), 1, &clock);
        cache.set_translator(Arc::new(FixedOffsetTranslator { offset_pages: 0x40 }));

        let vaddr = 0x7000u64;
        let vpage = vaddr >> LOG2_PAGE_SIZE;
        let mut packet = Packet {
            address: vpage,
            full_addr: vaddr,
            ty: AccessType::Load,
            fill_level: FillLevel::L2,
            ..Packet::default()
        };
        cache.add_rq(&mut packet);
        run(&mut cache, &clock, 30);

        let set = cache.get_set(vpage);
        let way = cache.get_way(vpage, set).expect("installed");
        assert_eq!(cache.block[set][way].data, (vaddr >> LOG2_PAGE_SIZE) + 0x40);
        assert_eq!(cache.mshr.occupancy(), 0);
        // translations never dirty a TLB line, so no lower level is ever needed
        assert!(cache.block.iter().flatten().all(|b| !b.dirty));
    }

    #[test]
    fn llc_bypass_skips_install_but_still_serves_uppers() {
        let clock = Clock::new(1);
        let config = CacheConfig {
            num_sets: 64,
            ..CacheConfig::llc(1)
        };
        let mut cache = build(config, 1, &clock);
        cache.set_bypass_prefetch_fill(true);
        let lower = attach_lower(&mut cache);
        let upper = Arc::new(Mutex::new(MockLevel::default()));
        let handle: MemoryRef = upper.clone();
        cache.set_upper_level_dcache(0, handle);

        let mut prefetch = Packet {
            ty: AccessType::Prefetch,
            fill_level: FillLevel::L2,
            pf_origin_level: FillLevel::L2,
            is_data: true,
            fill_l1d: false,
            ..load(0x80)
        };
        cache.add_pq(&mut prefetch);
        run(&mut cache, &clock, 25);
        assert_eq!(lower.lock().rq.len(), 1, "LLC prefetch goes to the DRAM RQ");
        assert_eq!(cache.mshr.occupancy(), 1);

        cache.return_data_inner(&prefetch);
        run(&mut cache, &clock, 25);

        // nothing was installed anywhere in the set
        assert!(cache.block.iter().flatten().all(|b| !b.valid));
        assert_eq!(cache.mshr.occupancy(), 0);
        assert_eq!(cache.stats.sim[0].miss[AccessType::Prefetch], 1);
        assert_eq!(upper.lock().returned.len(), 1, "upper level still served");
        assert_eq!(upper.lock().returned[0].address, 0x80);
    }

    #[test]
    fn llc_tags_are_qualified_by_owning_cpu() {
        let clock = Clock::new(2);
        let config = CacheConfig {
            num_sets: 64,
            ..CacheConfig::llc(2)
        };
        let mut cache = build(config, 2, &clock);
        let _lower = attach_lower(&mut cache);

        let mut p0 = load(0x100);
        p0.cpu = 0;
        p0.fill_level = FillLevel::L2;
        cache.add_rq(&mut p0);
        run(&mut cache, &clock, 25);
        cache.return_data_inner(&p0);
        run(&mut cache, &clock, 25);

        let set = cache.get_set(0x100);
        assert!(cache.check_hit(&p0).is_some());
        let mut p1 = p0.clone();
        p1.cpu = 1;
        assert!(
            cache.check_hit(&p1).is_none(),
            "cpu 1 must not hit cpu 0's line"
        );
        assert!(cache.get_way(0x100, set).is_some());
    }

    #[test]
    fn writeback_allocate_installs_dirty_on_miss() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l2c(0), 1, &clock);
        let _lower = attach_lower(&mut cache);

        let mut writeback = Packet {
            ty: AccessType::Writeback,
            fill_level: FillLevel::Llc,
            ..load(0x640)
        };
        writeback.fill_l1d = false;
        cache.add_wq(&mut writeback);
        run(&mut cache, &clock, 15);

        let set = cache.get_set(0x640);
        let way = cache.get_way(0x640, set).expect("writeback-allocated");
        assert!(cache.block[set][way].dirty);
        assert_eq!(cache.mshr.occupancy(), 0, "no MSHR round-trip");
        assert_eq!(cache.stats.sim[0].miss[AccessType::Writeback], 1);
        assert_eq!(cache.wq.occupancy(), 0);
    }

    #[test]
    fn l1d_writeback_miss_is_an_rfo_miss() {
        let clock = Clock::new(1);
        let mut cache = build(CacheConfig::l1d(0), 1, &clock);
        let lower = attach_lower(&mut cache);

        let mut store = rfo(0x280);
        cache.add_wq(&mut store);
        run(&mut cache, &clock, 10);

        assert_eq!(cache.mshr.occupancy(), 1, "RFO miss allocated an MSHR");
        assert_eq!(lower.lock().rq.len(), 1);
        assert_eq!(cache.wq.occupancy(), 0);
        let set = cache.get_set(0x280);
        assert!(cache.get_way(0x280, set).is_none(), "no direct install");
    }
}
