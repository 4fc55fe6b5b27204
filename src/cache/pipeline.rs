//! The four per-cycle phases: fill, writeback, read, prefetch.
//!
//! Ordering matters: fills free MSHRs, writebacks make room in lower write
//! queues, reads consume the released capacity and prefetches take whatever
//! read bandwidth is left.

use super::Cache;
use crate::config::Kind;
use crate::mem::QueueKind;
use crate::packet::{AccessType, Packet};
use crate::LOG2_BLOCK_SIZE;

impl Cache {
    /// Install the earliest matured MSHR entry, evicting (and writing back)
    /// a victim as needed.
    pub(crate) fn handle_fill(&mut self) {
        for _ in 0..self.max_fill {
            let Some((mshr_index, fill_cycle)) = self.mshr.next_fill() else {
                return;
            };
            let fill_cpu = self.mshr.get(mshr_index).expect("next fill entry").cpu;
            if fill_cycle > self.clock.cycle(fill_cpu) {
                return;
            }
            let mut entry = self.mshr.get(mshr_index).expect("next fill entry").clone();
            let set = self.get_set(entry.address);
            let warm = self.clock.warmup_complete(fill_cpu);

            let Some(way) = self.find_victim(fill_cpu, set, &entry) else {
                // bypass: the set is untouched, upper levels still get served
                self.stats.record_fill(fill_cpu, entry.ty, warm);
                if entry.fill_level < self.fill_level {
                    self.return_data_upward(&entry);
                }
                self.accumulate_miss_latency(&entry, fill_cpu, warm);
                self.mshr.remove(mshr_index);
                return;
            };

            if !self.evict_if_dirty(set, way, fill_cpu, entry.instr_id, entry.ty) {
                // lower WQ full; keep the MSHR entry and retry next cycle
                return;
            }

            if !matches!(self.kind, Kind::Itlb | Kind::Dtlb | Kind::Stlb) {
                let (cb_addr, cb_evicted) = self.fill_callback_addrs(set, way, &entry);
                let is_prefetch = entry.ty == AccessType::Prefetch;
                entry.pf_metadata = self.prefetcher_cache_fill(
                    fill_cpu,
                    cb_addr,
                    set,
                    way,
                    is_prefetch,
                    cb_evicted,
                    entry.pf_metadata,
                );
            }

            self.update_replacement_state(fill_cpu, set, way);
            self.stats.record_fill(fill_cpu, entry.ty, warm);
            self.fill_cache(set, way, &entry);

            // an RFO-filled L1D line is born dirty
            if self.kind == Kind::L1d && entry.ty == AccessType::Rfo {
                self.block[set][way].dirty = true;
            }

            if entry.fill_level < self.fill_level {
                self.return_data_upward(&entry);
            }

            match self.kind {
                Kind::Itlb => {
                    entry.instruction_pa = self.block[set][way].data;
                    self.push_processed(&entry);
                }
                Kind::Dtlb => {
                    entry.data_pa = self.block[set][way].data;
                    self.push_processed(&entry);
                }
                Kind::L1i => self.push_processed(&entry),
                Kind::L1d if entry.ty != AccessType::Prefetch => self.push_processed(&entry),
                _ => {}
            }

            self.accumulate_miss_latency(&entry, fill_cpu, warm);
            self.mshr.remove(mshr_index);
            log::debug!(
                "[{}] fill {:#x} set {set} way {way} cpu {fill_cpu}",
                self.name,
                entry.address
            );
        }
    }

    /// Service the oldest matured write-queue entry.
    pub(crate) fn handle_writeback(&mut self) {
        let Some(head) = self.wq.head() else { return };
        let wb_cpu = head.cpu;
        if head.event_cycle > self.clock.cycle(wb_cpu) {
            return;
        }
        let mut entry = head.clone();
        let set = self.get_set(entry.address);
        let way = self.check_hit(&entry);
        let warm = self.clock.warmup_complete(wb_cpu);

        // sampled sets feed the shadow directories; writes install on a
        // shadow miss but do not promote on a shadow hit
        if let Some(llc) = self.llc.as_mut() {
            if llc.atd.is_sampled(set) && llc.atd.probe(&entry, set).is_none() {
                let shadow_way = llc.atd.victim(entry.cpu, set);
                llc.atd.fill(set, shadow_way, &entry);
                llc.atd.promote(set, shadow_way, entry.cpu);
            }
        }

        if let Some(way) = way {
            // writeback hit (RFO hit for L1D)
            self.update_replacement_state(wb_cpu, set, way);
            self.stats.record_hit(wb_cpu, entry.ty, warm);
            self.block[set][way].dirty = true;
            match self.kind {
                Kind::Itlb => entry.instruction_pa = self.block[set][way].data,
                Kind::Dtlb => entry.data_pa = self.block[set][way].data,
                Kind::Stlb => entry.data = self.block[set][way].data,
                _ => {}
            }
            if entry.fill_level < self.fill_level {
                self.return_data_upward(&entry);
            }
            self.wq.pop_head();
        } else if self.kind == Kind::L1d {
            // RFO miss allocates through the MSHR like a demand miss
            let mut miss_handled = true;
            match self.mshr.check(&entry) {
                None if !self.mshr.is_full() => {
                    let now = self.clock.cycle(wb_cpu);
                    self.mshr.allocate(&entry, now);
                    let lower = self
                        .lower_level
                        .clone()
                        .unwrap_or_else(|| panic!("[{}] L1D has no lower level", self.name));
                    let mut forward = entry.clone();
                    lower.lock().add_rq(&mut forward);
                }
                None => {
                    miss_handled = false;
                    self.stats.stall[entry.ty] += 1;
                }
                Some(index) => {
                    self.coalesce_routing_only(index, &entry);
                    self.stats.mshr_merged[entry.ty] += 1;
                }
            }
            if miss_handled {
                self.stats.record_miss_handled(entry.ty);
                self.wq.pop_head();
            }
        } else {
            // writeback-allocate: install directly, no MSHR round-trip
            let way = self
                .find_victim(wb_cpu, set, &entry)
                .unwrap_or_else(|| {
                    panic!(
                        "[{}] bypass on a writeback install, address {:#x}",
                        self.name, entry.address
                    )
                });
            if !self.evict_if_dirty(set, way, wb_cpu, entry.instr_id, entry.ty) {
                return;
            }
            if !matches!(self.kind, Kind::Itlb | Kind::Dtlb | Kind::Stlb) {
                let (cb_addr, cb_evicted) = self.fill_callback_addrs(set, way, &entry);
                entry.pf_metadata = self.prefetcher_cache_fill(
                    wb_cpu,
                    cb_addr,
                    set,
                    way,
                    false,
                    cb_evicted,
                    entry.pf_metadata,
                );
            }
            self.update_replacement_state(wb_cpu, set, way);
            self.stats.record_fill(wb_cpu, entry.ty, warm);
            self.fill_cache(set, way, &entry);
            self.block[set][way].dirty = true;
            if entry.fill_level < self.fill_level {
                self.return_data_upward(&entry);
            }
            self.stats.record_miss_handled(entry.ty);
            self.wq.pop_head();
        }
    }

    /// Consume up to `MAX_READ` matured read-queue heads.
    pub(crate) fn handle_read(&mut self) {
        for _ in 0..self.max_read {
            let Some(head) = self.rq.head() else { return };
            let read_cpu = head.cpu;
            if head.event_cycle > self.clock.cycle(read_cpu) {
                return;
            }
            let entry = head.clone();
            let set = self.get_set(entry.address);
            let way = self.check_hit(&entry);
            let warm = self.clock.warmup_complete(read_cpu);

            if let Some(llc) = self.llc.as_mut() {
                if llc.atd.is_sampled(set) {
                    match llc.atd.probe(&entry, set) {
                        None => {
                            let shadow_way = llc.atd.victim(entry.cpu, set);
                            llc.atd.fill(set, shadow_way, &entry);
                            llc.atd.promote(set, shadow_way, entry.cpu);
                        }
                        Some(shadow_way) => llc.atd.promote(set, shadow_way, entry.cpu),
                    }
                }
            }

            if let Some(way) = way {
                self.read_hit(set, way, entry, warm);
                self.reads_available_this_cycle -= 1;
            } else if self.read_miss(set, entry) {
                self.reads_available_this_cycle -= 1;
            }

            if self.reads_available_this_cycle == 0 {
                return;
            }
        }
    }

    fn read_hit(&mut self, set: usize, way: usize, mut entry: Packet, warm: bool) {
        let read_cpu = entry.cpu;
        match self.kind {
            Kind::Itlb => {
                entry.instruction_pa = self.block[set][way].data;
                self.push_processed(&entry);
            }
            Kind::Dtlb => {
                entry.data_pa = self.block[set][way].data;
                self.push_processed(&entry);
            }
            Kind::Stlb => entry.data = self.block[set][way].data,
            Kind::L1i => self.push_processed(&entry),
            Kind::L1d if entry.ty != AccessType::Prefetch => self.push_processed(&entry),
            _ => {}
        }

        if entry.ty == AccessType::Load && !matches!(self.kind, Kind::Itlb | Kind::Dtlb | Kind::Stlb)
        {
            let cb_addr = match self.kind {
                Kind::L1i => entry.ip,
                Kind::L1d => entry.full_addr,
                _ => self.block[set][way].address << LOG2_BLOCK_SIZE,
            };
            self.prefetcher_operate(read_cpu, cb_addr, entry.ip, true, entry.ty, 0);
        }

        self.update_replacement_state(read_cpu, set, way);
        self.stats.record_hit(read_cpu, entry.ty, warm);

        if entry.fill_level < self.fill_level {
            self.return_data_upward(&entry);
        }

        // a first demand touch proves the prefetch useful
        if self.block[set][way].prefetch {
            self.stats.prefetch.useful += 1;
            self.block[set][way].prefetch = false;
        }
        self.block[set][way].used = true;

        self.rq.pop_head();
    }

    /// Returns whether the miss was handled (and the RQ head consumed).
    fn read_miss(&mut self, _set: usize, entry: Packet) -> bool {
        let read_cpu = entry.cpu;
        let mut miss_handled = true;

        match self.mshr.check(&entry) {
            None if !self.mshr.is_full() => {
                let now = self.clock.cycle(read_cpu);
                if self.kind == Kind::Llc {
                    // make sure DRAM can take this miss before committing
                    let lower = self
                        .lower_level
                        .clone()
                        .unwrap_or_else(|| panic!("[{}] LLC has no lower level", self.name));
                    let mut lower = lower.lock();
                    if lower.get_occupancy(QueueKind::Read, entry.address)
                        == lower.get_size(QueueKind::Read, entry.address)
                    {
                        miss_handled = false;
                    } else {
                        self.mshr.allocate(&entry, now);
                        let mut forward = entry.clone();
                        lower.add_rq(&mut forward);
                    }
                } else {
                    self.mshr.allocate(&entry, now);
                    if let Some(lower) = self.lower_level.clone() {
                        let mut forward = entry.clone();
                        lower.lock().add_rq(&mut forward);
                    } else if self.kind == Kind::Stlb {
                        // last level for translations: walk the page table
                        // and self-complete
                        let translator = self.translator.clone().unwrap_or_else(|| {
                            panic!("[{}] STLB miss without a translator", self.name)
                        });
                        let pa = translator.va_to_pa(
                            read_cpu,
                            entry.instr_id,
                            entry.full_addr,
                            entry.address,
                        );
                        let mut reply = entry.clone();
                        reply.data = pa >> crate::LOG2_PAGE_SIZE;
                        reply.event_cycle = self.clock.cycle(read_cpu);
                        self.return_data_inner(&reply);
                    }
                }
            }
            None => {
                miss_handled = false;
                self.stats.stall[entry.ty] += 1;
            }
            Some(index) => {
                self.coalesce_demand(index, &entry);
                self.stats.mshr_merged[entry.ty] += 1;
            }
        }

        if miss_handled {
            if entry.ty == AccessType::Load
                && !matches!(self.kind, Kind::Itlb | Kind::Dtlb | Kind::Stlb)
            {
                let cb_addr = match self.kind {
                    Kind::L1i => entry.ip,
                    Kind::L1d => entry.full_addr,
                    _ => entry.address << LOG2_BLOCK_SIZE,
                };
                self.prefetcher_operate(read_cpu, cb_addr, entry.ip, false, entry.ty, 0);
            }
            self.stats.record_miss_handled(entry.ty);
            self.rq.pop_head();
        }
        miss_handled
    }

    /// Consume matured prefetch-queue heads with the read bandwidth that is
    /// left this cycle.
    pub(crate) fn handle_prefetch(&mut self) {
        for _ in 0..self.max_read {
            let Some(head) = self.pq.head() else { return };
            let pf_cpu = head.cpu;
            if head.event_cycle > self.clock.cycle(pf_cpu) {
                return;
            }
            let mut entry = head.clone();
            let set = self.get_set(entry.address);
            let way = self.check_hit(&entry);
            let warm = self.clock.warmup_complete(pf_cpu);

            if let Some(way) = way {
                self.update_replacement_state(pf_cpu, set, way);
                self.stats.record_hit(pf_cpu, entry.ty, warm);

                // prefetches arriving from a higher origin level keep this
                // level's prefetcher informed
                if entry.pf_origin_level < self.fill_level
                    && !matches!(self.kind, Kind::Itlb | Kind::Dtlb | Kind::Stlb)
                {
                    let cb_addr = match self.kind {
                        Kind::L1d => entry.full_addr,
                        _ => self.block[set][way].address << LOG2_BLOCK_SIZE,
                    };
                    entry.pf_metadata = self.prefetcher_operate(
                        pf_cpu,
                        cb_addr,
                        entry.ip,
                        true,
                        AccessType::Prefetch,
                        entry.pf_metadata,
                    );
                }

                if entry.fill_level < self.fill_level {
                    self.return_data_upward(&entry);
                }

                self.pq.pop_head();
                self.reads_available_this_cycle -= 1;
            } else if self.prefetch_miss(set, &mut entry) {
                self.reads_available_this_cycle -= 1;
            }

            if self.reads_available_this_cycle == 0 {
                return;
            }
        }
    }

    fn prefetch_miss(&mut self, _set: usize, entry: &mut Packet) -> bool {
        let pf_cpu = entry.cpu;
        let mut miss_handled = true;

        match self.mshr.check(entry) {
            None if !self.mshr.is_full() => {
                if let Some(lower) = self.lower_level.clone() {
                    let mut lower = lower.lock();
                    // the LLC forwards prefetch misses to the DRAM read
                    // queue, everything else to the lower prefetch queue
                    let (queue, is_llc) = if self.kind == Kind::Llc {
                        (QueueKind::Read, true)
                    } else {
                        (QueueKind::Prefetch, false)
                    };
                    if lower.get_occupancy(queue, entry.address)
                        == lower.get_size(queue, entry.address)
                    {
                        miss_handled = false;
                    } else {
                        if entry.pf_origin_level < self.fill_level
                            && !matches!(self.kind, Kind::Itlb | Kind::Dtlb | Kind::Stlb)
                        {
                            let cb_addr = match self.kind {
                                Kind::L1d => entry.full_addr,
                                _ => entry.address << LOG2_BLOCK_SIZE,
                            };
                            entry.pf_metadata = self.prefetcher_operate(
                                pf_cpu,
                                cb_addr,
                                entry.ip,
                                false,
                                AccessType::Prefetch,
                                entry.pf_metadata,
                            );
                        }
                        // only prefetches destined for this level occupy an
                        // MSHR; the rest merely pass through
                        if entry.fill_level <= self.fill_level {
                            let now = self.clock.cycle(pf_cpu);
                            self.mshr.allocate(entry, now);
                        }
                        let mut forward = entry.clone();
                        if is_llc {
                            lower.add_rq(&mut forward);
                        } else {
                            lower.add_pq(&mut forward);
                        }
                    }
                }
            }
            None => {
                miss_handled = false;
                self.stats.stall[entry.ty] += 1;
            }
            Some(index) => {
                self.coalesce_routing_only(index, entry);
                self.stats.mshr_merged[entry.ty] += 1;
            }
        }

        if miss_handled {
            self.stats.record_miss_handled(entry.ty);
            self.pq.pop_head();
        }
        miss_handled
    }

    /// Install `packet` into `way`, accounting for the prefetch usefulness
    /// of whatever it overwrites.
    pub(crate) fn fill_cache(&mut self, set: usize, way: usize, packet: &Packet) {
        let overwrote_untouched_prefetch = {
            let b = &self.block[set][way];
            b.prefetch && !b.used
        };
        if overwrote_untouched_prefetch {
            self.stats.prefetch.useless += 1;
        }
        self.block[set][way].fill(packet);
        if self.block[set][way].prefetch {
            self.stats.prefetch.fill += 1;
        }
    }

    /// Full demand coalesce into an in-flight MSHR entry: dependency masks,
    /// routing, and demand-over-prefetch supersession.
    fn coalesce_demand(&mut self, index: usize, packet: &Packet) {
        let entry = self.mshr.get_mut(index).expect("coalesce target");
        if packet.ty == AccessType::Rfo {
            if packet.tlb_access {
                entry.store_merged = true;
                entry.sq_index_depend_on_me.set(packet.sq_index, true);
                entry.sq_index_depend_on_me |= packet.sq_index_depend_on_me;
            }
            if packet.load_merged {
                entry.load_merged = true;
                entry.lq_index_depend_on_me |= packet.lq_index_depend_on_me;
            }
        } else if packet.instruction {
            entry.instruction = true;
            entry.instr_merged = true;
            entry.rob_index_depend_on_me.set(packet.rob_index, true);
            if packet.instr_merged {
                entry.rob_index_depend_on_me |= packet.rob_index_depend_on_me;
            }
        } else {
            entry.is_data = true;
            entry.load_merged = true;
            entry.lq_index_depend_on_me.set(packet.lq_index, true);
            entry.lq_index_depend_on_me |= packet.lq_index_depend_on_me;
            if packet.store_merged {
                entry.store_merged = true;
                entry.sq_index_depend_on_me |= packet.sq_index_depend_on_me;
            }
        }
        entry.merge_routing(packet);
        Self::supersede_prefetch(entry, packet);
    }

    /// Queue-side coalesce used by writeback RFO misses and prefetch misses:
    /// routing only.
    fn coalesce_routing_only(&mut self, index: usize, packet: &Packet) {
        let entry = self.mshr.get_mut(index).expect("coalesce target");
        entry.merge_routing(packet);
        if packet.ty != AccessType::Prefetch {
            Self::supersede_prefetch(entry, packet);
        }
    }

    /// A demand overtakes an in-flight prefetch wholesale, but the completion
    /// state of the prefetch must survive.
    fn supersede_prefetch(entry: &mut Packet, packet: &Packet) {
        if entry.ty == AccessType::Prefetch {
            let returned = entry.returned;
            let event_cycle = entry.event_cycle;
            *entry = packet.clone();
            entry.returned = returned;
            entry.event_cycle = event_cycle;
        }
    }

    fn push_processed(&mut self, entry: &Packet) {
        if !self.processed.is_full() {
            self.processed.push(entry.clone());
        }
    }

    fn fill_callback_addrs(&self, set: usize, way: usize, entry: &Packet) -> (u64, u64) {
        let victim = &self.block[set][way];
        match self.kind {
            Kind::L1i => (
                (entry.ip >> LOG2_BLOCK_SIZE) << LOG2_BLOCK_SIZE,
                (victim.ip >> LOG2_BLOCK_SIZE) << LOG2_BLOCK_SIZE,
            ),
            Kind::L1d => (entry.full_addr, victim.address << LOG2_BLOCK_SIZE),
            _ => (
                entry.address << LOG2_BLOCK_SIZE,
                victim.address << LOG2_BLOCK_SIZE,
            ),
        }
    }

    fn accumulate_miss_latency(&mut self, entry: &Packet, cpu: usize, warm: bool) {
        if warm {
            if let Some(enqueued) = entry.cycle_enqueued {
                self.stats.total_miss_latency += self.clock.cycle(cpu) - enqueued;
            }
        }
    }

    /// Write the dirty victim of (`set`, `way`) to the lower level's WQ.
    /// Returns false when the fill must stall because that WQ is full.
    fn evict_if_dirty(
        &mut self,
        set: usize,
        way: usize,
        cpu: usize,
        instr_id: u64,
        ty: AccessType,
    ) -> bool {
        if !self.block[set][way].dirty {
            return true;
        }
        let Some(lower) = self.lower_level.clone() else {
            panic!(
                "[{}] dirty victim {:#x} with no lower level",
                self.name, self.block[set][way].address
            );
        };
        let victim_addr = self.block[set][way].address;
        let mut lower = lower.lock();
        if lower.get_occupancy(QueueKind::Write, victim_addr)
            == lower.get_size(QueueKind::Write, victim_addr)
        {
            lower.increment_wq_full(victim_addr);
            self.stats.stall[ty] += 1;
            log::debug!(
                "[{}] lower WQ full, fill stalls behind victim {:#x}",
                self.name,
                victim_addr
            );
            return false;
        }
        let victim = &self.block[set][way];
        let mut writeback = Packet {
            fill_level: self.fill_level.below(),
            cpu,
            address: victim.address,
            full_addr: victim.full_addr,
            data: victim.data,
            instr_id,
            ip: 0,
            ty: AccessType::Writeback,
            event_cycle: self.clock.cycle(cpu),
            ..Packet::default()
        };
        lower.add_wq(&mut writeback);
        true
    }
}
