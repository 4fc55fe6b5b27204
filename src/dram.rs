//! Fixed-latency main memory behind the LLC.
//!
//! Speaks the same queue interface as a cache: reads mature after a flat
//! latency and return upward, writes are absorbed. No banks, channels or
//! scheduling; the hierarchy core only needs a well-behaved lower level.

use crate::clock::Clock;
use crate::mem::{Memory, MemoryRef, QueueKind, QueueResult};
use crate::packet::Packet;
use crate::queue::PacketQueue;
use crate::address;

#[derive(Debug)]
pub struct MainMemory {
    name: String,
    clock: Clock,
    latency: u64,
    pub rq: PacketQueue,
    pub wq: PacketQueue,
    upper: Option<MemoryRef>,
}

impl MainMemory {
    #[must_use]
    pub fn new(clock: Clock, latency: u64, rq_size: usize, wq_size: usize) -> Self {
        Self {
            name: "DRAM".to_string(),
            clock,
            latency,
            rq: PacketQueue::new("DRAM_RQ", rq_size),
            wq: PacketQueue::new("DRAM_WQ", wq_size),
            upper: None,
        }
    }

    /// The level that gets completed reads back (the LLC).
    pub fn set_upper_level(&mut self, upper: MemoryRef) {
        self.upper = Some(upper);
    }

    fn stamp(&self, packet: &mut Packet) {
        let now = self.clock.cycle(packet.cpu);
        if packet.event_cycle < now {
            packet.event_cycle = now + self.latency;
        } else {
            packet.event_cycle += self.latency;
        }
    }
}

impl Memory for MainMemory {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_rq(&mut self, packet: &mut Packet) -> QueueResult {
        if let Some(index) = self.rq.check_queue(packet) {
            self.rq.stats.merged += 1;
            self.rq.stats.access += 1;
            return QueueResult::Merged(index);
        }
        if self.rq.is_full() {
            self.rq.stats.full += 1;
            return QueueResult::Full;
        }
        let mut entry = packet.clone();
        self.stamp(&mut entry);
        self.rq.push(entry);
        self.rq.stats.to_cache += 1;
        self.rq.stats.access += 1;
        QueueResult::Queued
    }

    fn add_wq(&mut self, packet: &mut Packet) -> QueueResult {
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
        self.stamp(&mut entry);
        self.wq.push(entry);
        self.wq.stats.to_cache += 1;
        self.wq.stats.access += 1;
        QueueResult::Queued
    }

    fn add_pq(&mut self, packet: &mut Packet) -> QueueResult {
        panic!(
            "[{}] has no prefetch queue (address {:#x})",
            self.name, packet.address
        );
    }

    fn return_data(&mut self, packet: &Packet) {
        panic!(
            "[{}] nothing lies below main memory (address {:#x})",
            self.name, packet.address
        );
    }

    fn operate(&mut self) {
        // completed reads flow back up, one head per cycle
        if let Some(head) = self.rq.head() {
            if head.event_cycle <= self.clock.cycle(head.cpu) {
                let mut reply = self.rq.pop_head();
                reply.event_cycle = self.clock.cycle(reply.cpu);
                log::trace!(
                    "[{}] read {:#x} complete, returning upward",
                    self.name,
                    reply.address
                );
                if let Some(upper) = &self.upper {
                    upper.lock().return_data(&reply);
                }
            }
        }
        // writes are simply retired
        if let Some(head) = self.wq.head() {
            if head.event_cycle <= self.clock.cycle(head.cpu) {
                self.wq.pop_head();
            }
        }
    }

    fn get_occupancy(&self, queue: QueueKind, _address: address) -> usize {
        match queue {
            QueueKind::Read => self.rq.occupancy(),
            QueueKind::Write => self.wq.occupancy(),
            QueueKind::Mshr | QueueKind::Prefetch => 0,
        }
    }

    fn get_size(&self, queue: QueueKind, _address: address) -> usize {
        match queue {
            QueueKind::Read => self.rq.size(),
            QueueKind::Write => self.wq.size(),
            QueueKind::Mshr | QueueKind::Prefetch => 0,
        }
    }

    fn increment_wq_full(&mut self, _address: address) {
        self.wq.stats.full += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::MainMemory;
    use crate::clock::Clock;
    use crate::mem::{Memory, QueueResult};
    use crate::packet::Packet;

    #[test]
    fn reads_mature_after_latency() {
        let clock = Clock::new(1);
        let mut dram = MainMemory::new(clock.clone(), 10, 4, 4);
        let mut packet = Packet {
            address: 0x99,
            ..Packet::default()
        };
        assert_eq!(dram.add_rq(&mut packet), QueueResult::Queued);
        assert_eq!(dram.rq.head().unwrap().event_cycle, 10);
        // duplicate merges
        assert_eq!(dram.add_rq(&mut packet.clone()), QueueResult::Merged(0));
        assert_eq!(dram.rq.occupancy(), 1);
    }

    #[test]
    fn writes_retire_silently() {
        let clock = Clock::new(1);
        let mut dram = MainMemory::new(clock.clone(), 5, 4, 4);
        let mut packet = Packet {
            address: 0x42,
            ..Packet::default()
        };
        dram.add_wq(&mut packet);
        clock.set_cycle(0, 5);
        dram.operate();
        assert!(dram.wq.is_empty());
    }
}
