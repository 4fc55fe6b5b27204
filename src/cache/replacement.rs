//! LRU bookkeeping, plain and way-partitioned.

use super::Cache;
use crate::config::Kind;
use crate::packet::{AccessType, Packet};

impl Cache {
    /// Victim way for a fill requested by `cpu`. `None` means "do not
    /// install" and can only come out of the LLC bypass policy.
    pub(crate) fn find_victim(&self, cpu: usize, set: usize, packet: &Packet) -> Option<usize> {
        match self.kind {
            Kind::Llc => self.llc_lru_victim(cpu, set, packet),
            _ => Some(self.lru_victim(set)),
        }
    }

    /// The stalest way of the whole set.
    fn lru_victim(&self, set: usize) -> usize {
        let mut victim = 0;
        let mut max_lru = self.block[set][0].lru;
        for (way, b) in self.block[set].iter().enumerate().skip(1) {
            if b.lru > max_lru {
                max_lru = b.lru;
                victim = way;
            }
        }
        victim
    }

    /// The stalest way among those owned by `cpu`; lowest way index on ties.
    fn llc_lru_victim(&self, cpu: usize, set: usize, packet: &Packet) -> Option<usize> {
        let llc = self.llc.as_ref().expect("LLC replacement state");
        if llc.bypass_prefetch_fill && packet.ty == AccessType::Prefetch {
            return None;
        }
        let mut victim = None;
        let mut max_lru = 0;
        for (way, b) in self.block[set].iter().enumerate() {
            if b.cpu != cpu {
                continue;
            }
            if victim.is_none() || b.lru > max_lru {
                victim = Some(way);
                max_lru = b.lru;
            }
        }
        let way = victim.unwrap_or_else(|| {
            panic!(
                "[{}] no way owned by cpu {cpu} in set {set}",
                self.name
            )
        });
        Some(way)
    }

    /// Promote `way` to MRU after a hit or a fill.
    pub(crate) fn update_replacement_state(&mut self, cpu: usize, set: usize, way: usize) {
        match self.kind {
            Kind::Llc => self.llc_lru_update(set, way, cpu),
            _ => self.lru_update(set, way),
        }
    }

    fn lru_update(&mut self, set: usize, way: usize) {
        let position = self.block[set][way].lru;
        for b in &mut self.block[set] {
            if b.lru < position {
                b.lru += 1;
            }
        }
        self.block[set][way].lru = 0;
    }

    /// Ageing is confined to `cpu`'s partition; other owners' stacks are
    /// untouched.
    fn llc_lru_update(&mut self, set: usize, way: usize, cpu: usize) {
        let position = self.block[set][way].lru;
        for b in &mut self.block[set] {
            if b.cpu == cpu && b.lru < position {
                b.lru += 1;
            }
        }
        self.block[set][way].lru = 0;
    }
}
