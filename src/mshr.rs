//! Miss status holding registers.

use crate::packet::{Packet, ReturnState};

/// Fixed-size table of outstanding misses, at most one per block address.
///
/// Completed entries mature in `event_cycle` order, ties broken by the lowest
/// slot index; `next_fill` tracks that minimum so the fill path never scans.
#[derive(Debug)]
pub struct MshrTable {
    name: String,
    size: usize,
    entry: Vec<Option<Packet>>,
    occupancy: usize,
    num_returned: usize,
    next_fill_cycle: u64,
    next_fill_index: Option<usize>,
}

impl MshrTable {
    #[must_use]
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            entry: (0..size).map(|_| None).collect(),
            occupancy: 0,
            num_returned: 0,
            next_fill_cycle: u64::MAX,
            next_fill_index: None,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.occupancy == self.size
    }

    /// Slot of the in-flight miss for the same block address, if any.
    #[must_use]
    pub fn check(&self, packet: &Packet) -> Option<usize> {
        self.entry
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|e| e.address == packet.address))
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Packet> {
        self.entry.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Packet> {
        self.entry.get_mut(index).and_then(Option::as_mut)
    }

    /// Claim the first free slot for a new miss.
    pub fn allocate(&mut self, packet: &Packet, cycle_enqueued: u64) -> usize {
        assert!(
            self.check(packet).is_none(),
            "[{}] duplicate MSHR entry for address {:#x}",
            self.name,
            packet.address
        );
        let index = self
            .entry
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                panic!(
                    "[{}] allocate with no free slot, address {:#x}",
                    self.name, packet.address
                )
            });
        let mut entry = packet.clone();
        entry.returned = ReturnState::InFlight;
        entry.cycle_enqueued = Some(cycle_enqueued);
        self.entry[index] = Some(entry);
        self.occupancy += 1;
        index
    }

    /// Lower level delivered the data: mark the entry completed and schedule
    /// its fill for `event_cycle`.
    pub fn complete(&mut self, index: usize, packet: &Packet, event_cycle: u64) {
        let entry = self.entry[index]
            .as_mut()
            .unwrap_or_else(|| panic!("[{}] complete on empty slot {index}", self.name));
        entry.returned = ReturnState::Completed;
        entry.data = packet.data;
        entry.pf_metadata = packet.pf_metadata;
        entry.event_cycle = event_cycle;
        self.num_returned += 1;
        self.update_fill_cycle();
    }

    /// Slot and maturity cycle of the earliest completed entry.
    #[must_use]
    pub fn next_fill(&self) -> Option<(usize, u64)> {
        self.next_fill_index.map(|index| (index, self.next_fill_cycle))
    }

    pub fn remove(&mut self, index: usize) -> Packet {
        let entry = self.entry[index]
            .take()
            .unwrap_or_else(|| panic!("[{}] remove on empty slot {index}", self.name));
        self.occupancy -= 1;
        if entry.returned == ReturnState::Completed {
            self.num_returned -= 1;
        }
        self.update_fill_cycle();
        entry
    }

    fn update_fill_cycle(&mut self) {
        let mut min_cycle = u64::MAX;
        let mut min_index = None;
        for (index, slot) in self.entry.iter().enumerate() {
            if let Some(entry) = slot {
                if entry.returned == ReturnState::Completed && entry.event_cycle < min_cycle {
                    min_cycle = entry.event_cycle;
                    min_index = Some(index);
                }
            }
        }
        self.next_fill_cycle = min_cycle;
        self.next_fill_index = min_index;
    }
}

#[cfg(test)]
mod tests {
    use super::MshrTable;
    use crate::packet::{Packet, ReturnState};

    fn packet(address: u64) -> Packet {
        Packet {
            address,
            ..Packet::default()
        }
    }

    #[test]
    fn one_entry_per_block_address() {
        let mut mshr = MshrTable::new("MSHR", 4);
        let index = mshr.allocate(&packet(0x10), 5);
        assert_eq!(mshr.check(&packet(0x10)), Some(index));
        assert_eq!(mshr.check(&packet(0x20)), None);
        assert_eq!(mshr.get(index).unwrap().returned, ReturnState::InFlight);
        assert_eq!(mshr.get(index).unwrap().cycle_enqueued, Some(5));
    }

    #[test]
    #[should_panic(expected = "duplicate MSHR entry")]
    fn duplicate_allocation_panics() {
        let mut mshr = MshrTable::new("MSHR", 4);
        mshr.allocate(&packet(0x10), 0);
        mshr.allocate(&packet(0x10), 1);
    }

    #[test]
    fn fills_mature_in_event_order_with_index_tiebreak() {
        let mut mshr = MshrTable::new("MSHR", 4);
        let a = mshr.allocate(&packet(0x10), 0);
        let b = mshr.allocate(&packet(0x20), 0);
        let c = mshr.allocate(&packet(0x30), 0);

        assert_eq!(mshr.next_fill(), None);

        mshr.complete(b, &packet(0x20), 50);
        assert_eq!(mshr.next_fill(), Some((b, 50)));

        mshr.complete(c, &packet(0x30), 30);
        assert_eq!(mshr.next_fill(), Some((c, 30)));

        // equal cycle: lowest index wins
        mshr.complete(a, &packet(0x10), 30);
        assert_eq!(mshr.next_fill(), Some((a, 30)));

        mshr.remove(a);
        assert_eq!(mshr.next_fill(), Some((c, 30)));
        mshr.remove(c);
        assert_eq!(mshr.next_fill(), Some((b, 50)));
        mshr.remove(b);
        assert_eq!(mshr.next_fill(), None);
        assert_eq!(mshr.occupancy(), 0);
    }

    #[test]
    fn complete_copies_data_and_metadata() {
        let mut mshr = MshrTable::new("MSHR", 2);
        let index = mshr.allocate(&packet(0x10), 0);
        let reply = Packet {
            data: 0xdead,
            pf_metadata: 9,
            ..packet(0x10)
        };
        mshr.complete(index, &reply, 12);
        let entry = mshr.get(index).unwrap();
        assert_eq!(entry.returned, ReturnState::Completed);
        assert_eq!(entry.data, 0xdead);
        assert_eq!(entry.pf_metadata, 9);
        assert_eq!(entry.event_cycle, 12);
    }
}
