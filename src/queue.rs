//! Bounded packet ring with per-address duplicate detection.

use crate::packet::Packet;
use stats::QueueStats;

/// FIFO of pending packets.
///
/// Slots are `None` when empty; `occupancy` always equals the number of
/// occupied slots. Duplicate detection matches on the block address; merge
/// policy is the owning cache's business, the queue only finds the entry.
#[derive(Debug)]
pub struct PacketQueue {
    name: String,
    size: usize,
    head: usize,
    tail: usize,
    occupancy: usize,
    entry: Vec<Option<Packet>>,
    pub stats: QueueStats,
}

impl PacketQueue {
    #[must_use]
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            head: 0,
            tail: 0,
            occupancy: 0,
            entry: (0..size).map(|_| None).collect(),
            stats: QueueStats::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
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

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.occupancy == 0
    }

    /// Index of the queued packet with the same block address, if any.
    #[must_use]
    pub fn check_queue(&self, packet: &Packet) -> Option<usize> {
        self.entry
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|p| p.address == packet.address))
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Packet> {
        self.entry.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Packet> {
        self.entry.get_mut(index).and_then(Option::as_mut)
    }

    #[must_use]
    pub fn head_index(&self) -> usize {
        self.head
    }

    #[must_use]
    pub fn head(&self) -> Option<&Packet> {
        self.entry.get(self.head).and_then(Option::as_ref)
    }

    /// Append at the tail. The caller is responsible for the capacity check;
    /// pushing into a full queue or an occupied slot is a fatal bug.
    pub fn push(&mut self, packet: Packet) -> usize {
        assert!(
            !self.is_full(),
            "[{}] push into full queue, address {:#x}",
            self.name,
            packet.address
        );
        let index = self.tail;
        assert!(
            self.entry[index].is_none(),
            "[{}] tail slot {} is not empty",
            self.name,
            index
        );
        self.entry[index] = Some(packet);
        self.occupancy += 1;
        self.tail += 1;
        if self.tail >= self.size {
            self.tail = 0;
        }
        index
    }

    pub fn pop_head(&mut self) -> Packet {
        let packet = self.entry[self.head]
            .take()
            .unwrap_or_else(|| panic!("[{}] pop from empty queue", self.name));
        self.occupancy -= 1;
        self.head += 1;
        if self.head >= self.size {
            self.head = 0;
        }
        packet
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.entry.iter().filter_map(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::PacketQueue;
    use crate::packet::Packet;

    fn packet(address: u64) -> Packet {
        Packet {
            address,
            full_addr: address << crate::LOG2_BLOCK_SIZE,
            ..Packet::default()
        }
    }

    #[test]
    fn occupancy_tracks_occupied_slots() {
        let mut queue = PacketQueue::new("Q", 4);
        assert!(queue.is_empty());
        queue.push(packet(1));
        queue.push(packet(2));
        assert_eq!(queue.occupancy(), queue.iter().count());
        queue.pop_head();
        assert_eq!(queue.occupancy(), 1);
        assert_eq!(queue.occupancy(), queue.iter().count());
    }

    #[test]
    fn check_queue_matches_block_address() {
        let mut queue = PacketQueue::new("Q", 4);
        let index = queue.push(packet(0x40));
        assert_eq!(queue.check_queue(&packet(0x40)), Some(index));
        assert_eq!(queue.check_queue(&packet(0x41)), None);
    }

    #[test]
    fn ring_wraps_in_fifo_order() {
        let mut queue = PacketQueue::new("Q", 2);
        queue.push(packet(1));
        queue.push(packet(2));
        assert_eq!(queue.pop_head().address, 1);
        queue.push(packet(3));
        assert_eq!(queue.pop_head().address, 2);
        assert_eq!(queue.pop_head().address, 3);
        assert!(queue.is_empty());
    }

    #[test]
    #[should_panic(expected = "push into full queue")]
    fn push_into_full_queue_panics() {
        let mut queue = PacketQueue::new("Q", 1);
        queue.push(packet(1));
        queue.push(packet(2));
    }
}
