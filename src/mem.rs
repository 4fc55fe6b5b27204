//! The queue interface every memory level speaks.

use crate::packet::Packet;
use crate::sync::{Arc, Mutex};
use crate::{address, LOG2_PAGE_SIZE};

/// Queue selector for occupancy polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Mshr,
    Read,
    Write,
    Prefetch,
}

/// Outcome of handing a packet to a lower level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueResult {
    /// Accepted: freshly queued, or serviced straight from a pending
    /// writeback.
    Queued,
    /// Absorbed into the queued request at this index.
    Merged(usize),
    /// The queue is at capacity; retry next cycle.
    Full,
}

impl QueueResult {
    #[must_use]
    pub fn is_full(self) -> bool {
        self == Self::Full
    }
}

/// One level of the memory hierarchy as seen from above.
///
/// Levels reference each other through shared handles; the graph is a DAG
/// rooted at the core front-end and nothing owns its neighbours.
pub trait Memory: std::fmt::Debug + Send {
    fn name(&self) -> &str;

    fn add_rq(&mut self, packet: &mut Packet) -> QueueResult;
    fn add_wq(&mut self, packet: &mut Packet) -> QueueResult;
    fn add_pq(&mut self, packet: &mut Packet) -> QueueResult;

    /// A lower level resolved a miss; the packet address must match an MSHR
    /// entry of this level.
    fn return_data(&mut self, packet: &Packet);

    /// Advance one simulated cycle.
    fn operate(&mut self);

    fn get_occupancy(&self, queue: QueueKind, address: address) -> usize;
    fn get_size(&self, queue: QueueKind, address: address) -> usize;

    /// Back-pressure notification: an upper level wanted to write back but
    /// this level's WQ was full.
    fn increment_wq_full(&mut self, address: address);
}

pub type MemoryRef = Arc<Mutex<dyn Memory>>;

/// Page-table hook consumed by the STLB on a miss.
pub trait AddressTranslator: std::fmt::Debug + Send + Sync {
    fn va_to_pa(&self, cpu: usize, instr_id: u64, full_addr: address, block_addr: address)
        -> address;
}

/// Deterministic translation: the physical page is the virtual page plus a
/// per-cpu offset. Enough for tests and synthetic drivers.
#[derive(Debug, Default)]
pub struct FixedOffsetTranslator {
    pub offset_pages: u64,
}

impl AddressTranslator for FixedOffsetTranslator {
    fn va_to_pa(
        &self,
        cpu: usize,
        _instr_id: u64,
        full_addr: address,
        _block_addr: address,
    ) -> address {
        let vpn = full_addr >> LOG2_PAGE_SIZE;
        let ppn = vpn + self.offset_pages + cpu as u64;
        (ppn << LOG2_PAGE_SIZE) | (full_addr & (crate::PAGE_SIZE - 1))
    }
}
