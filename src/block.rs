//! One cache way.

use crate::packet::{AccessType, Packet};
use crate::address;

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub valid: bool,
    pub dirty: bool,
    pub prefetch: bool,
    pub used: bool,
    // metadata deposited by lookahead prefetchers
    pub delta: i32,
    pub depth: i32,
    pub signature: u32,
    pub confidence: u32,
    pub tag: address,
    /// Block-aligned address, identical to the tag here: tags are full block
    /// addresses, the set index is recomputed on lookup.
    pub address: address,
    pub full_addr: address,
    pub data: u64,
    pub ip: address,
    pub instr_id: u64,
    /// Owning core; only meaningful within the partitioned LLC.
    pub cpu: usize,
    /// Stack position within the owning partition, 0 = MRU.
    pub lru: usize,
}

impl Block {
    /// Install `packet` into this way. Replacement state is the caller's
    /// responsibility.
    pub fn fill(&mut self, packet: &Packet) {
        self.valid = true;
        self.dirty = false;
        self.prefetch = packet.ty == AccessType::Prefetch;
        self.used = false;

        self.delta = packet.delta;
        self.depth = packet.depth;
        self.signature = packet.signature;
        self.confidence = packet.confidence;

        self.tag = packet.address;
        self.address = packet.address;
        self.full_addr = packet.full_addr;
        self.data = packet.data;
        self.ip = packet.ip;
        self.cpu = packet.cpu;
        self.instr_id = packet.instr_id;
    }
}
