//! The request packet exchanged between cache levels.

use crate::{address, LQ_SIZE, ROB_SIZE, SQ_SIZE};
use serde::{Deserialize, Serialize};

pub use stats::AccessType;

/// The level nearest the core that a returning block must populate.
///
/// Declaration order matches the numeric encoding (L1 = 1, L2 = 2, LLC = 4,
/// DRAM = 8), so derived ordering compares levels by distance from the core.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum FillLevel {
    L1 = 1,
    L2 = 2,
    Llc = 4,
    Dram = 8,
}

impl FillLevel {
    /// The next level away from the core; used to address writebacks.
    #[must_use]
    pub fn below(self) -> Self {
        match self {
            Self::L1 => Self::L2,
            Self::L2 => Self::Llc,
            Self::Llc => Self::Dram,
            Self::Dram => panic!("nothing lies below DRAM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnState {
    NotIssued,
    InFlight,
    Completed,
}

pub type RobMask = bitvec::BitArr!(for ROB_SIZE);
pub type LqMask = bitvec::BitArr!(for LQ_SIZE);
pub type SqMask = bitvec::BitArr!(for SQ_SIZE);

/// One in-flight cache request.
///
/// A packet is copied into every queue it traverses; the MSHR copy is the
/// authoritative one once a miss is outstanding.
#[derive(Debug, Clone)]
pub struct Packet {
    pub instr_id: u64,
    pub cpu: usize,
    pub ip: address,
    /// Block-aligned address (full address shifted right by the block bits).
    pub address: address,
    pub full_addr: address,
    pub data: u64,
    pub instruction_pa: u64,
    pub data_pa: u64,
    pub ty: AccessType,
    pub fill_level: FillLevel,
    pub pf_origin_level: FillLevel,
    pub pf_metadata: u32,
    pub fill_l1i: bool,
    pub fill_l1d: bool,
    pub instruction: bool,
    pub is_data: bool,
    pub tlb_access: bool,
    pub rob_index: usize,
    pub lq_index: usize,
    pub sq_index: usize,
    pub rob_index_depend_on_me: RobMask,
    pub lq_index_depend_on_me: LqMask,
    pub sq_index_depend_on_me: SqMask,
    pub instr_merged: bool,
    pub load_merged: bool,
    pub store_merged: bool,
    pub returned: ReturnState,
    pub event_cycle: u64,
    pub cycle_enqueued: Option<u64>,
    // replacement metadata carried by lookahead prefetchers
    pub delta: i32,
    pub depth: i32,
    pub signature: u32,
    pub confidence: u32,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            instr_id: 0,
            cpu: 0,
            ip: 0,
            address: 0,
            full_addr: 0,
            data: 0,
            instruction_pa: 0,
            data_pa: 0,
            ty: AccessType::Load,
            fill_level: FillLevel::L1,
            pf_origin_level: FillLevel::L1,
            pf_metadata: 0,
            fill_l1i: false,
            fill_l1d: false,
            instruction: false,
            is_data: false,
            tlb_access: false,
            rob_index: 0,
            lq_index: 0,
            sq_index: 0,
            rob_index_depend_on_me: RobMask::ZERO,
            lq_index_depend_on_me: LqMask::ZERO,
            sq_index_depend_on_me: SqMask::ZERO,
            instr_merged: false,
            load_merged: false,
            store_merged: false,
            returned: ReturnState::NotIssued,
            event_cycle: 0,
            cycle_enqueued: None,
            delta: 0,
            depth: 0,
            signature: 0,
            confidence: 0,
        }
    }
}

impl Packet {
    /// Tighten the fill level and OR in the L1 routing bits of `other`.
    pub fn merge_routing(&mut self, other: &Packet) {
        if other.fill_level < self.fill_level {
            self.fill_level = other.fill_level;
        }
        self.fill_l1i |= other.fill_l1i;
        self.fill_l1d |= other.fill_l1d;
    }
}
