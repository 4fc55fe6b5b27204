//! Cycle-accurate multi-level cache hierarchy with a utility-partitioned
//! last-level cache.
//!
//! Every simulated cpu owns private TLBs and L1/L2 caches; all cpus share an
//! LLC whose ways are periodically re-partitioned from auxiliary tag
//! directory measurements. Caches talk to each other only through the
//! [`mem::Memory`] queue interface and advance one [`Cache::operate`] call
//! per simulated cycle.
//!
//! [`Cache::operate`]: cache::Cache::operate

pub mod atd;
pub mod block;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dram;
pub mod hierarchy;
pub mod mem;
pub mod mshr;
pub mod packet;
pub mod partition;
pub mod prefetch;
pub mod queue;
pub mod sync;

pub use cache::Cache;
pub use clock::Clock;
pub use hierarchy::Hierarchy;
pub use packet::{AccessType, FillLevel, Packet};

/// Byte addresses and block addresses share one integer type.
#[allow(non_camel_case_types)]
pub type address = u64;

pub const LOG2_BLOCK_SIZE: u32 = 6;
pub const BLOCK_SIZE: u64 = 1 << LOG2_BLOCK_SIZE;
pub const LOG2_PAGE_SIZE: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << LOG2_PAGE_SIZE;

/// Reorder-buffer depth of the modelled core; bounds the PROCESSED queue and
/// the instruction dependency masks.
pub const ROB_SIZE: usize = 352;
/// Load-queue depth; bounds the load dependency masks.
pub const LQ_SIZE: usize = 128;
/// Store-queue depth; bounds the store dependency masks.
pub const SQ_SIZE: usize = 72;

/// Install the default `env_logger` backend for the `log` facade.
pub fn init_logging() {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .init();
}
