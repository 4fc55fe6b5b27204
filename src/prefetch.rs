//! Prefetcher hook points.
//!
//! A prefetcher is owned by its cache and is handed a mutable borrow of it on
//! every callback, so it can inject requests through
//! [`Cache::prefetch_line`] directly. Real prefetch algorithms live outside
//! this crate; the contract here is the dispatch surface.

use crate::cache::Cache;
use crate::packet::AccessType;
use crate::address;

pub trait Prefetcher: std::fmt::Debug + Send {
    fn initialize(&mut self, _cache: &mut Cache) {}

    /// Called on demand accesses and on prefetches passing through from a
    /// higher origin level. Returns the (possibly updated) prefetch metadata.
    fn operate(
        &mut self,
        _cache: &mut Cache,
        _cpu: usize,
        _addr: address,
        _ip: address,
        _cache_hit: bool,
        _ty: AccessType,
        metadata_in: u32,
    ) -> u32 {
        metadata_in
    }

    /// Called when a block is installed. Returns the metadata to carry on
    /// the filling packet.
    #[allow(clippy::too_many_arguments)]
    fn cache_fill(
        &mut self,
        _cache: &mut Cache,
        _cpu: usize,
        _addr: address,
        _set: usize,
        _way: usize,
        _prefetch: bool,
        _evicted_addr: address,
        metadata_in: u32,
    ) -> u32 {
        metadata_in
    }

    fn final_stats(&self, _cache: &Cache) {}
}

#[derive(Debug, Default)]
pub struct NoPrefetcher;

impl Prefetcher for NoPrefetcher {}

/// Fetches the next sequential block on every demand access.
#[derive(Debug, Default)]
pub struct NextLinePrefetcher;

impl Prefetcher for NextLinePrefetcher {
    fn operate(
        &mut self,
        cache: &mut Cache,
        cpu: usize,
        addr: address,
        ip: address,
        _cache_hit: bool,
        ty: AccessType,
        metadata_in: u32,
    ) -> u32 {
        if matches!(ty, AccessType::Load | AccessType::Rfo) {
            let fill_level = cache.fill_level();
            cache.prefetch_line(cpu, ip, addr, addr + crate::BLOCK_SIZE, fill_level, 0);
        }
        metadata_in
    }
}
