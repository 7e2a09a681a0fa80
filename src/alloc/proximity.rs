//! Proximity allocator
//!
//! Keeps a set of memory maps, each carved into slices, and hands out slices that are close enough to the
//! requested origin. New maps are placed in the nearest free region.
//!
//! Based on detour-rs with modifications: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::Range;
use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};
use thiserror::Error;

use super::search;

/// Defines the allocation type.
pub type Allocation = SliceBox<u8>;

/// Errors that occur while creating proximity allocations
#[derive(Debug, Error)]
pub enum ProximityError {
    /// Ran out of memory within an acceptable proximity to the allocation location
    #[error("Ran out of memory within an acceptable proximity to the allocation location")]
    OutOfMemory,
    /// Error while memmapping a region
    #[error("Error while mapping memory: {0}")]
    MmapError(mmap::MapError),
    /// Error while querying a memory region
    #[error("Error while querying memory: {0}")]
    RegionError(#[from] region::Error),
}

/// One memory map and the number of slices currently handed out from it
struct Pool {
    /// Slices of the memory map
    slices: SlicePool<u8>,
    /// Slices not yet released
    live: usize,
}

impl Pool {
    /// Address range covered by the pool
    fn range(&self) -> Range<usize> {
        let lower = self.slices.as_ptr() as usize;
        lower..lower + self.slices.len()
    }
}

/// Shared instance containing all pools
pub struct ProximityAllocator {
    /// Max distance away from the origin that the pool can be
    max_distance: usize,
    /// Memory pools used for allocations
    pools: Vec<Pool>,
}

impl ProximityAllocator {
    /// Creates an empty allocator
    pub fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            pools: Vec::new(),
        }
    }

    /// Allocates a slice in an eligible memory map.
    pub fn allocate(&mut self, origin: usize, size: usize) -> Result<Allocation, ProximityError> {
        let range =
            origin.saturating_sub(self.max_distance)..origin.saturating_add(self.max_distance);

        if let Some(allocation) = self.allocate_memory(&range, size) {
            return Ok(allocation);
        }

        let pool = Self::allocate_pool(&range, origin, size)?;
        let allocation = pool.alloc(size).ok_or(ProximityError::OutOfMemory)?;
        self.pools.push(Pool {
            slices: pool,
            live: 1,
        });
        Ok(allocation)
    }

    /// Releases the allocation at `address`, unmapping its pool once nothing else uses it
    pub fn release(&mut self, address: usize) {
        let Some(index) = self
            .pools
            .iter()
            .position(|pool| pool.range().contains(&address))
        else {
            return;
        };
        let pool = &mut self.pools[index];
        pool.live = pool.live.saturating_sub(1);
        if pool.live == 0 {
            self.pools.remove(index);
        }
    }

    /// Allocates a chunk using any of the existing pools.
    fn allocate_memory(&mut self, range: &Range<usize>, size: usize) -> Option<Allocation> {
        self.pools
            .iter_mut()
            .filter(|pool| {
                let pool_range = pool.range();
                range.contains(&pool_range.start) && range.contains(&(pool_range.end - 1))
            })
            .find_map(|pool| {
                let allocation = pool.slices.alloc(size)?;
                pool.live += 1;
                Some(allocation)
            })
    }

    /// Maps a new pool close to `origin`, large enough for at least `size` bytes.
    fn allocate_pool(
        range: &Range<usize>,
        origin: usize,
        size: usize,
    ) -> Result<SlicePool<u8>, ProximityError> {
        let size = size.max(1).next_multiple_of(region::page::size());

        // TODO: the end of a pool found before `origin` may still reach past `range`
        // Try after the origin first (macOS cannot allocate memory before the process's address).
        search::after(origin, Some(range.clone()))
            .chain(search::before(origin, Some(range.clone())))
            .find_map(|result| match result {
                Ok(address) if Self::is_free(address as usize, size) => {
                    Self::allocate_fixed_pool(address, size).ok().map(Ok)
                }
                Ok(_) => None,
                Err(error) => Some(Err(ProximityError::RegionError(error))),
            })
            .unwrap_or(Err(ProximityError::OutOfMemory))
    }

    /// Whether every page of `address..address + size` is unmapped, so a fixed mapping doesn't replace anything
    fn is_free(address: usize, size: usize) -> bool {
        (address..address.saturating_add(size))
            .step_by(region::page::size())
            .all(|page| {
                matches!(
                    region::query(page as *const ()),
                    Err(region::Error::UnmappedRegion)
                )
            })
    }

    /// Tries to map memory at exactly `address`.
    fn allocate_fixed_pool(
        address: *const (),
        size: usize,
    ) -> Result<SlicePool<u8>, ProximityError> {
        mmap::MemoryMap::new(
            size,
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
                mmap::MapOption::MapAddr(address as *const _),
            ],
        )
        .map_err(|e| match e {
            mmap::MapError::ErrNoMem => ProximityError::OutOfMemory,
            e => ProximityError::MmapError(e),
        })
        .map(SliceableMemoryMap)
        .map(SlicePool::new)
    }
}

/// A wrapper for making a memory map compatible with `SlicePool`.
struct SliceableMemoryMap(mmap::MemoryMap);

impl AsRef<[u8]> for SliceableMemoryMap {
    fn as_ref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }
}

impl AsMut<[u8]> for SliceableMemoryMap {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

// The map is only ever accessed through the pool's slices
unsafe impl Send for SliceableMemoryMap {}
unsafe impl Sync for SliceableMemoryMap {}
