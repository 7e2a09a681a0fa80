//! Searches the address space for free regions near an address
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

/// Free regions at or after `origin`, nearest first
pub fn after(
    origin: usize,
    range: Option<Range<usize>>,
) -> impl Iterator<Item = Result<*const (), region::Error>> {
    FreeRegions::new(origin, range, Direction::After)
}

/// Free regions before `origin`, nearest first
pub fn before(
    origin: usize,
    range: Option<Range<usize>>,
) -> impl Iterator<Item = Result<*const (), region::Error>> {
    FreeRegions::new(origin, range, Direction::Before)
}

/// Direction to walk the address space in
#[allow(clippy::missing_docs_in_private_items)]
#[derive(Clone, Copy)]
enum Direction {
    Before,
    After,
}

/// Walks mapped regions page by page, yielding the start of every unmapped page
struct FreeRegions {
    /// Bounds of the walk
    range: Range<usize>,
    /// Walk direction
    direction: Direction,
    /// Next address to look at
    current: usize,
}

impl FreeRegions {
    /// Starts a walk at `origin`
    fn new(origin: usize, range: Option<Range<usize>>, direction: Direction) -> Self {
        let page = region::page::size();
        Self {
            range: range.unwrap_or(0..usize::MAX),
            direction,
            current: match direction {
                Direction::Before => region::page::floor(origin as *const ()) as usize,
                Direction::After => region::page::ceil(origin as *const ()) as usize,
            }
            .max(page),
        }
    }

    /// Moves `current` to the next candidate in the walk direction, starting from `from`
    fn step(&mut self, from: Range<usize>) {
        self.current = match self.direction {
            Direction::Before => from.start.saturating_sub(region::page::size()),
            Direction::After => from.end,
        };
    }
}

impl Iterator for FreeRegions {
    type Item = Result<*const (), region::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let page = region::page::size();

        while self.current > 0 && self.range.contains(&self.current) {
            match region::query(self.current as *const ()) {
                Ok(region) => self.step(region.as_range()),
                Err(region::Error::UnmappedRegion) => {
                    let free = self.current;
                    self.step(free..free + page);
                    return Some(Ok(free as *const ()));
                }
                Err(error) => {
                    let failed = self.current;
                    self.step(failed..failed + page);
                    return Some(Err(error));
                }
            }
        }

        None
    }
}
