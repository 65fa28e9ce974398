//! Searches the address space for unmapped pages close to an address
//!
//! Adapted from detour-rs: https://github.com/darfink/detour-rs

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

/// Returns an iterator over free pages after `origin`, nearest first
pub fn after(
    origin: usize,
    range: Range<usize>,
) -> impl Iterator<Item = Result<usize, region::Error>> {
    FreePages::new(origin, range, Direction::After)
}

/// Returns an iterator over free pages before `origin`, nearest first
pub fn before(
    origin: usize,
    range: Range<usize>,
) -> impl Iterator<Item = Result<usize, region::Error>> {
    FreePages::new(origin, range, Direction::Before)
}

#[allow(clippy::missing_docs_in_private_items)]
/// Which way the search walks from the origin
enum Direction {
    Before,
    After,
}

/// Walks the address space one mapping at a time looking for unmapped pages
struct FreePages {
    /// Addresses the search is allowed to return
    range: Range<usize>,
    /// Direction of the walk
    direction: Direction,
    /// Page-aligned address inspected next
    current: usize,
    /// Cached page size
    page_size: usize,
}

impl FreePages {
    /// Starts a search at the page containing `origin`
    fn new(origin: usize, range: Range<usize>, direction: Direction) -> Self {
        let page_size = region::page::size();
        Self {
            range,
            direction,
            current: origin & !(page_size - 1),
            page_size,
        }
    }

    /// Moves `current` one page past `address` in the search direction
    fn step_from(&mut self, start: usize, end: usize) {
        self.current = match self.direction {
            Direction::Before => start.saturating_sub(self.page_size),
            Direction::After => end,
        };
    }
}

impl Iterator for FreePages {
    type Item = Result<usize, region::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.current > 0 && self.range.contains(&self.current) {
            match region::query(self.current as *const u8) {
                Ok(mapped) => {
                    let mapped = mapped.as_range();
                    self.step_from(mapped.start, mapped.end);
                }
                Err(region::Error::UnmappedRegion) => {
                    let free = self.current;
                    self.step_from(free, free + self.page_size);
                    return Some(Ok(free));
                }
                Err(error) => {
                    let current = self.current;
                    self.step_from(current, current + self.page_size);
                    return Some(Err(error));
                }
            }
        }

        None
    }
}
