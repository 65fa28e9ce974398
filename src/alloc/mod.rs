//! # Alloc
//!
//! Executable memory for trampolines.
//!
//! Trampolines must sit within ±2 GiB of the function they were copied from so that relocated
//! RIP-relative operands still reach their targets. Pages are mapped at fixed addresses found by
//! [`search`], handed out with a bump pointer and never unmapped: a hooked function may call into
//! its trampoline at any point for the rest of the process.

use std::mem;
use std::ops::Range;
use std::slice;
use std::sync::Mutex;

use lazy_static::lazy_static;
use thiserror::Error;

pub mod search;

/// The furthest distance between a target and its trampoline (2 GiB).
pub const DETOUR_RANGE: usize = 0x8000_0000;

/// Allocation granularity inside a page
const ALIGNMENT: usize = 16;

/// Errors that occur while allocating executable memory
#[derive(Debug, Error)]
pub enum ArenaError {
    /// No free page was found within range of the origin
    #[error("no free memory within {DETOUR_RANGE:#x} bytes of {origin:#x}")]
    OutOfMemory {
        /// Address the allocation had to be near
        origin: usize,
    },
    /// The request does not fit in a single page
    #[error("requested {size} bytes, larger than a page")]
    TooLarge {
        /// Requested size
        size: usize,
    },
    /// Mapping a page failed for a reason other than the address being taken
    #[error("failed to map executable page: {0}")]
    Map(String),
    /// Querying the address space failed
    #[error("failed to query memory region: {0}")]
    Region(#[from] region::Error),
}

/// One mapped page that is carved up front to back
struct Page {
    /// Start of the page
    base: usize,
    /// Bytes already handed out
    used: usize,
    /// Size of the page
    len: usize,
}

impl Page {
    /// Whether `size` more bytes fit in this page and the page lies within `range`
    fn fits(&self, range: &Range<usize>, size: usize) -> bool {
        range.contains(&self.base)
            && range.contains(&(self.base + self.len - 1))
            && self.len - self.used >= size
    }

    /// Hands out the next `size` bytes
    fn take(&mut self, size: usize) -> &'static mut [u8] {
        let start = self.base + self.used;
        self.used += size;
        // Safety: the page is mapped read/write/execute and never unmapped, and every byte is
        // handed out at most once
        unsafe { slice::from_raw_parts_mut(start as *mut u8, size) }
    }
}

/// Never-freed pool of executable pages
pub struct ExecutableArena {
    /// Max distance away from the origin that an allocation may be placed
    max_distance: usize,
    /// Pages mapped so far
    pages: Vec<Page>,
}

impl ExecutableArena {
    /// Creates an empty arena
    pub fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            pages: Vec::new(),
        }
    }

    /// Allocates `size` bytes of read/write/execute memory within `max_distance` of `origin`.
    ///
    /// The memory lives for the rest of the process; there is no way to give it back.
    pub fn allocate(&mut self, origin: usize, size: usize) -> Result<&'static mut [u8], ArenaError> {
        let page_size = region::page::size();
        let size = (size + ALIGNMENT - 1) & !(ALIGNMENT - 1);
        if size > page_size {
            return Err(ArenaError::TooLarge { size });
        }

        let range =
            origin.saturating_sub(self.max_distance)..origin.saturating_add(self.max_distance);

        if let Some(page) = self.pages.iter_mut().find(|page| page.fits(&range, size)) {
            return Ok(page.take(size));
        }

        let mut page = Self::map_near(&range, origin, page_size)?;
        let memory = page.take(size);
        self.pages.push(page);
        Ok(memory)
    }

    /// Maps a fresh page as close to `origin` as possible
    fn map_near(range: &Range<usize>, origin: usize, len: usize) -> Result<Page, ArenaError> {
        // Prefer addresses after the origin; some hosts refuse mappings below the image
        search::after(origin, range.clone())
            .chain(search::before(origin, range.clone()))
            .find_map(|free| match free {
                Ok(address) => match Self::map_fixed(range, address, len) {
                    Ok(page) => Some(Ok(page)),
                    Err(ArenaError::Map(reason)) => {
                        log::trace!(target: "gfxpatch", "skipping {address:#x}: {reason}");
                        None
                    }
                    Err(error) => Some(Err(error)),
                },
                Err(error) => Some(Err(ArenaError::Region(error))),
            })
            .unwrap_or(Err(ArenaError::OutOfMemory { origin }))
    }

    /// Maps one page at `address`, refusing a mapping the host placed out of range
    fn map_fixed(range: &Range<usize>, address: usize, len: usize) -> Result<Page, ArenaError> {
        let map = mmap::MemoryMap::new(
            len,
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
                mmap::MapOption::MapAddr(address as *const u8),
            ],
        )
        .map_err(|error| ArenaError::Map(error.to_string()))?;

        let base = map.data() as usize;
        if !range.contains(&base) || !range.contains(&(base + map.len() - 1)) {
            // dropping the map unmaps it again
            return Err(ArenaError::Map(format!("host placed the page at {base:#x}")));
        }

        let page = Page {
            base,
            used: 0,
            len: map.len(),
        };
        // the arena owns the mapping for the rest of the process
        mem::forget(map);
        Ok(page)
    }
}

lazy_static! {
    static ref ARENA: Mutex<ExecutableArena> = Mutex::new(ExecutableArena::new(DETOUR_RANGE));
}

/// Allocates an executable buffer near `origin` from the process-wide arena
///
/// Note: the returned bytes have unspecified contents
pub fn allocate_executable(origin: usize, size: usize) -> Result<&'static mut [u8], ArenaError> {
    ARENA
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .allocate(origin, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Allocations land within range of the origin and are writable
    fn test_allocate_near() {
        let origin = test_allocate_near as usize;
        let memory = allocate_executable(origin, 32).unwrap();

        assert_eq!(memory.len(), 32);
        assert!((memory.as_ptr() as usize).abs_diff(origin) < DETOUR_RANGE);

        memory.fill(0xcc);
        assert!(memory.iter().all(|&b| b == 0xcc));
    }

    #[test]
    /// Two small allocations share a page without overlapping
    fn test_allocations_do_not_overlap() {
        let backing: &'static mut [u8] = Box::leak(vec![0u8; 4096].into_boxed_slice());
        let base = backing.as_ptr() as usize;
        let mut arena = ExecutableArena {
            max_distance: DETOUR_RANGE,
            pages: vec![Page {
                base,
                used: 0,
                len: backing.len(),
            }],
        };

        let first = arena.allocate(base, 20).unwrap().as_ptr() as usize;
        let second = arena.allocate(base, 20).unwrap().as_ptr() as usize;

        assert_eq!(first, base);
        assert_eq!(second - first, 32);
        assert_eq!(arena.pages.len(), 1);
    }

    #[test]
    /// Requests over a page are refused instead of spilling into neighbouring mappings
    fn test_too_large() {
        let mut arena = ExecutableArena::new(DETOUR_RANGE);
        let size = region::page::size() + 1;
        assert!(matches!(
            arena.allocate(0x1000_0000, size),
            Err(ArenaError::TooLarge { .. })
        ));
    }
}
