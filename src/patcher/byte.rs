//! This module contains a byte patcher

use std::convert::Infallible;
use std::{ptr, slice};

use super::{PatchGuard, Patcher};

/// Patcher for patching memory locations with byte arrays.
/// This patcher never fails.
#[derive(Default)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self::default()
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = Infallible;
    type Guard = BytePatchGuard;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error> {
        Ok(BytePatchGuard::patch(location, patch))
    }
}

/// Guard for byte-patches
///
/// See [`BytePatcher`].
pub struct BytePatchGuard {
    /// Original data from `location`
    original: Vec<u8>,
    /// Location of the patch
    location: *mut u8,
    /// Whether dropping the guard writes `original` back
    armed: bool,
}
impl BytePatchGuard {
    /// Patches a location, returning a guard for unpatching
    ///
    /// # Safety
    ///
    /// `location` must be valid for reads and writes of `patch.len()` bytes
    unsafe fn patch(location: *mut u8, patch: &[u8]) -> Self {
        let original = slice::from_raw_parts(location, patch.len()).to_vec();

        ptr::copy(patch.as_ptr(), location, patch.len());

        Self {
            original,
            location,
            armed: true,
        }
    }

    /// Bytes that were at the location before patching
    pub fn original(&self) -> &[u8] {
        &self.original
    }
}
unsafe impl PatchGuard for BytePatchGuard {
    fn commit(mut self) {
        self.armed = false;
    }
}
impl Drop for BytePatchGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Safety: creator must pass in a `location` pointer that is valid and writable for the full length of the patch
        unsafe {
            ptr::copy(self.original.as_ptr(), self.location, self.original.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::patcher::byte::BytePatcher;
    use crate::patcher::{PatchGuard, Patcher};

    #[test]
    /// Test patch and revert functionality
    fn test_patch() {
        let mut data = [1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        let patcher = BytePatcher::new();
        let patch = unsafe { patcher.patch(ptr, &[4, 3, 2, 1]).unwrap() };

        assert_eq!(patch.original(), [1, 2, 3, 4]);
        assert_eq!(unsafe { *ptr.add(0) }, 4);
        assert_eq!(unsafe { *ptr.add(3) }, 1);

        patch.restore();

        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// Tests a partial patch of a block to ensure we're not overwriting outside the patch area
    fn test_partial_patch() {
        let mut data = [1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        let patcher = BytePatcher::new();
        let patch = unsafe { patcher.patch(ptr.add(1), &[5, 5]).unwrap() };

        assert_eq!(
            unsafe { std::slice::from_raw_parts(ptr, 4) },
            [1, 5, 5, 4]
        );

        drop(patch);

        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// Committed patches survive their guard
    fn test_commit() {
        let mut data = [1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        let patcher = BytePatcher::new();
        let patch = unsafe { patcher.patch(ptr, &[9, 9]).unwrap() };
        patch.commit();

        assert_eq!(data, [9, 9, 3, 4]);
    }
}
