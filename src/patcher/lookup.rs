//! Pattern lookup patches: find a byte sequence in a loaded module and replace it
//!
//! A lookup patch only applies when the pattern occurs exactly as often as expected. Anything else
//! means the module is a build the patch was not written for, and nothing is written.

use thiserror::Error;

use crate::module::ModuleImage;

use super::{PatchGuard, Patcher};

/// A find/replace pair plus the number of times the pattern must occur
#[derive(Clone, Copy, Debug)]
pub struct PatchDescriptor {
    /// Bytes to look for
    find: &'static [u8],
    /// Bytes written over every match, same length as `find`
    replace: &'static [u8],
    /// Per-byte compare mask; zero bits are ignored
    mask: Option<&'static [u8]>,
    /// Required number of matches
    count: usize,
}

impl PatchDescriptor {
    /// Creates a patch that replaces `find` with `replace`, which must occur exactly `count` times
    ///
    /// # Panics
    ///
    /// If `find` and `replace` differ in length, `find` is empty or `count` is zero. Descriptors
    /// are meant to be `const`, so this fails the build rather than a boot.
    pub const fn new(find: &'static [u8], replace: &'static [u8], count: usize) -> Self {
        assert!(find.len() == replace.len(), "find and replace differ in length");
        assert!(!find.is_empty(), "empty pattern");
        assert!(count > 0, "patch must expect at least one match");
        Self {
            find,
            replace,
            mask: None,
            count,
        }
    }

    /// Compares only the bits set in `mask`
    pub const fn with_mask(mut self, mask: &'static [u8]) -> Self {
        assert!(mask.len() == self.find.len(), "mask and pattern differ in length");
        self.mask = Some(mask);
        self
    }

    /// Bytes to look for
    pub fn find(&self) -> &'static [u8] {
        self.find
    }

    /// Replacement bytes
    pub fn replace(&self) -> &'static [u8] {
        self.replace
    }

    /// Required number of matches
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether `window` (exactly pattern length) matches
    fn matches(&self, window: &[u8]) -> bool {
        match self.mask {
            None => window == self.find,
            Some(mask) => window
                .iter()
                .zip(self.find)
                .zip(mask)
                .all(|((&byte, &find), &mask)| byte & mask == find & mask),
        }
    }

    /// Offsets of every non-overlapping match in `haystack`
    pub fn occurrences(&self, haystack: &[u8]) -> Vec<usize> {
        let len = self.find.len();
        let mut found = Vec::new();
        let mut offset = 0;
        while offset + len <= haystack.len() {
            if self.matches(&haystack[offset..offset + len]) {
                found.push(offset);
                offset += len;
            } else {
                offset += 1;
            }
        }
        found
    }
}

/// Errors when applying a lookup patch
#[derive(Debug, Error)]
pub enum LookupError<E> {
    /// The pattern did not occur the expected number of times
    #[error("expected {expected} occurrence(s), found {found}")]
    OccurrenceMismatch {
        /// Required matches
        expected: usize,
        /// Actual matches
        found: usize,
    },
    /// Writing a match failed; earlier writes were rolled back
    #[error("failed to write patch at offset {offset:#x}: {error}")]
    WriteFault {
        /// Offset of the failing match within the image
        offset: usize,
        /// Error from the underlying patcher
        error: E,
    },
}

/// Applies [`PatchDescriptor`]s to module images through an underlying [`Patcher`]
pub struct PatternPatcher<P: Patcher> {
    /// Patcher doing the actual writes
    patcher: P,
}

impl<P: Patcher> PatternPatcher<P> {
    /// Creates a pattern patcher writing through `patcher`
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }

    /// Replaces every occurrence of the patch pattern in `image` and returns their offsets.
    ///
    /// Either every occurrence is replaced or none is.
    ///
    /// # Safety
    ///
    /// `image` must be valid for `patcher` to write to and nothing else may access it
    /// concurrently
    pub unsafe fn apply(
        &self,
        image: &ModuleImage,
        patch: &PatchDescriptor,
    ) -> Result<Vec<usize>, LookupError<P::Error>> {
        let offsets = patch.occurrences(image.bytes());
        if offsets.len() != patch.count() {
            return Err(LookupError::OccurrenceMismatch {
                expected: patch.count(),
                found: offsets.len(),
            });
        }

        // hold every guard until all writes succeeded so a failure rolls the others back
        let mut guards = Vec::with_capacity(offsets.len());
        for &offset in &offsets {
            let target = (image.base() + offset) as *mut u8;
            match self.patcher.patch(target, patch.replace()) {
                Ok(guard) => guards.push(guard),
                Err(error) => return Err(LookupError::WriteFault { offset, error }),
            }
        }

        guards.into_iter().for_each(PatchGuard::commit);
        Ok(offsets)
    }
}
