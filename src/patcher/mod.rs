//! # Patcher
//!
//! This module covers patchers, which are used to overwrite locations in memory.
//!
//! Every patch is held by a guard. Dropping the guard puts the original bytes back, which lets a
//! caller apply several writes and roll all of them back if a later one fails. Patches that should
//! outlive the guard are [committed](PatchGuard::commit).

pub mod byte;
pub mod lookup;
pub mod mem;

/// All patchers save state from where they patched and are able to revert on-command
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that the implementation of `patch` works correctly and is properly documented for avoiding undefined behavior
pub unsafe trait Patcher {
    /// Error type that can occur when patching
    type Error;
    /// Guard type for the patcher. When this guard is dropped, the location should be restored.
    type Guard: PatchGuard;

    /// Patches a given location.
    ///
    /// # Safety
    ///
    /// This function is intended to be used on arbitrary memory addresses, but `target` must be valid for `patch.len()` bytes
    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error>;
}

/// Guard for a patch
///
/// # Safety
///
/// Guard must fully unpatch the location when dropped, unless `commit` was called
pub unsafe trait PatchGuard: Sized {
    /// Restores the original value of a patch
    fn restore(self) {
        // most implementations have their functionality in their [`Drop::drop`] implementation
    }

    /// Keeps the patch in place for the rest of the process
    fn commit(self);
}
