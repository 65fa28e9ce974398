//! This module contains a patcher which adjusts memory permissions to patch read-only data

use region::Protection;
use thiserror::Error;

use super::{PatchGuard, Patcher};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("Error setting memory protections: {0}")]
    ProtectionError(#[from] region::Error),
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    CustomError(E),
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of the target memory, triggering the patch, and then reverting the permissions.
///
/// Module images and function prologues are mapped read-only or read/execute, so every write this
/// crate makes into a loaded module goes through this wrapper.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}
impl<P: Patcher + Default> Default for PermissionWrapper<P> {
    fn default() -> Self {
        Self::new(P::default())
    }
}

unsafe impl<P: Patcher> Patcher for PermissionWrapper<P> {
    type Error = PermissionError<P::Error>;
    type Guard = PermissionWrapperGuard<P::Guard>;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error> {
        let _handle =
            region::protect_with_handle(location, patch.len(), Protection::READ_WRITE_EXECUTE)?;
        self.patcher
            .patch(location, patch)
            .map(|guard| PermissionWrapperGuard::guard(guard, location, patch.len()))
            .map_err(PermissionError::CustomError)
    }
}

/// Permission guard for the underlying patch guard
pub struct PermissionWrapperGuard<G: PatchGuard> {
    /// Underlying patch guard for the wrapped patcher. `Option` so that we can take it in [`Drop::drop`] and [`PatchGuard::commit`]
    guard: Option<G>,
    /// Location of the patch
    location: *const u8,
    /// Length of the patch
    len: usize,
}
impl<G: PatchGuard> PermissionWrapperGuard<G> {
    /// Wrap a patcher's guard. When this guard is dropped, the underlying guard will also be dropped with its target location made writable
    fn guard(guard: G, location: *const u8, len: usize) -> Self {
        Self {
            guard: Some(guard),
            location,
            len,
        }
    }
    /// Get the underlying patch guard in case info is needed
    pub fn inner(&self) -> Option<&G> {
        self.guard.as_ref()
    }
}
unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<G> {
    fn commit(mut self) {
        if let Some(guard) = self.guard.take() {
            guard.commit();
        }
    }
}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<G> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        // Safety: the same range was made writable when the patch was applied
        match unsafe {
            region::protect_with_handle(self.location, self.len, Protection::READ_WRITE_EXECUTE)
        } {
            Ok(_handle) => guard.restore(),
            Err(error) => {
                log::error!(target: "gfxpatch", "cannot restore patch at {:p}: {error}", self.location);
                guard.commit();
            }
        }
    }
}
