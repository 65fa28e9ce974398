//! # Hook
//!
//! This module covers hooks, which redirect execution from one location to another while keeping
//! the original code callable

use std::ptr::NonNull;

pub mod detour;
pub mod jmphook;
pub mod manager;
pub mod trampoline;

/// Trait for hooks
///
/// # Safety
///
/// Hooks are inherently unsafe; the implementor must leave the hooked function callable through
/// [`HookGuard::original`] for as long as the guard (or its committed hook) exists
pub unsafe trait Hook {
    /// Errors that could happen during a hook
    type Error: std::error::Error + Send + Sync + 'static;
    /// Hook guard to allow functions to be automatically unhooked when the guard goes out of scope
    type Guard: HookGuard;

    /// Creates a hook which redirects `source` to `destination`.
    ///
    /// # Safety
    ///
    /// - Both `source` and `destination` must be valid pointers
    /// - `destination` must be valid executable code with the same calling convention as `source`
    unsafe fn hook(
        &self,
        source: *const u8,
        destination: *const u8,
    ) -> Result<Self::Guard, Self::Error>;
}

/// Guard for a currently active hook
///
/// # Safety
///
/// Must ensure that the guard fully unhooks whether dropped or unhooked via `unhook`, unless it was committed
pub unsafe trait HookGuard: Sized {
    /// Entry point that behaves like the hooked function did before it was hooked
    fn original(&self) -> NonNull<u8>;

    /// Manually unhooks the hook rather than letting the guard go out of scope
    fn unhook(self) {
        // most guards will implement all functionality in [`Drop::drop`]
    }

    /// Leaves the hook installed for the rest of the process
    fn commit(self);
}
