//! # Jump Hook
//!
//! This hook type uses a basic `jmp` instruction to redirect execution

use crate::code::x64::jmp_abs;
use crate::patcher::Patcher;

/// Simple jmp redirect
///
/// Overwrites the first [`JMP_ABS_LEN`](crate::code::x64::JMP_ABS_LEN) bytes at the source. It
/// keeps no copy of the code it replaces, see [`DetourHook`](super::detour::DetourHook) for that.
pub struct JmpHook<P> {
    /// Underlying patcher to be used to hook
    patcher: P,
}
impl<P: Patcher> JmpHook<P> {
    /// Creates a new jmp hook
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }

    /// Redirects `source` to `destination`, returning the guard of the written jump
    ///
    /// # Safety
    ///
    /// - `source` must be valid for `patcher` to write 14 bytes to
    /// - nothing may be executing those 14 bytes while they are replaced
    pub unsafe fn redirect(
        &self,
        source: *mut u8,
        destination: *const u8,
    ) -> Result<P::Guard, P::Error> {
        // patch with an absolute jmp to the destination
        self.patcher.patch(source, &jmp_abs(destination as usize))
    }
}

impl<P: Patcher + Default> Default for JmpHook<P> {
    fn default() -> Self {
        Self::new(P::default())
    }
}
