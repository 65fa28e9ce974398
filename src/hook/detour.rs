//! # Detour
//!
//! Hooks that keep the original function callable: the prologue is moved to a
//! [`Trampoline`] before a [`JmpHook`] overwrites it.

use std::convert::Infallible;
use std::ptr::NonNull;

use iced_x86::IcedError;
use thiserror::Error;

use crate::alloc::ArenaError;
use crate::code::x64::JMP_ABS_LEN;
use crate::patcher::byte::{BytePatchGuard, BytePatcher};
use crate::patcher::mem::{PermissionError, PermissionWrapper, PermissionWrapperGuard};
use crate::patcher::PatchGuard;

use super::jmphook::JmpHook;
use super::trampoline::Trampoline;
use super::{Hook, HookGuard};

/// Errors while installing a detour
#[derive(Debug, Error)]
pub enum HookError {
    /// The prologue contains bytes that do not decode
    #[error("invalid instruction at {address:#x}")]
    InvalidInstruction {
        /// Address of the undecodable byte
        address: usize,
    },
    /// The function returns before enough bytes for the redirect
    #[error("function at {address:#x} returns after {len} bytes, too small to hook")]
    FunctionTooSmall {
        /// Function entry
        address: usize,
        /// Bytes up to and including the return
        len: usize,
    },
    /// Re-encoding the prologue at the trampoline address failed
    #[error("failed to relocate prologue: {0}")]
    Relocation(#[from] IcedError),
    /// The relocated prologue outgrew its allocation
    #[error("relocated prologue needs {len} bytes")]
    TrampolineTooLarge {
        /// Needed size
        len: usize,
    },
    /// No executable memory near the target
    #[error("failed to allocate trampoline: {0}")]
    Arena(#[from] ArenaError),
    /// Writing the redirect failed
    #[error("failed to write redirect: {0}")]
    Patch(#[from] PermissionError<Infallible>),
}

/// Trampoline-backed x86-64 hook
#[derive(Default)]
pub struct DetourHook {
    /// Writes the redirect into read-only code
    jmp: JmpHook<PermissionWrapper<BytePatcher>>,
}

impl DetourHook {
    /// Creates a detour hook
    pub fn new() -> Self {
        Self::default()
    }
}

unsafe impl Hook for DetourHook {
    type Error = HookError;
    type Guard = DetourGuard;

    unsafe fn hook(
        &self,
        source: *const u8,
        destination: *const u8,
    ) -> Result<Self::Guard, Self::Error> {
        let trampoline = Trampoline::build(source, JMP_ABS_LEN)?;
        let redirect = self.jmp.redirect(source as *mut u8, destination)?;
        Ok(DetourGuard {
            redirect,
            trampoline,
        })
    }
}

/// Guard for detours
pub struct DetourGuard {
    /// Guard of the jump written over the entry
    redirect: PermissionWrapperGuard<BytePatchGuard>,
    /// Relocated prologue
    trampoline: Trampoline,
}

impl DetourGuard {
    /// The trampoline calling into the original code
    pub fn trampoline(&self) -> &Trampoline {
        &self.trampoline
    }
}

unsafe impl HookGuard for DetourGuard {
    fn original(&self) -> NonNull<u8> {
        self.trampoline.entry()
    }

    fn commit(self) {
        self.redirect.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::x64::jmp_abs;

    #[test]
    /// The entry jumps to the destination and the trampoline jumps back past the stolen bytes
    fn test_hook_and_unhook() {
        let mut code = vec![0x90u8; 64];
        code[20] = 0xc3;
        let source = code.as_mut_ptr();
        let destination = 0x7fff_0000_1000usize as *const u8;

        let guard = unsafe { DetourHook::new().hook(source, destination) }.unwrap();

        assert_eq!(
            unsafe { std::slice::from_raw_parts(source, JMP_ABS_LEN) },
            jmp_abs(destination as usize)
        );
        let trampoline = guard.trampoline();
        assert_eq!(trampoline.stolen(), JMP_ABS_LEN);
        assert_eq!(&trampoline.code()[..JMP_ABS_LEN], &[0x90; JMP_ABS_LEN]);
        assert_eq!(
            &trampoline.code()[JMP_ABS_LEN..],
            &jmp_abs(source as usize + JMP_ABS_LEN)[..]
        );
        assert_eq!(guard.original(), trampoline.entry());

        guard.unhook();
        assert!(code[..20].iter().all(|&b| b == 0x90));
    }

    #[test]
    /// Committed detours stay in place
    fn test_commit() {
        let mut code = vec![0x90u8; 64];
        let source = code.as_mut_ptr();

        let guard = unsafe { DetourHook::new().hook(source, 0x1000 as *const u8) }.unwrap();
        guard.commit();

        assert_eq!(&code[..JMP_ABS_LEN], &jmp_abs(0x1000)[..]);
    }
}
