//! # Hook manager
//!
//! Owns one [`HookDescriptor`] per routine the engine wants to intercept and the handles to the
//! original code once the routine is hooked.

use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use log::info;

use crate::error::FixError;
use crate::module::ModuleImage;
use crate::symbol::SymbolResolver;

use super::{Hook, HookGuard};

/// Callable entry point of a hooked routine's original code
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OriginalFn(NonNull<u8>);

// Points at code that is never unmapped
unsafe impl Send for OriginalFn {}
unsafe impl Sync for OriginalFn {}

impl OriginalFn {
    /// Raw entry address
    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    /// Reinterprets the entry as a function pointer of type `F`
    ///
    /// # Safety
    ///
    /// `F` must be an `extern` function pointer type matching the hooked routine's signature
    /// and calling convention. Types of a different size are rejected at compile time.
    pub unsafe fn cast<F: Copy>(&self) -> F {
        const {
            assert!(
                mem::size_of::<F>() == mem::size_of::<*const u8>(),
                "original functions can only be cast to function pointers"
            )
        };
        mem::transmute_copy(&self.as_ptr())
    }
}

impl fmt::Debug for OriginalFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OriginalFn").field(&self.0).finish()
    }
}

/// One routine to intercept
#[derive(Debug)]
pub struct HookDescriptor {
    /// Symbol of the routine
    symbol: &'static str,
    /// Entry address of the replacement
    wrapper: usize,
    /// Set by the first install attempt, successful or not
    claimed: AtomicBool,
    /// Original code, written once by a successful install
    original: OnceLock<OriginalFn>,
}

impl HookDescriptor {
    /// Describes a hook redirecting `symbol` to `wrapper`
    ///
    /// # Safety
    ///
    /// `wrapper` must be the entry of a function with the same signature and calling convention
    /// as `symbol`, alive for the rest of the process
    pub unsafe fn new(symbol: &'static str, wrapper: *const u8) -> Self {
        Self {
            symbol,
            wrapper: wrapper as usize,
            claimed: AtomicBool::new(false),
            original: OnceLock::new(),
        }
    }

    /// Symbol of the hooked routine
    pub fn symbol(&self) -> &'static str {
        self.symbol
    }

    /// Replacement entry address
    pub fn wrapper(&self) -> *const u8 {
        self.wrapper as *const u8
    }

    /// Original code, or `None` until the hook is installed
    pub fn original(&self) -> Option<OriginalFn> {
        self.original.get().copied()
    }
}

/// Installs the hooks of a fixed set of [`HookDescriptor`]s
pub struct HookManager<H: Hook> {
    /// Redirect mechanism
    hook: H,
    /// Every hook the engine may install
    descriptors: Vec<HookDescriptor>,
}

impl<H: Hook> HookManager<H> {
    /// Creates a manager for `descriptors`
    pub fn new(hook: H, descriptors: Vec<HookDescriptor>) -> Self {
        Self { hook, descriptors }
    }

    /// Descriptor registered for `symbol`
    pub fn descriptor(&self, symbol: &str) -> Option<&HookDescriptor> {
        self.descriptors.iter().find(|desc| desc.symbol == symbol)
    }

    /// Original code of the hooked `symbol`
    pub fn original(&self, symbol: &str) -> Option<OriginalFn> {
        self.descriptor(symbol)?.original()
    }

    /// Resolves `symbol` in `image` and redirects it to its registered wrapper.
    ///
    /// Each descriptor gets exactly one attempt; later calls fail with
    /// [`FixError::HookAlreadyInstalled`] whether or not the first one succeeded.
    ///
    /// # Safety
    ///
    /// `image` must be the loaded module `symbol` belongs to, and nothing may be executing the
    /// routine's entry while it is overwritten
    pub unsafe fn install<R: SymbolResolver + ?Sized>(
        &self,
        resolver: &R,
        image: &ModuleImage,
        symbol: &str,
    ) -> Result<OriginalFn, FixError> {
        let desc = self
            .descriptor(symbol)
            .ok_or_else(|| FixError::UnregisteredHook {
                symbol: symbol.to_owned(),
            })?;
        if desc.claimed.swap(true, Ordering::AcqRel) {
            return Err(FixError::HookAlreadyInstalled {
                symbol: symbol.to_owned(),
            });
        }

        let address = resolver
            .resolve(image, symbol)
            .ok_or_else(|| FixError::SymbolUnresolved {
                symbol: symbol.to_owned(),
            })?;

        let guard = self
            .hook
            .hook(address as *const u8, desc.wrapper())
            .map_err(|error| FixError::HookRejected {
                symbol: symbol.to_owned(),
                source: Box::new(error),
            })?;

        let original = OriginalFn(guard.original());
        guard.commit();
        // the claim above makes this the only writer
        let _ = desc.original.set(original);

        info!(target: "gfxpatch", "routed {symbol} at {address:#x}");
        Ok(original)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use thiserror::Error;

    use super::*;
    use crate::symbol::SymbolTable;

    #[derive(Debug, Error)]
    #[error("target refused")]
    struct Refused;

    /// Hook that records redirects instead of writing them
    #[derive(Default)]
    struct RecordingHook {
        installed: Mutex<Vec<(usize, usize)>>,
        refuse: Option<usize>,
    }

    struct RecordingGuard(NonNull<u8>);

    unsafe impl HookGuard for RecordingGuard {
        fn original(&self) -> NonNull<u8> {
            self.0
        }
        fn commit(self) {}
    }

    unsafe impl Hook for RecordingHook {
        type Error = Refused;
        type Guard = RecordingGuard;

        unsafe fn hook(
            &self,
            source: *const u8,
            destination: *const u8,
        ) -> Result<Self::Guard, Self::Error> {
            if self.refuse == Some(source as usize) {
                return Err(Refused);
            }
            self.installed
                .lock()
                .unwrap()
                .push((source as usize, destination as usize));
            // pretend the trampoline sits one page after the source
            Ok(RecordingGuard(
                NonNull::new((source as usize + 0x1000) as *mut u8).unwrap(),
            ))
        }
    }

    const BASE: usize = 0x10_0000;

    fn image() -> ModuleImage {
        unsafe { ModuleImage::from_raw_parts(BASE, 0x4000) }
    }

    fn manager(hook: RecordingHook) -> HookManager<RecordingHook> {
        let descriptors = unsafe {
            vec![
                HookDescriptor::new("_init", 0x9000 as *const u8),
                HookDescriptor::new("_start", 0xa000 as *const u8),
            ]
        };
        HookManager::new(hook, descriptors)
    }

    #[test]
    /// The original slot is empty until the install and filled afterwards
    fn test_install() {
        let resolver = SymbolTable::new().with(BASE, "_init", 0x100);
        let manager = manager(RecordingHook::default());
        assert_eq!(manager.original("_init"), None);

        let original = unsafe { manager.install(&resolver, &image(), "_init") }.unwrap();

        assert_eq!(original.as_ptr() as usize, BASE + 0x1100);
        assert_eq!(manager.original("_init"), Some(original));
        assert_eq!(
            *manager.hook.installed.lock().unwrap(),
            [(BASE + 0x100, 0x9000)]
        );
    }

    #[test]
    /// A second install is refused and keeps the first original
    fn test_install_twice() {
        let resolver = SymbolTable::new().with(BASE, "_init", 0x100);
        let manager = manager(RecordingHook::default());

        let first = unsafe { manager.install(&resolver, &image(), "_init") }.unwrap();
        let second = unsafe { manager.install(&resolver, &image(), "_init") };

        assert!(matches!(
            second,
            Err(FixError::HookAlreadyInstalled { .. })
        ));
        assert_eq!(manager.original("_init"), Some(first));
        assert_eq!(manager.hook.installed.lock().unwrap().len(), 1);
    }

    #[test]
    /// Missing symbols and refused targets leave the slot empty
    fn test_install_failures() {
        let resolver = SymbolTable::new().with(BASE, "_start", 0x200);
        let manager = manager(RecordingHook {
            refuse: Some(BASE + 0x200),
            ..Default::default()
        });

        let unresolved = unsafe { manager.install(&resolver, &image(), "_init") };
        assert!(matches!(
            unresolved,
            Err(FixError::SymbolUnresolved { symbol }) if symbol == "_init"
        ));

        let rejected = unsafe { manager.install(&resolver, &image(), "_start") };
        assert!(matches!(rejected, Err(FixError::HookRejected { .. })));
        // the caller logs this message alone, so it names the target and the cause
        assert_eq!(
            rejected.unwrap_err().to_string(),
            "failed to hook _start: target refused"
        );

        let unknown = unsafe { manager.install(&resolver, &image(), "_other") };
        assert!(matches!(unknown, Err(FixError::UnregisteredHook { .. })));

        assert_eq!(manager.original("_init"), None);
        assert_eq!(manager.original("_start"), None);
    }

    #[test]
    fn test_cast() {
        extern "C" fn answer() -> u32 {
            42
        }
        let original = OriginalFn(NonNull::new(answer as *mut u8).unwrap());
        let f: extern "C" fn() -> u32 = unsafe { original.cast() };
        assert_eq!(f(), 42);
    }
}
