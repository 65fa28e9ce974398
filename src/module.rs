//! # Module
//!
//! Driver modules the engine waits for, and the images they occupy once loaded.
//!
//! The host's module loader is the [`ModuleLoadMonitor`]. The engine registers a [`ModuleSpec`]
//! with it and is called back once the module is mapped; it never polls.

use std::slice;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::FixError;

/// Where a module is in its registration lifecycle
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    /// Not being watched
    Unregistered = 0,
    /// Registered with the monitor, waiting for the load
    Registered = 1,
    /// The monitor reported the module loaded
    Loaded = 2,
}

impl LoadState {
    /// Decodes the value stored in [`ModuleSpec::state`]
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Registered,
            2 => Self::Loaded,
            _ => Self::Unregistered,
        }
    }
}

/// A module of interest: its identifier, where it may live on disk and how far it got
#[derive(Debug)]
pub struct ModuleSpec {
    /// Bundle identifier
    id: &'static str,
    /// Candidate binary locations, in order of preference
    paths: &'static [&'static str],
    /// Current [`LoadState`]
    state: AtomicU8,
}

impl ModuleSpec {
    /// Creates an unregistered module spec
    pub const fn new(id: &'static str, paths: &'static [&'static str]) -> Self {
        Self {
            id,
            paths,
            state: AtomicU8::new(LoadState::Unregistered as u8),
        }
    }

    /// Bundle identifier
    pub fn id(&self) -> &'static str {
        self.id
    }

    /// Candidate binary locations
    pub fn paths(&self) -> &'static [&'static str] {
        self.paths
    }

    /// Current load state
    pub fn state(&self) -> LoadState {
        LoadState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Registers the module with the monitor
    pub(crate) fn register(&self, monitor: &mut dyn ModuleLoadMonitor) {
        self.state
            .store(LoadState::Registered as u8, Ordering::Release);
        monitor.register(self);
    }

    /// Tells the monitor the module no longer needs patching
    pub(crate) fn switch_off(&self, monitor: &mut dyn ModuleLoadMonitor) {
        let previous = self
            .state
            .swap(LoadState::Unregistered as u8, Ordering::AcqRel);
        if LoadState::from_raw(previous) != LoadState::Unregistered {
            monitor.switch_off(self);
        }
    }

    /// Moves a registered module to [`LoadState::Loaded`].
    ///
    /// Returns `Ok(false)` for a module that was never registered (or was switched off) and
    /// [`FixError::ModuleAlreadyLoaded`] if the load was already reported once.
    pub(crate) fn mark_loaded(&self) -> Result<bool, FixError> {
        match self.state.compare_exchange(
            LoadState::Registered as u8,
            LoadState::Loaded as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(true),
            Err(current) if LoadState::from_raw(current) == LoadState::Loaded => {
                Err(FixError::ModuleAlreadyLoaded {
                    id: self.id.to_owned(),
                })
            }
            Err(_) => Ok(false),
        }
    }
}

/// The host's module loader
pub trait ModuleLoadMonitor {
    /// Starts watching `module`; the host later reports the load to
    /// [`Orchestrator::on_module_loaded`](crate::Orchestrator::on_module_loaded)
    fn register(&mut self, module: &ModuleSpec);

    /// Stops watching `module`
    fn switch_off(&mut self, module: &ModuleSpec);
}

/// Address range a loaded module occupies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleImage {
    /// Load address
    base: usize,
    /// Size of the mapping
    size: usize,
}

impl ModuleImage {
    /// Describes a loaded module
    ///
    /// # Safety
    ///
    /// `base..base + size` must be mapped and readable for the rest of the process, and any
    /// address a [`SymbolResolver`](crate::symbol::SymbolResolver) returns for this image must
    /// point at what the symbol name promises
    pub unsafe fn from_raw_parts(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Load address
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the mapping
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `address` lies inside the image
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base
            && self
                .base
                .checked_add(self.size)
                .map_or(true, |end| address < end)
    }

    /// The image's bytes
    ///
    /// # Safety
    ///
    /// No one may write to the image while the slice is alive
    pub unsafe fn bytes(&self) -> &[u8] {
        slice::from_raw_parts(self.base as *const u8, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        registered: Vec<&'static str>,
        switched_off: Vec<&'static str>,
    }

    impl ModuleLoadMonitor for Recorder {
        fn register(&mut self, module: &ModuleSpec) {
            self.registered.push(module.id());
        }
        fn switch_off(&mut self, module: &ModuleSpec) {
            self.switched_off.push(module.id());
        }
    }

    #[test]
    /// Registration, load and repeated load follow the state machine
    fn test_lifecycle() {
        let spec = ModuleSpec::new("com.example.driver", &["/tmp/driver"]);
        let mut monitor = Recorder::default();
        assert_eq!(spec.state(), LoadState::Unregistered);

        spec.register(&mut monitor);
        assert_eq!(spec.state(), LoadState::Registered);
        assert_eq!(monitor.registered, ["com.example.driver"]);

        assert!(spec.mark_loaded().unwrap());
        assert_eq!(spec.state(), LoadState::Loaded);

        assert!(matches!(
            spec.mark_loaded(),
            Err(FixError::ModuleAlreadyLoaded { .. })
        ));
    }

    #[test]
    /// Unregistered modules are never marked loaded and switching them off is silent
    fn test_unregistered() {
        let spec = ModuleSpec::new("com.example.driver", &[]);
        let mut monitor = Recorder::default();

        spec.switch_off(&mut monitor);
        assert!(monitor.switched_off.is_empty());
        assert!(!spec.mark_loaded().unwrap());
        assert_eq!(spec.state(), LoadState::Unregistered);

        spec.register(&mut monitor);
        spec.switch_off(&mut monitor);
        assert_eq!(monitor.switched_off, ["com.example.driver"]);
        assert!(!spec.mark_loaded().unwrap());
    }

    #[test]
    /// Image bounds are half-open
    fn test_image_contains() {
        let image = unsafe { ModuleImage::from_raw_parts(0x1000, 0x100) };
        assert!(image.contains(0x1000));
        assert!(image.contains(0x10ff));
        assert!(!image.contains(0x1100));
        assert!(!image.contains(0xfff));
    }

    #[test]
    /// An image ending at the top of the address space does not wrap around
    fn test_image_contains_at_address_space_end() {
        let image = unsafe { ModuleImage::from_raw_parts(usize::MAX - 0xff, 0x100) };
        assert!(image.contains(usize::MAX));
        assert!(image.contains(usize::MAX - 0xff));
        assert!(!image.contains(usize::MAX - 0x100));
        assert!(!image.contains(0));

        let oversized = unsafe { ModuleImage::from_raw_parts(usize::MAX - 0xff, 0x1000) };
        assert!(oversized.contains(usize::MAX));
        assert!(!oversized.contains(0x10));
    }
}
