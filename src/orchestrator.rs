//! # Orchestrator
//!
//! Ties the pieces together across the host's callbacks:
//!
//! 1. [`Orchestrator::start`] registers the modules that may need patching
//! 2. [`Orchestrator::process_kernel`] makes the policy decisions and reads the boot console
//! 3. [`Orchestrator::on_module_loaded`] patches a module once it is in memory
//! 4. [`Orchestrator::framebuffer_init`] and [`Orchestrator::graphics_policy_start`] run inside
//!    the hooked routines
//!
//! The host creates one orchestrator and hands out shared references to it. Every piece of state
//! is written at most once, so callbacks never block each other.

use std::sync::OnceLock;

use log::{debug, error, info, warn};

use crate::config::{FixConfig, KernelVersion};
use crate::console::{ConsoleBufferGuard, ConsoleInfo, Framebuffer, Outcome, VerbosePtr};
use crate::error::FixError;
use crate::hook::manager::{HookDescriptor, HookManager, OriginalFn};
use crate::hook::Hook;
use crate::module::{ModuleImage, ModuleLoadMonitor, ModuleSpec};
use crate::patcher::byte::BytePatcher;
use crate::patcher::lookup::{PatchDescriptor, PatternPatcher};
use crate::patcher::mem::PermissionWrapper;
use crate::policy::{
    augment_config_map, DeviceProfile, FixMode, PolicyEngine, PolicyPatches, PropertyStore,
    Resolution,
};
use crate::symbol::SymbolResolver;
use crate::targets::{
    BOARD_ID_RENAME_PATCH, CONSOLE_INFO, FRAMEBUFFER_INIT, GRAPHICS_POLICY_ID,
    GRAPHICS_POLICY_PATHS, IOGRAPHICS_ID, IOGRAPHICS_PATHS, NULL_CONFIG_SIZE_PATCH, POLICY_START,
    VERBOSE_BOOT,
};

/// Entry points of the host's ABI shims for the hooked routines
#[derive(Clone, Copy, Debug)]
pub struct Wrappers {
    /// Replacement for [`FRAMEBUFFER_INIT`]
    framebuffer_init: *const u8,
    /// Replacement for [`POLICY_START`]
    policy_start: *const u8,
}

impl Wrappers {
    /// Collects the shims
    ///
    /// # Safety
    ///
    /// Each pointer must be a function with the signature and calling convention of the routine
    /// it replaces, alive for the rest of the process
    pub unsafe fn new(framebuffer_init: *const u8, policy_start: *const u8) -> Self {
        Self {
            framebuffer_init,
            policy_start,
        }
    }
}

/// Context shared by every host callback
pub struct Orchestrator<H: Hook, R: SymbolResolver> {
    /// Operator requests
    engine: PolicyEngine,
    /// Running kernel
    kernel: KernelVersion,
    /// Framebuffer family driver
    framebuffer: ModuleSpec,
    /// Display policy driver
    policy: ModuleSpec,
    /// Hooks on both drivers
    hooks: HookManager<H>,
    /// Symbol lookup in loaded modules
    resolver: R,
    /// Byte patches on the policy driver
    patcher: PatternPatcher<PermissionWrapper<BytePatcher>>,
    /// Decisions of the kernel stage
    resolution: OnceLock<Resolution>,
    /// Console fix state
    console: OnceLock<ConsoleBufferGuard>,
    /// Verbose flag inside the framebuffer driver
    verbose: OnceLock<VerbosePtr>,
    /// Board identifier written into the policy config map
    board_id: OnceLock<String>,
}

impl<H: Hook, R: SymbolResolver> Orchestrator<H, R> {
    /// Creates the orchestrator from operator configuration
    pub fn new(config: &FixConfig, wrappers: Wrappers, hook: H, resolver: R) -> Self {
        // Safety: guaranteed by `Wrappers::new`
        let descriptors = unsafe {
            vec![
                HookDescriptor::new(FRAMEBUFFER_INIT, wrappers.framebuffer_init),
                HookDescriptor::new(POLICY_START, wrappers.policy_start),
            ]
        };

        Self {
            engine: PolicyEngine::from_config(config),
            kernel: config.kernel,
            framebuffer: ModuleSpec::new(IOGRAPHICS_ID, IOGRAPHICS_PATHS),
            policy: ModuleSpec::new(GRAPHICS_POLICY_ID, GRAPHICS_POLICY_PATHS),
            hooks: HookManager::new(hook, descriptors),
            resolver,
            patcher: PatternPatcher::new(PermissionWrapper::default()),
            resolution: OnceLock::new(),
            console: OnceLock::new(),
            verbose: OnceLock::new(),
            board_id: OnceLock::new(),
        }
    }

    /// Framebuffer family driver
    pub fn framebuffer_module(&self) -> &ModuleSpec {
        &self.framebuffer
    }

    /// Display policy driver
    pub fn policy_module(&self) -> &ModuleSpec {
        &self.policy
    }

    /// Decisions of the kernel stage, once it ran
    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution.get().copied()
    }

    /// Console fix state, once the kernel stage ran
    pub fn console(&self) -> Option<&ConsoleBufferGuard> {
        self.console.get()
    }

    /// Original code of a hooked routine
    pub fn original(&self, symbol: &str) -> Option<OriginalFn> {
        self.hooks.original(symbol)
    }

    /// Registers every module the operator did not rule out
    pub fn start(&self, monitor: &mut dyn ModuleLoadMonitor) {
        if self.engine.requested_mode() != FixMode::None {
            self.framebuffer.register(monitor);
        }
        if !self.engine.requested_policy().is_disabled() {
            self.policy.register(monitor);
        }
    }

    /// Makes the policy decisions for `profile` and switches off modules without a fix.
    ///
    /// `kernel_image` is searched for the console description. Only the first call has an
    /// effect.
    pub fn process_kernel(
        &self,
        profile: &DeviceProfile,
        kernel_image: &ModuleImage,
        monitor: &mut dyn ModuleLoadMonitor,
    ) {
        let resolution = self.engine.resolve(profile);
        if self.resolution.set(resolution).is_err() {
            warn!(target: "gfxpatch", "kernel stage processed twice");
            return;
        }
        let _ = self.board_id.set(profile.board_id.clone());
        debug!(target: "gfxpatch", "resolved {resolution:?}");

        if !resolution.framebuffer_enabled() {
            self.framebuffer.switch_off(monitor);
        }
        if !resolution.policy_enabled() {
            self.policy.switch_off(monitor);
        }

        let console = if resolution.mode.needs_console() {
            match self.resolver.resolve(kernel_image, CONSOLE_INFO) {
                // Safety: resolved addresses point at what the symbol names, see `ModuleImage`
                Some(address) => Some(unsafe { ConsoleInfo::read_from(address) }),
                None => {
                    error!(target: "gfxpatch", "failed to obtain vcinfo");
                    None
                }
            }
        } else {
            None
        };
        let _ = self
            .console
            .set(ConsoleBufferGuard::new(resolution.mode, console));
    }

    /// Patches the module `id` that was just loaded at `image`.
    ///
    /// Failures disable the affected fix and are only logged. The one error returned is fatal:
    /// the host has to stop instead of booting without a fix it was told to apply.
    ///
    /// # Safety
    ///
    /// `image` must be the freshly loaded module `id`, none of whose code has run yet
    pub unsafe fn on_module_loaded(&self, id: &str, image: &ModuleImage) -> Result<(), FixError> {
        let module = if id == self.framebuffer.id() {
            &self.framebuffer
        } else if id == self.policy.id() {
            &self.policy
        } else {
            return Ok(());
        };

        match module.mark_loaded() {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) => {
                warn!(target: "gfxpatch", "{err}, ignoring");
                return Ok(());
            }
        }

        let Some(resolution) = self.resolution() else {
            warn!(target: "gfxpatch", "{id} loaded before the kernel stage, leaving it alone");
            return Ok(());
        };

        if module.id() == IOGRAPHICS_ID {
            self.patch_framebuffer(image);
            Ok(())
        } else {
            self.patch_policy(image, resolution.patches)
        }
    }

    /// Resolves the verbose flag and hooks the framebuffer init routine
    ///
    /// # Safety
    ///
    /// See [`Orchestrator::on_module_loaded`]
    unsafe fn patch_framebuffer(&self, image: &ModuleImage) {
        let verbose = self
            .resolver
            .resolve(image, VERBOSE_BOOT)
            .and_then(|address| VerbosePtr::new(address as *mut u8));
        let Some(verbose) = verbose else {
            error!(target: "gfxpatch", "failed to resolve gIOFBVerboseBoot");
            return;
        };
        let _ = self.verbose.set(verbose);

        if let Err(err) = self.hooks.install(&self.resolver, image, FRAMEBUFFER_INIT) {
            error!(target: "gfxpatch", "framebuffer fix disabled: {err}");
        }
    }

    /// Applies the selected display policy patches
    ///
    /// # Safety
    ///
    /// See [`Orchestrator::on_module_loaded`]
    unsafe fn patch_policy(
        &self,
        image: &ModuleImage,
        patches: PolicyPatches,
    ) -> Result<(), FixError> {
        if patches.contains(PolicyPatches::NULL_CONFIG_SIZE) {
            self.apply_lookup(image, "null config size", &NULL_CONFIG_SIZE_PATCH);
        }
        if patches.contains(PolicyPatches::BOARD_ID_RENAME) {
            self.apply_lookup(image, "board-id rename", &BOARD_ID_RENAME_PATCH);
        }
        if patches.contains(PolicyPatches::CONFIG_MAP) {
            // the start routine is stripped from these kernels
            if self.kernel >= KernelVersion::MOJAVE {
                let err = FixError::UnsupportedOnThisVersion {
                    fix: "cfgmap",
                    kernel: self.kernel,
                };
                error!(target: "gfxpatch", "{err}, use agdpmod=ignore");
                return Err(err);
            }
            if let Err(err) = self.hooks.install(&self.resolver, image, POLICY_START) {
                error!(target: "gfxpatch", "config map fix disabled: {err}");
            }
        }
        Ok(())
    }

    /// Applies one byte patch, logging the result
    ///
    /// # Safety
    ///
    /// See [`Orchestrator::on_module_loaded`]
    unsafe fn apply_lookup(&self, image: &ModuleImage, name: &str, patch: &PatchDescriptor) {
        match self.patcher.apply(image, patch) {
            Ok(offsets) => info!(target: "gfxpatch", "applied {name} patch at {offsets:x?}"),
            Err(err) => {
                error!(target: "gfxpatch", "failed to apply {name} patch: {}", FixError::from(err))
            }
        }
    }

    /// Body of the framebuffer init hook. `original` calls the real routine.
    pub fn framebuffer_init<F, O>(&self, fb: &mut F, original: O) -> Outcome
    where
        F: Framebuffer + ?Sized,
        O: FnOnce(&mut F),
    {
        match (self.console.get(), self.verbose.get()) {
            (Some(console), Some(verbose)) => console.around_init(fb, verbose, original),
            _ => {
                original(fb);
                Outcome::Skipped
            }
        }
    }

    /// Body of the policy start hook. `original` calls the real routine and its result is passed
    /// through.
    pub fn graphics_policy_start<S, O, T>(&self, service: &mut S, original: O) -> T
    where
        S: PropertyStore + ?Sized,
        O: FnOnce(&mut S) -> T,
    {
        let config_map = self
            .resolution()
            .is_some_and(|resolution| resolution.patches.contains(PolicyPatches::CONFIG_MAP));
        if config_map {
            let board = self.board_id.get().map(String::as_str).unwrap_or_default();
            debug!(target: "gfxpatch", "config map fix got board-id {board}");
            // the failure is logged by `augment_config_map`, start proceeds regardless
            let _ = augment_config_map(service, board);
        }
        original(service)
    }
}
