//! # Console
//!
//! Keeps the boot console visible across framebuffer driver initialization.
//!
//! Reinitializing a framebuffer wipes whatever the boot loader and kernel drew. Depending on the
//! [`FixMode`], [`ConsoleBufferGuard`] copies the console pixels away before the driver's init
//! routine runs and writes them back afterwards, or clears the screen so no garbage remains.

use std::fmt;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::{debug, error};

use crate::error::FixError;
use crate::policy::FixMode;

/// The kernel's console description (`struct vc_info`)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawConsoleInfo {
    /// Height in pixels
    pub v_height: u32,
    /// Width in pixels
    pub v_width: u32,
    /// Bits per pixel
    pub v_depth: u32,
    /// Bytes per row
    pub v_rowbytes: u32,
    /// Virtual address of the pixel buffer, 0 when unmapped
    pub v_baseaddr: usize,
    pub v_type: u32,
    pub v_name: [u8; 32],
    pub v_physaddr: u64,
    /// Height in characters
    pub v_rows: u32,
    /// Width in characters
    pub v_columns: u32,
    pub v_rowscanbytes: u32,
    pub v_scale: u32,
    pub v_rotate: u32,
    pub v_reserved: [u32; 3],
}

/// Shape of a pixel buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Geometry {
    /// Bytes per row, including padding
    pub row_bytes: u32,
    /// Visible width in pixels
    pub width: u32,
    /// Visible height in pixels
    pub height: u32,
    /// Bits per pixel
    pub depth: u32,
}

impl Geometry {
    /// Size of a buffer with this geometry
    pub fn byte_len(&self) -> usize {
        self.row_bytes as usize * self.height as usize
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{}bpp ({} bytes per row)",
            self.width, self.height, self.depth, self.row_bytes
        )
    }
}

/// Boot console geometry and where its pixels live
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsoleInfo {
    /// Console geometry
    geometry: Geometry,
    /// Pixel buffer address, 0 when unavailable
    base: usize,
}

impl ConsoleInfo {
    /// Describes a console whose pixels are at `base`
    ///
    /// # Safety
    ///
    /// Unless 0, `base` must be readable for `geometry.byte_len()` bytes whenever the framebuffer
    /// init routine is called
    pub unsafe fn new(geometry: Geometry, base: usize) -> Self {
        Self { geometry, base }
    }

    /// Describes a console whose pixels cannot be read
    pub fn without_buffer(geometry: Geometry) -> Self {
        Self { geometry, base: 0 }
    }

    /// Reads the kernel's console description
    ///
    /// # Safety
    ///
    /// `address` must point at a `vc_info` whose buffer fulfills the contract of
    /// [`ConsoleInfo::new`]
    pub unsafe fn read_from(address: usize) -> Self {
        let raw = (address as *const RawConsoleInfo).read_unaligned();
        debug!(
            target: "gfxpatch",
            "vinfo 1: {}:{} {}:{}:{}",
            raw.v_height, raw.v_width, raw.v_depth, raw.v_rowbytes, raw.v_type
        );
        debug!(
            target: "gfxpatch",
            "vinfo 2: {} {}:{} {}:{}:{}",
            String::from_utf8_lossy(raw.v_name.split(|&b| b == 0).next().unwrap_or_default()),
            raw.v_rows, raw.v_columns, raw.v_rowscanbytes, raw.v_scale, raw.v_rotate
        );
        Self::new(
            Geometry {
                row_bytes: raw.v_rowbytes,
                width: raw.v_width,
                height: raw.v_height,
                depth: raw.v_depth,
            },
            raw.v_baseaddr,
        )
    }

    /// Console geometry
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }
}

/// Current mode of a framebuffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplayMode {
    /// Driver mode identifier
    pub id: i32,
    /// Driver depth index
    pub depth: i32,
}

/// Pixel layout of a display mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelInformation {
    pub bytes_per_row: u32,
    pub bits_per_pixel: u32,
    pub active_width: u32,
    pub active_height: u32,
}

impl PixelInformation {
    /// Geometry of a buffer in this layout
    pub fn geometry(&self) -> Geometry {
        Geometry {
            row_bytes: self.bytes_per_row,
            width: self.active_width,
            height: self.active_height,
            depth: self.bits_per_pixel,
        }
    }
}

/// The framebuffer being initialized, as exposed by the host's driver bindings
pub trait Framebuffer {
    /// Current display mode, `None` if the driver cannot tell
    fn current_display_mode(&self) -> Option<DisplayMode>;
    /// Pixel layout of `mode` through the system aperture
    fn pixel_information(&self, mode: DisplayMode) -> Option<PixelInformation>;
    /// Mapped video memory, if the driver mapped it
    fn vram(&mut self) -> Option<&mut [u8]>;
}

/// The driver's verbose boot switch. While set, the driver does not draw its boot background.
pub trait VerboseFlag {
    /// Current value
    fn get(&self) -> u8;
    /// Overwrites the value
    fn set(&self, value: u8);
}

impl VerboseFlag for AtomicU8 {
    fn get(&self) -> u8 {
        self.load(Ordering::Acquire)
    }

    fn set(&self, value: u8) {
        self.store(value, Ordering::Release)
    }
}

/// Verbose flag living inside a loaded module
#[derive(Debug)]
pub struct VerbosePtr(NonNull<u8>);

// The flag is a single byte the driver only touches from the serialized init path
unsafe impl Send for VerbosePtr {}
unsafe impl Sync for VerbosePtr {}

impl VerbosePtr {
    /// Wraps the address of the flag, `None` if null
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for volatile reads and writes for the rest of the process
    pub unsafe fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }
}

impl VerboseFlag for VerbosePtr {
    fn get(&self) -> u8 {
        // Safety: guaranteed by `VerbosePtr::new`
        unsafe { self.0.as_ptr().read_volatile() }
    }

    fn set(&self, value: u8) {
        // Safety: guaranteed by `VerbosePtr::new`
        unsafe { self.0.as_ptr().write_volatile(value) }
    }
}

/// What one guarded init call did to the screen
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The console snapshot was written back
    Restored,
    /// Video memory was cleared
    Blanked,
    /// Video memory was left as the driver made it
    Skipped,
}

/// Backs up and restores the boot console around the framebuffer init routine
#[derive(Debug)]
pub struct ConsoleBufferGuard {
    /// Resolved fix mode
    mode: FixMode,
    /// Console geometry, `None` when the console could not be described
    geometry: Option<Geometry>,
    /// Live console buffer; swapped to 0 by the first capture attempt
    live: AtomicUsize,
    /// Copy of the console, never freed
    snapshot: OnceLock<&'static [u8]>,
}

impl ConsoleBufferGuard {
    /// Creates the guard for `mode`. Without `console` neither copying nor clearing happens.
    pub fn new(mode: FixMode, console: Option<ConsoleInfo>) -> Self {
        Self {
            mode,
            geometry: console.map(|console| console.geometry),
            live: AtomicUsize::new(console.map_or(0, |console| console.base)),
            snapshot: OnceLock::new(),
        }
    }

    /// The captured console, if any
    pub fn snapshot(&self) -> Option<&'static [u8]> {
        self.snapshot.get().copied()
    }

    /// Copies the live console once. The live address is dropped even when the copy fails, as
    /// the buffer may be gone by the next call.
    fn capture(&self, geometry: Geometry) {
        let base = self.live.swap(0, Ordering::AcqRel);
        if base == 0 {
            return;
        }

        let len = geometry.byte_len();
        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(len).is_err() {
            error!(target: "gfxpatch", "{}", FixError::AllocationFailure { size: len });
            return;
        }
        // Safety: guaranteed by `ConsoleInfo::new`
        buffer.extend_from_slice(unsafe { slice::from_raw_parts(base as *const u8, len) });
        if self.snapshot.set(Box::leak(buffer.into_boxed_slice())).is_err() {
            error!(target: "gfxpatch", "console captured twice");
        }
    }

    /// Whether the framebuffer still shows the console's geometry
    fn geometry_matches<F: Framebuffer + ?Sized>(fb: &F, expected: Geometry) -> bool {
        let Some(info) = fb
            .current_display_mode()
            .and_then(|mode| fb.pixel_information(mode))
        else {
            debug!(target: "gfxpatch", "failed to obtain display mode");
            return false;
        };

        let actual = info.geometry();
        if actual != expected {
            debug!(target: "gfxpatch", "{}", FixError::GeometryMismatch { expected, actual });
            return false;
        }
        true
    }

    /// Runs `original` on `fb` and fixes the screen up afterwards
    pub fn around_init<F, V, O>(&self, fb: &mut F, verbose: &V, original: O) -> Outcome
    where
        F: Framebuffer + ?Sized,
        V: VerboseFlag + ?Sized,
        O: FnOnce(&mut F),
    {
        let mut copy = false;
        let mut zero_fill = false;
        if let Some(geometry) = self.geometry {
            copy = self.mode == FixMode::Copy;
            zero_fill = self.mode == FixMode::ZeroFill;
            if copy {
                self.capture(geometry);
            }
        }

        let verbose_boot = verbose.get();
        // restoring over verbose output would hide it
        copy = copy && self.snapshot.get().is_some() && verbose_boot == 0;

        if let Some(geometry) = self.geometry.filter(|_| copy || zero_fill) {
            if !Self::geometry_matches(fb, geometry) {
                copy = false;
                zero_fill = false;
            }
        }

        if !copy {
            verbose.set(1);
        }
        original(fb);
        if !copy {
            verbose.set(verbose_boot);
        }

        let (Some(geometry), Some(vram)) = (self.geometry, fb.vram()) else {
            return Outcome::Skipped;
        };
        let len = geometry.byte_len().min(vram.len());
        match self.snapshot.get() {
            Some(snapshot) if copy => {
                let len = len.min(snapshot.len());
                debug!(target: "gfxpatch", "attempting to copy...");
                vram[..len].copy_from_slice(&snapshot[..len]);
                Outcome::Restored
            }
            _ if zero_fill => {
                debug!(target: "gfxpatch", "doing zero-fill...");
                vram[..len].fill(0);
                Outcome::Blanked
            }
            _ => Outcome::Skipped,
        }
    }
}
