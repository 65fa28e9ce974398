//! Framebuffer fix mode

use log::error;

use crate::config::KernelVersion;

/// What to do with the boot console when the framebuffer driver initializes
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FixMode {
    /// Decide from the hardware; never survives the kernel stage
    #[default]
    Detect = 0,
    /// Only force verbose mode during initialization
    Reset = 1,
    /// Copy the boot console back after initialization
    Copy = 2,
    /// Clear the screen after initialization
    ZeroFill = 3,
    /// Leave the driver alone
    None = 4,
}

impl FixMode {
    /// Decodes the numeric boot argument value
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Detect),
            1 => Some(Self::Reset),
            2 => Some(Self::Copy),
            3 => Some(Self::ZeroFill),
            4 => Some(Self::None),
            _ => None,
        }
    }

    /// Mode requested by the operator on `kernel`
    pub fn requested(raw: Option<u32>, kernel: KernelVersion) -> Self {
        if kernel < KernelVersion::YOSEMITE {
            return Self::None;
        }
        match raw {
            None => Self::Detect,
            Some(raw) => Self::from_raw(raw).unwrap_or_else(|| {
                error!(target: "gfxpatch", "invalid framebuffer mode {raw}, falling back to autodetect");
                Self::Detect
            }),
        }
    }

    /// Terminal mode after the kernel stage; detection that found nothing disables the fix
    pub fn resolve(self) -> Self {
        match self {
            Self::Detect => Self::None,
            mode => mode,
        }
    }

    /// Whether the mode needs the boot console description
    pub fn needs_console(self) -> bool {
        matches!(self, Self::Copy | Self::ZeroFill)
    }
}
