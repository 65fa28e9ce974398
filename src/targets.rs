//! # Targets
//!
//! The driver modules this crate patches, the symbols it needs in them and the byte patches it
//! applies.

use crate::patcher::lookup::PatchDescriptor;

/// Framebuffer family driver
pub const IOGRAPHICS_ID: &str = "com.apple.iokit.IOGraphicsFamily";

/// Candidate locations of [`IOGRAPHICS_ID`]
pub const IOGRAPHICS_PATHS: &[&str] =
    &["/System/Library/Extensions/IOGraphicsFamily.kext/IOGraphicsFamily"];

/// Display policy driver
pub const GRAPHICS_POLICY_ID: &str = "com.apple.driver.AppleGraphicsDevicePolicy";

/// Candidate locations of [`GRAPHICS_POLICY_ID`]
pub const GRAPHICS_POLICY_PATHS: &[&str] = &["/System/Library/Extensions/AppleGraphicsControl.kext/Contents/PlugIns/AppleGraphicsDevicePolicy.kext/Contents/MacOS/AppleGraphicsDevicePolicy"];

/// `IOFramebuffer::initFB()`, hooked in [`IOGRAPHICS_ID`]
pub const FRAMEBUFFER_INIT: &str = "__ZN13IOFramebuffer6initFBEv";

/// `gIOFBVerboseBoot` in [`IOGRAPHICS_ID`]
pub const VERBOSE_BOOT: &str = "__ZL16gIOFBVerboseBoot";

/// `AppleGraphicsDevicePolicy::start(IOService*)`, hooked in [`GRAPHICS_POLICY_ID`]
pub const POLICY_START: &str = "__ZN25AppleGraphicsDevicePolicy5startEP9IOService";

/// The kernel's console description
pub const CONSOLE_INFO: &str = "_vinfo";

/// `mov edx, 5` becomes `mov edx, 0`, so the config string compare checks nothing
pub const NULL_CONFIG_SIZE_PATCH: PatchDescriptor = PatchDescriptor::new(
    &[0xba, 0x05, 0x00, 0x00, 0x00],
    &[0xba, 0x00, 0x00, 0x00, 0x00],
    1,
);

/// Renames the `board-id` property lookup so no board specific config is found
pub const BOARD_ID_RENAME_PATCH: PatchDescriptor =
    PatchDescriptor::new(b"board-id\0", b"board-ix\0", 1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patches_keep_length() {
        for patch in [NULL_CONFIG_SIZE_PATCH, BOARD_ID_RENAME_PATCH] {
            assert_eq!(patch.find().len(), patch.replace().len());
            assert_eq!(patch.count(), 1);
        }
        assert_eq!(BOARD_ID_RENAME_PATCH.find().last(), Some(&0));
    }
}
