//! Display policy selection
//!
//! The policy driver blacks out external displays on boards it does not know. Three independent
//! patches work around it; the operator picks them with short tokens.

use bitflags::bitflags;
use log::debug;

bitflags! {
    /// Display policy patches to apply
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PolicyPatches: u32 {
        /// Null the config string size passed to `strcmp`
        const NULL_CONFIG_SIZE = 1 << 1;
        /// Rename the `board-id` lookup so no board matches
        const BOARD_ID_RENAME = 1 << 2;
        /// Map the current board to the `none` profile
        const CONFIG_MAP = 1 << 3;
    }
}

/// Override tokens and the patch each one selects
const TOKENS: [(&str, PolicyPatches); 3] = [
    ("vit9696", PolicyPatches::NULL_CONFIG_SIZE),
    ("pikera", PolicyPatches::BOARD_ID_RENAME),
    ("cfgmap", PolicyPatches::CONFIG_MAP),
];

/// Boards the policy driver already handles
pub const COMPATIBLE_BOARDS: [&str; 11] = [
    "Mac-00BE6ED71E35EB86", // iMac13,1
    "Mac-27ADBB7B4CEE8E61", // iMac14,2
    "Mac-4B7AC7E43945597E", // MacBookPro9,1
    "Mac-77EB7D7DAF985301", // iMac14,3
    "Mac-C3EC7CD22292981F", // MacBookPro10,1
    "Mac-C9CF552659EA9913",
    "Mac-F221BEC8",         // MacPro5,1 and MacPro4,1
    "Mac-F221DCC8",         // iMac10,1
    "Mac-F42C88C8",         // MacPro3,1
    "Mac-FC02E91DDD3FA6A4", // iMac13,2
    "Mac-2BD1B31983FE1663", // MacBookPro11,3
];

/// Display policy state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DisplayPolicy {
    /// Nothing decided yet
    #[default]
    Unresolved,
    /// The operator asked for hardware detection
    Detect,
    /// These patches, possibly none
    Patches(PolicyPatches),
}

impl DisplayPolicy {
    /// Parses an override string. Tokens are matched as substrings in any order.
    pub fn parse(value: &str) -> Self {
        debug!(target: "gfxpatch", "display policy using config {value}");
        if value.contains("detect") {
            return Self::Detect;
        }
        if value.contains("ignore") {
            return Self::Patches(PolicyPatches::empty());
        }
        Self::Patches(
            TOKENS
                .iter()
                .filter(|(token, _)| value.contains(*token))
                .fold(PolicyPatches::empty(), |patches, &(_, patch)| patches | patch),
        )
    }

    /// Whether neither the operator nor a device decided yet
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved)
    }

    /// Whether the policy driver can be left alone
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Patches(patches) if patches.is_empty())
    }

    /// Final patch set; anything undecided means no patches
    pub fn finalize(self) -> PolicyPatches {
        match self {
            Self::Patches(patches) => patches,
            Self::Unresolved | Self::Detect => PolicyPatches::empty(),
        }
    }
}

/// Whether `board` is known to work without patches
pub fn is_compatible_board(board: &str) -> bool {
    COMPATIBLE_BOARDS.contains(&board)
}
