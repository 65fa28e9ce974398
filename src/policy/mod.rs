//! # Policy
//!
//! Decides which fixes run on this machine. Both decisions are made once, during the kernel
//! stage, and never change afterwards.
//!
//! The framebuffer [`FixMode`] comes from the operator or falls back to doing nothing. The
//! [`DisplayPolicy`] comes from the operator, then from GPU properties, and is finally vetoed by
//! the hardware gate in [`policy_patches_required`].

use log::{debug, error};

use crate::config::FixConfig;
use crate::error::FixError;

pub mod device;
pub mod display;
pub mod fix_mode;

pub use device::{DeviceProfile, FirmwareVendor, GpuDevice, PropertyStore, PropertyValue};
pub use display::{DisplayPolicy, PolicyPatches};
pub use fix_mode::FixMode;

/// GPU property carrying display policy tokens
pub const POLICY_PROPERTY: &str = "agdpmod";

/// Policy service property mapping board identifiers to profiles
pub const CONFIG_MAP_KEY: &str = "ConfigMap";

/// Profile name that turns the policy off for a board
const NO_POLICY_PROFILE: &str = "none";

/// Whether display policy patches can help on this hardware at all
pub fn policy_patches_required(profile: &DeviceProfile) -> bool {
    debug!(target: "gfxpatch", "detecting policy");
    // the patches only concern discrete GPUs
    if profile.external.is_empty() {
        debug!(target: "gfxpatch", "no external gpus");
        return false;
    }
    // and break genuine Mac laptops
    if profile.firmware_vendor == FirmwareVendor::Apple {
        debug!(target: "gfxpatch", "apple firmware");
        return false;
    }
    debug!(target: "gfxpatch", "board is {}", profile.board_id);
    if display::is_compatible_board(&profile.board_id) {
        debug!(target: "gfxpatch", "disabling display policy patches on model {}", profile.board_id);
        return false;
    }
    true
}

/// Terminal decisions of the kernel stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    /// Framebuffer fix mode, never [`FixMode::Detect`]
    pub mode: FixMode,
    /// Display policy patches to apply
    pub patches: PolicyPatches,
}

impl Resolution {
    /// Whether the framebuffer driver has to be hooked
    pub fn framebuffer_enabled(&self) -> bool {
        self.mode != FixMode::None
    }

    /// Whether the policy driver has to be patched
    pub fn policy_enabled(&self) -> bool {
        !self.patches.is_empty()
    }
}

/// Turns operator overrides and the device profile into a [`Resolution`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PolicyEngine {
    /// Mode requested before detection
    requested_mode: FixMode,
    /// Policy requested before detection
    requested_policy: DisplayPolicy,
}

impl PolicyEngine {
    /// Creates an engine from already parsed requests
    pub fn new(requested_mode: FixMode, requested_policy: DisplayPolicy) -> Self {
        Self {
            requested_mode,
            requested_policy,
        }
    }

    /// Reads the requests from operator configuration
    pub fn from_config(config: &FixConfig) -> Self {
        Self::new(
            FixMode::requested(config.framebuffer_mode, config.kernel),
            config
                .display_policy
                .as_deref()
                .map(DisplayPolicy::parse)
                .unwrap_or_default(),
        )
    }

    /// Mode requested before detection
    pub fn requested_mode(&self) -> FixMode {
        self.requested_mode
    }

    /// Policy requested before detection
    pub fn requested_policy(&self) -> DisplayPolicy {
        self.requested_policy
    }

    /// Makes both decisions for `profile`
    pub fn resolve(&self, profile: &DeviceProfile) -> Resolution {
        let mut policy = self.requested_policy;
        if policy.is_unresolved() {
            if let Some(found) = policy_from_devices(profile) {
                policy = found;
            }
        }

        let patches = if policy_patches_required(profile) {
            policy.finalize()
        } else {
            PolicyPatches::empty()
        };

        Resolution {
            mode: self.requested_mode.resolve(),
            patches,
        }
    }
}

/// Policy named by the first GPU carrying a usable [`POLICY_PROPERTY`]
fn policy_from_devices(profile: &DeviceProfile) -> Option<DisplayPolicy> {
    profile
        .external
        .iter()
        .chain(profile.builtin.as_ref())
        .find_map(|device| {
            let value = device.property(POLICY_PROPERTY)?;
            debug!(target: "gfxpatch", "found {POLICY_PROPERTY} in gpu {}", device.name);
            let config = value.as_config_str(POLICY_PROPERTY).ok()?;
            Some(DisplayPolicy::parse(&config))
        })
}

/// Maps `board` to the profile without a policy in the service's [`CONFIG_MAP_KEY`]
pub fn augment_config_map<S: PropertyStore + ?Sized>(
    service: &mut S,
    board: &str,
) -> Result<(), FixError> {
    match service.property(CONFIG_MAP_KEY) {
        Some(PropertyValue::Dictionary(mut map)) => {
            map.insert(
                board.to_owned(),
                PropertyValue::Text(NO_POLICY_PROFILE.to_owned()),
            );
            service.set_property(CONFIG_MAP_KEY, PropertyValue::Dictionary(map));
            Ok(())
        }
        _ => {
            error!(target: "gfxpatch", "failed to obtain valid {CONFIG_MAP_KEY}");
            Err(FixError::PropertyReadFailure {
                key: CONFIG_MAP_KEY.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::KernelVersion;

    /// A profile that passes the hardware gate
    fn hackintosh(external: Vec<GpuDevice>) -> DeviceProfile {
        DeviceProfile {
            firmware_vendor: FirmwareVendor::Ami,
            board_id: "Mac-7BA5B2D9E42DDD94".into(),
            external,
            builtin: None,
        }
    }

    fn engine(policy: Option<&str>) -> PolicyEngine {
        PolicyEngine::from_config(&FixConfig {
            framebuffer_mode: None,
            display_policy: policy.map(str::to_owned),
            kernel: KernelVersion(19),
        })
    }

    #[test]
    fn test_override() {
        let profile = hackintosh(vec![GpuDevice::new("GFX0")]);
        let resolution = engine(Some("pikera,vit9696")).resolve(&profile);

        assert_eq!(
            resolution.patches,
            PolicyPatches::BOARD_ID_RENAME | PolicyPatches::NULL_CONFIG_SIZE
        );
        assert_eq!(resolution.mode, FixMode::None);
    }

    #[test]
    /// Undecided policies finalize to nothing
    fn test_detect_and_default() {
        let profile = hackintosh(vec![GpuDevice::new("GFX0")]);
        assert!(!engine(Some("detect,pikera")).resolve(&profile).policy_enabled());
        assert!(!engine(None).resolve(&profile).policy_enabled());
    }

    #[test]
    /// The first external GPU with a usable property decides, then the builtin one
    fn test_device_properties() {
        let mut profile = hackintosh(vec![
            GpuDevice::new("GFX0")
                .with_property(POLICY_PROPERTY, PropertyValue::Data(b"cfgmap".to_vec())),
            GpuDevice::new("GFX1")
                .with_property(POLICY_PROPERTY, PropertyValue::Data(b"pikera\0".to_vec())),
            GpuDevice::new("GFX2").with_property(POLICY_PROPERTY, PropertyValue::Text("vit9696".into())),
        ]);
        profile.builtin = Some(
            GpuDevice::new("IGPU").with_property(POLICY_PROPERTY, PropertyValue::Text("cfgmap".into())),
        );
        assert_eq!(
            engine(None).resolve(&profile).patches,
            PolicyPatches::BOARD_ID_RENAME
        );

        let mut profile = hackintosh(vec![GpuDevice::new("GFX0")]);
        profile.builtin = Some(
            GpuDevice::new("IGPU").with_property(POLICY_PROPERTY, PropertyValue::Text("cfgmap".into())),
        );
        assert_eq!(engine(None).resolve(&profile).patches, PolicyPatches::CONFIG_MAP);
    }

    #[test]
    /// Properties are only consulted when the operator said nothing
    fn test_override_beats_properties() {
        let profile = hackintosh(vec![GpuDevice::new("GFX0")
            .with_property(POLICY_PROPERTY, PropertyValue::Text("pikera".into()))]);
        assert!(!engine(Some("ignore")).resolve(&profile).policy_enabled());
        assert!(!engine(Some("detect")).resolve(&profile).policy_enabled());
    }

    #[test]
    /// The hardware gate overrides operator and device choices
    fn test_hardware_gate() {
        let cfgmap = GpuDevice::new("GFX0").with_property(POLICY_PROPERTY, PropertyValue::Text("cfgmap".into()));

        let no_gpu = hackintosh(Vec::new());
        assert!(!policy_patches_required(&no_gpu));
        assert!(!engine(Some("vit9696,pikera,cfgmap")).resolve(&no_gpu).policy_enabled());

        let mut apple = hackintosh(vec![cfgmap.clone()]);
        apple.firmware_vendor = FirmwareVendor::Apple;
        assert!(!engine(Some("pikera")).resolve(&apple).policy_enabled());
        assert!(!engine(None).resolve(&apple).policy_enabled());

        let mut board = hackintosh(vec![cfgmap]);
        board.board_id = "Mac-F221BEC8".into();
        assert!(!engine(Some("vit9696")).resolve(&board).policy_enabled());
    }

    #[test]
    fn test_framebuffer_mode() {
        let profile = DeviceProfile::default();
        let config = FixConfig {
            framebuffer_mode: Some(3),
            display_policy: None,
            kernel: KernelVersion(19),
        };
        let resolution = PolicyEngine::from_config(&config).resolve(&profile);
        assert_eq!(resolution.mode, FixMode::ZeroFill);
        assert!(resolution.framebuffer_enabled());

        let config = FixConfig {
            framebuffer_mode: Some(9),
            ..config
        };
        let engine = PolicyEngine::from_config(&config);
        assert_eq!(engine.requested_mode(), FixMode::Detect);
        assert!(!engine.resolve(&profile).framebuffer_enabled());
    }

    #[test]
    fn test_augment_config_map() {
        let mut service = GpuDevice::new("AGDP").with_property(
            CONFIG_MAP_KEY,
            PropertyValue::Dictionary(BTreeMap::from([(
                "Mac-F60DEB81FF30ACF6".to_owned(),
                PropertyValue::Text("Config1".into()),
            )])),
        );

        augment_config_map(&mut service, "Mac-7BA5B2D9E42DDD94").unwrap();

        let Some(PropertyValue::Dictionary(map)) = service.property(CONFIG_MAP_KEY) else {
            panic!("ConfigMap is no longer a dictionary");
        };
        assert_eq!(map.len(), 2);
        assert_eq!(
            map["Mac-7BA5B2D9E42DDD94"],
            PropertyValue::Text("none".into())
        );
    }

    #[test]
    /// Missing or malformed maps are left alone
    fn test_augment_config_map_failure() {
        let mut missing = GpuDevice::new("AGDP");
        assert!(augment_config_map(&mut missing, "Mac-1").is_err());
        assert_eq!(missing.property(CONFIG_MAP_KEY), None);

        let mut text = GpuDevice::new("AGDP").with_property(CONFIG_MAP_KEY, PropertyValue::Text("x".into()));
        assert!(augment_config_map(&mut text, "Mac-1").is_err());
        assert_eq!(
            text.property(CONFIG_MAP_KEY),
            Some(PropertyValue::Text("x".into()))
        );
    }
}
