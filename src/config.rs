//! # Config
//!
//! Operator overrides and the kernel the engine runs on.
//!
//! On a booting machine the overrides come from boot arguments through [`BootArgs`]; hosts and
//! tests can also describe them in TOML.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boot argument selecting the framebuffer fix mode by number
pub const FRAMEBUFFER_MODE_ARG: &str = "gfxrst";

/// Boot argument carrying the display policy tokens
pub const DISPLAY_POLICY_ARG: &str = "agdpmod";

/// Major version of the host kernel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelVersion(pub u32);

impl KernelVersion {
    /// First kernel whose framebuffer driver needs the console fix
    pub const YOSEMITE: Self = Self(14);
    /// First kernel with the policy start symbols stripped
    pub const MOJAVE: Self = Self(18);
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "darwin {}", self.0)
    }
}

/// Boot argument storage provided by the host
pub trait BootArgs {
    /// Numeric argument `name`, if present and numeric
    fn number(&self, name: &str) -> Option<u32>;
    /// String argument `name`, if present
    fn string(&self, name: &str) -> Option<String>;
}

/// Errors loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML did not describe a [`FixConfig`]
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Operator-facing settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixConfig {
    /// Raw framebuffer fix mode override, validated later
    #[serde(default)]
    pub framebuffer_mode: Option<u32>,
    /// Display policy override tokens
    #[serde(default)]
    pub display_policy: Option<String>,
    /// Running kernel
    #[serde(default, rename = "kernel_major")]
    pub kernel: KernelVersion,
}

impl FixConfig {
    /// Reads the overrides from boot arguments
    pub fn from_boot_args(args: &dyn BootArgs, kernel: KernelVersion) -> Self {
        Self {
            framebuffer_mode: args.number(FRAMEBUFFER_MODE_ARG),
            display_policy: args.string(DISPLAY_POLICY_ARG),
            kernel,
        }
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct Args(HashMap<&'static str, &'static str>);

    impl BootArgs for Args {
        fn number(&self, name: &str) -> Option<u32> {
            self.0.get(name)?.parse().ok()
        }
        fn string(&self, name: &str) -> Option<String> {
            self.0.get(name).map(|value| value.to_string())
        }
    }

    #[test]
    fn test_from_boot_args() {
        let args = Args(HashMap::from([("gfxrst", "2"), ("agdpmod", "pikera")]));
        let config = FixConfig::from_boot_args(&args, KernelVersion(20));

        assert_eq!(config.framebuffer_mode, Some(2));
        assert_eq!(config.display_policy.as_deref(), Some("pikera"));
        assert_eq!(config.kernel, KernelVersion(20));
    }

    #[test]
    fn test_missing_boot_args() {
        let config = FixConfig::from_boot_args(&Args(HashMap::new()), KernelVersion::YOSEMITE);
        assert_eq!(config.framebuffer_mode, None);
        assert_eq!(config.display_policy, None);
    }

    #[test]
    fn test_from_toml() {
        let config = FixConfig::from_toml(
            r#"
            framebuffer_mode = 3
            display_policy = "vit9696,cfgmap"
            kernel_major = 17
            "#,
        )
        .unwrap();

        assert_eq!(config.framebuffer_mode, Some(3));
        assert_eq!(config.display_policy.as_deref(), Some("vit9696,cfgmap"));
        assert_eq!(config.kernel, KernelVersion(17));
        assert!(config.kernel < KernelVersion::MOJAVE);
    }

    #[test]
    fn test_from_toml_defaults() {
        let config = FixConfig::from_toml("").unwrap();
        assert_eq!(config, FixConfig::default());
        assert!(FixConfig::from_toml("framebuffer_mode = \"copy\"").is_err());
    }
}
