//! Device description handed over by the host's enumeration

use std::collections::BTreeMap;

use log::debug;

use crate::error::FixError;

/// Who wrote the system firmware
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FirmwareVendor {
    /// Not recognized
    #[default]
    Unknown,
    /// Genuine Mac firmware
    Apple,
    /// Parallels Desktop virtual machine
    Parallels,
    /// VMware virtual machine
    VMware,
    /// EDK II based, including most open source loaders
    Edk2,
    /// American Megatrends
    Ami,
    /// Insyde H2O
    Insyde,
    /// Phoenix
    Phoenix,
    /// HP
    Hp,
}

/// A registry property value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyValue {
    /// String value
    Text(String),
    /// Raw bytes
    Data(Vec<u8>),
    /// Nested string-keyed values
    Dictionary(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Reads the value as a configuration string.
    ///
    /// Data values must end in a NUL byte and are read up to the first one.
    pub fn as_config_str(&self, key: &str) -> Result<String, FixError> {
        let failure = || FixError::PropertyReadFailure {
            key: key.to_owned(),
        };
        match self {
            Self::Text(text) => Ok(text.clone()),
            Self::Data(data) => {
                if data.last() != Some(&0) {
                    debug!(target: "gfxpatch", "{key} config is not null terminated");
                    return Err(failure());
                }
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                Ok(String::from_utf8_lossy(&data[..end]).into_owned())
            }
            Self::Dictionary(_) => Err(failure()),
        }
    }
}

/// String-keyed properties of a device or service
pub trait PropertyStore {
    /// Property `key`, if present
    fn property(&self, key: &str) -> Option<PropertyValue>;
    /// Replaces property `key`
    fn set_property(&mut self, key: &str, value: PropertyValue);
}

/// A GPU and a snapshot of its properties
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GpuDevice {
    /// Registry name, for logs
    pub name: String,
    /// Property snapshot
    pub properties: BTreeMap<String, PropertyValue>,
}

impl GpuDevice {
    /// Creates a device without properties
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder that adds a property
    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

impl PropertyStore for GpuDevice {
    fn property(&self, key: &str) -> Option<PropertyValue> {
        self.properties.get(key).cloned()
    }

    fn set_property(&mut self, key: &str, value: PropertyValue) {
        self.properties.insert(key.to_owned(), value);
    }
}

/// Everything the policy decisions look at
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Firmware vendor
    pub firmware_vendor: FirmwareVendor,
    /// Board identifier, e.g. `Mac-F221BEC8`
    pub board_id: String,
    /// Discrete GPUs in enumeration order
    pub external: Vec<GpuDevice>,
    /// Integrated GPU, if any
    pub builtin: Option<GpuDevice>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_str() {
        let text = PropertyValue::Text("pikera".into());
        assert_eq!(text.as_config_str("agdpmod").unwrap(), "pikera");

        let data = PropertyValue::Data(b"vit9696\0".to_vec());
        assert_eq!(data.as_config_str("agdpmod").unwrap(), "vit9696");

        let inner_nul = PropertyValue::Data(b"ignore\0junk\0".to_vec());
        assert_eq!(inner_nul.as_config_str("agdpmod").unwrap(), "ignore");
    }

    #[test]
    /// Blobs without a terminator and dictionaries are unusable
    fn test_config_str_failures() {
        for value in [
            PropertyValue::Data(b"pikera".to_vec()),
            PropertyValue::Data(Vec::new()),
            PropertyValue::Dictionary(BTreeMap::new()),
        ] {
            assert!(matches!(
                value.as_config_str("agdpmod"),
                Err(FixError::PropertyReadFailure { key }) if key == "agdpmod"
            ));
        }
    }
}
