//! Error types shared by the orchestration layer

use std::fmt::Display;

use thiserror::Error;

use crate::config::KernelVersion;
use crate::console::Geometry;
use crate::patcher::lookup::LookupError;

/// Everything that can stop a single fix from applying
#[derive(Debug, Error)]
pub enum FixError {
    /// A symbol the fix depends on is not in the module
    #[error("failed to resolve {symbol}")]
    SymbolUnresolved {
        /// Symbol name
        symbol: String,
    },
    /// A lookup patch did not match the expected number of times
    #[error("pattern matched {found} time(s), expected {expected}")]
    PatternMatchCountMismatch {
        /// Required matches
        expected: usize,
        /// Actual matches
        found: usize,
    },
    /// Writing a lookup patch failed
    #[error("failed to write patch at offset {offset:#x}: {message}")]
    WriteFault {
        /// Offset within the module image
        offset: usize,
        /// Underlying patcher error
        message: String,
    },
    /// The console snapshot could not be allocated
    #[error("failed to allocate {size} bytes for the console snapshot")]
    AllocationFailure {
        /// Requested size
        size: usize,
    },
    /// The display no longer has the geometry the console was captured with
    #[error("display is {actual}, console was captured at {expected}")]
    GeometryMismatch {
        /// Captured geometry
        expected: Geometry,
        /// Current geometry
        actual: Geometry,
    },
    /// A property was missing or had an unusable value
    #[error("property {key} is missing or malformed")]
    PropertyReadFailure {
        /// Property key
        key: String,
    },
    /// The fix cannot work on this kernel and must not be silently skipped
    #[error("{fix} has no effect on {kernel}")]
    UnsupportedOnThisVersion {
        /// Name of the fix
        fix: &'static str,
        /// Running kernel
        kernel: KernelVersion,
    },
    /// The symbol was already hooked, or a hook attempt was already made
    #[error("{symbol} was already hooked")]
    HookAlreadyInstalled {
        /// Symbol name
        symbol: String,
    },
    /// No hook descriptor exists for the symbol
    #[error("no hook registered for {symbol}")]
    UnregisteredHook {
        /// Symbol name
        symbol: String,
    },
    /// The redirect mechanism refused the target
    #[error("failed to hook {symbol}: {source}")]
    HookRejected {
        /// Symbol name
        symbol: String,
        /// Error from the hook implementation
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The host reported the same module loaded twice
    #[error("{id} was already reported loaded")]
    ModuleAlreadyLoaded {
        /// Module identifier
        id: String,
    },
}

impl FixError {
    /// Whether the host has to halt instead of carrying on without the fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnsupportedOnThisVersion { .. })
    }
}

impl<E: Display> From<LookupError<E>> for FixError {
    fn from(error: LookupError<E>) -> Self {
        match error {
            LookupError::OccurrenceMismatch { expected, found } => {
                Self::PatternMatchCountMismatch { expected, found }
            }
            LookupError::WriteFault { offset, error } => Self::WriteFault {
                offset,
                message: error.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_version_errors_are_fatal() {
        let fatal = FixError::UnsupportedOnThisVersion {
            fix: "cfgmap",
            kernel: KernelVersion::MOJAVE,
        };
        assert!(fatal.is_fatal());
        assert!(fatal.to_string().contains("darwin 18"));

        let benign = FixError::SymbolUnresolved {
            symbol: "_vinfo".into(),
        };
        assert!(!benign.is_fatal());
        assert!(benign.to_string().contains("_vinfo"));
    }

    #[test]
    fn test_lookup_conversion() {
        let error: FixError = LookupError::<&str>::OccurrenceMismatch {
            expected: 1,
            found: 3,
        }
        .into();
        assert!(matches!(
            error,
            FixError::PatternMatchCountMismatch {
                expected: 1,
                found: 3
            }
        ));

        let error: FixError = LookupError::WriteFault {
            offset: 0x40,
            error: "protection",
        }
        .into();
        assert_eq!(
            error.to_string(),
            "failed to write patch at offset 0x40: protection"
        );
    }
}
