//! # Symbol
//!
//! Resolving named routines and data inside loaded modules.

use std::collections::HashMap;

use crate::module::ModuleImage;

/// Looks up symbols inside a loaded module
///
/// Implemented by the host on top of its module loader. Lookups are pure; a `None` disables the
/// fix that needed the symbol and nothing else.
pub trait SymbolResolver {
    /// Absolute address of `symbol` in `image`
    fn resolve(&self, image: &ModuleImage, symbol: &str) -> Option<usize>;
}

/// Symbol offsets known ahead of time, keyed by module load address
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    /// `(module base, symbol)` to offset from the base
    offsets: HashMap<(usize, String), usize>,
}

impl SymbolTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `symbol` at `offset` bytes into the module loaded at `base`
    pub fn insert(&mut self, base: usize, symbol: impl Into<String>, offset: usize) {
        self.offsets.insert((base, symbol.into()), offset);
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with(mut self, base: usize, symbol: impl Into<String>, offset: usize) -> Self {
        self.insert(base, symbol, offset);
        self
    }
}

impl SymbolResolver for SymbolTable {
    fn resolve(&self, image: &ModuleImage, symbol: &str) -> Option<usize> {
        let offset = *self.offsets.get(&(image.base(), symbol.to_owned()))?;
        let address = image.base().checked_add(offset)?;
        // offsets from a different build of the module can point past its end
        image.contains(address).then_some(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let image = unsafe { ModuleImage::from_raw_parts(0x10_0000, 0x2000) };
        let table = SymbolTable::new()
            .with(0x10_0000, "_vinfo", 0x40)
            .with(0x10_0000, "_past_end", 0x2000);

        assert_eq!(table.resolve(&image, "_vinfo"), Some(0x10_0040));
        assert_eq!(table.resolve(&image, "_missing"), None);
        assert_eq!(table.resolve(&image, "_past_end"), None);
    }

    #[test]
    fn test_modules_are_separate() {
        let first = unsafe { ModuleImage::from_raw_parts(0x10_0000, 0x1000) };
        let second = unsafe { ModuleImage::from_raw_parts(0x20_0000, 0x1000) };
        let table = SymbolTable::new().with(0x10_0000, "_start", 0x10);

        assert_eq!(table.resolve(&first, "_start"), Some(0x10_0010));
        assert_eq!(table.resolve(&second, "_start"), None);
    }
}
