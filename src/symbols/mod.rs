//! Symbol naming and load-time address resolution.
//!
//! Hook registrations name their target as library + export
//! ([`SymbolName`], case-insensitive per the Windows convention). At image
//! load time the session walks the container parser's export view
//! ([`ImageExports`]) and fills a [`SymbolTable`] mapping each name to its
//! resolved [`GuestAddress`]. Resolution happens exactly once per load, never
//! per dispatch; an unresolvable name surfaces
//! [`Error::UnresolvedSymbol`](crate::Error::UnresolvedSymbol) to the
//! registrant immediately.

use std::collections::HashMap;
use std::fmt;

use crate::{cpu::GuestAddress, Error, Result};

/// A library + export name pair, case-insensitive.
///
/// Comparison and hashing use a lowercased form; the original spelling is
/// kept for display. The library name is stored without a path, the way
/// import tables reference it.
#[derive(Clone, Debug)]
pub struct SymbolName {
    library: String,
    name: String,
    key: (String, String),
}

impl SymbolName {
    /// Creates a symbol name from library and export names.
    #[must_use]
    pub fn new(library: &str, name: &str) -> Self {
        SymbolName {
            library: library.to_string(),
            name: name.to_string(),
            key: (library.to_ascii_lowercase(), name.to_ascii_lowercase()),
        }
    }

    /// The library component, as given.
    #[must_use]
    pub fn library(&self) -> &str {
        &self.library
    }

    /// The export component, as given.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for SymbolName {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for SymbolName {}

impl std::hash::Hash for SymbolName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for SymbolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.library, self.name)
    }
}

/// The export view the external container parser produces for one image.
///
/// The runtime consumes this as plain data; parsing the PE container itself
/// is an external capability. Offsets are relative to the image base chosen
/// at load time.
#[derive(Clone, Debug, Default)]
pub struct ImageExports {
    /// Library name the exports belong to (e.g. `kernel32.dll`).
    pub library: String,
    /// Export name to offset from the image base.
    pub exports: HashMap<String, u32>,
}

/// Session-level map from symbol name to resolved guest address.
///
/// Each name maps to at most one address; when two loaded images export the
/// same name, the first-loaded image wins and later registrations for that
/// name are ignored.
#[derive(Debug, Default)]
pub struct SymbolTable {
    addresses: HashMap<SymbolName, GuestAddress>,
}

impl SymbolTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one export, keeping any first-loaded address for the name.
    pub fn insert(&mut self, symbol: SymbolName, address: GuestAddress) {
        self.addresses.entry(symbol).or_insert(address);
    }

    /// Registers every export of an image loaded at `base`.
    ///
    /// Names already present keep their first-loaded address.
    pub fn add_image(&mut self, library: &str, exports: &HashMap<String, u32>, base: GuestAddress) {
        for (name, offset) in exports {
            self.insert(
                SymbolName::new(library, name),
                base.wrapping_add(u64::from(*offset)),
            );
        }
    }

    /// Resolves a symbol to its load-time address.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::UnresolvedSymbol`] if no loaded image exports the
    /// name.
    pub fn resolve(&self, symbol: &SymbolName) -> Result<GuestAddress> {
        self.addresses
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::UnresolvedSymbol {
                symbol: symbol.clone(),
            })
    }

    /// Number of resolved symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Returns `true` if no image has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}
