//! Pluggable export/symbol cache.
//!
//! Parsing a library's export table is expensive relative to how often the
//! same file is emulated, so parsed metadata is cached per image file and
//! validated against a freshness fingerprint (file length + SHA-1 of
//! contents). The cache is a capability with exactly two operations,
//! [`SymbolCache::lookup`] and [`SymbolCache::store`]; the loading path
//! depends only on that contract, never on a storage mechanism.
//!
//! Three implementations ship here:
//!
//! - [`DiskCache`]: versioned JSON files under a cache directory (default)
//! - [`MemoryCache`]: plain map, for tests and short-lived sessions
//! - [`NullCache`]: every lookup misses, every store is dropped
//!
//! Session-scoped immutability (a path keeps describing the same export set
//! for a whole session even if the file changes underneath) is enforced by
//! the session pinning the first entry it hands out, not by the cache
//! implementations.

mod disk;

pub use disk::DiskCache;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{Error, Result};

/// Freshness key for one cached image file.
///
/// Length plus content hash: strictly stronger than a modification marker and
/// cheap for library-sized files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// File length in bytes.
    pub len: u64,
    /// Lowercase hex SHA-1 of the file contents.
    pub sha1: String,
}

impl Fingerprint {
    /// Computes the fingerprint of the file at `path`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Image`] if the file cannot be read.
    pub fn of(path: &Path) -> Result<Fingerprint> {
        let bytes = fs::read(path).map_err(|err| Error::Image {
            path: path.to_path_buf(),
            message: format!("cannot fingerprint: {err}"),
        })?;
        Ok(Fingerprint::of_bytes(&bytes))
    }

    /// Computes the fingerprint of in-memory image bytes.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Fingerprint {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let sha1 = digest.iter().fold(String::new(), |mut acc, byte| {
            use std::fmt::Write;
            let _ = write!(acc, "{byte:02x}");
            acc
        });
        Fingerprint {
            len: bytes.len() as u64,
            sha1,
        }
    }
}

/// Parsed, reusable metadata about one library image.
///
/// Round-trips exactly through the persisted layout: the export table and the
/// per-call-site metadata (observed variadic argument counts) survive
/// serialization bit for bit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Library name the exports belong to (e.g. `kernel32.dll`).
    pub library: String,
    /// Freshness key of the source file this entry was built from.
    pub fingerprint: Fingerprint,
    /// Export name to offset from the image base.
    pub exports: BTreeMap<String, u32>,
    /// Observed variadic argument count per call-site address.
    pub call_sites: BTreeMap<u64, u8>,
}

impl CacheEntry {
    /// Builds an entry from a parsed export set and the file's fingerprint.
    #[must_use]
    pub fn new(library: &str, fingerprint: Fingerprint, exports: BTreeMap<String, u32>) -> Self {
        CacheEntry {
            library: library.to_string(),
            fingerprint,
            exports,
            call_sites: BTreeMap::new(),
        }
    }

    /// Records the argument count observed at a variadic call site.
    pub fn record_call_site(&mut self, address: u64, arg_count: u8) {
        self.call_sites.insert(address, arg_count);
    }
}

/// The pluggable cache capability.
///
/// `lookup` returns `None` for anything it cannot vouch for: unknown path,
/// stale fingerprint, unreadable or corrupt persisted data. Corruption is
/// recovered by rebuilding, never by failing the session.
pub trait SymbolCache {
    /// Looks up the entry for `path`, if present and fresh.
    fn lookup(&self, path: &Path) -> Option<CacheEntry>;

    /// Stores `entry` as the current metadata for `path`.
    fn store(&mut self, path: &Path, entry: &CacheEntry);
}

/// In-memory cache keyed by path; no freshness validation.
///
/// Intended for tests and single-run sessions where the file cannot change
/// underneath the emulation.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: HashMap<PathBuf, CacheEntry>,
}

impl MemoryCache {
    /// Creates an empty in-memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SymbolCache for MemoryCache {
    fn lookup(&self, path: &Path) -> Option<CacheEntry> {
        self.entries.get(path).cloned()
    }

    fn store(&mut self, path: &Path, entry: &CacheEntry) {
        self.entries.insert(path.to_path_buf(), entry.clone());
    }
}

/// A cache that never hits and never persists.
#[derive(Debug, Default)]
pub struct NullCache;

impl SymbolCache for NullCache {
    fn lookup(&self, _path: &Path) -> Option<CacheEntry> {
        None
    }

    fn store(&mut self, _path: &Path, _entry: &CacheEntry) {}
}
