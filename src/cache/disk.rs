//! Persisted cache backed by versioned JSON files.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    cache::{CacheEntry, Fingerprint, SymbolCache},
    Error, Result,
};

/// Bumped whenever the persisted layout changes shape. Files carrying any
/// other version are treated as misses.
const CACHE_FORMAT_VERSION: u32 = 1;

/// On-disk envelope around a [`CacheEntry`].
#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entry: CacheEntry,
}

/// The default persisted cache: one JSON file per cached image.
///
/// Files live under a cache directory and are named by the SHA-1 of the
/// image's absolute path, so unrelated sessions pointing at the same image
/// share entries. A lookup validates three things before handing an entry
/// out: the file parses, the format version matches, and the stored
/// fingerprint still matches the image on disk. Any failure is a miss;
/// corruption never propagates.
#[derive(Debug)]
pub struct DiskCache {
    dir: PathBuf,
    trust_stale: bool,
}

impl DiskCache {
    /// Opens (creating if necessary) a cache rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Image`] if the directory cannot be created.
    pub fn open(dir: &Path) -> Result<DiskCache> {
        fs::create_dir_all(dir).map_err(|err| Error::Image {
            path: dir.to_path_buf(),
            message: format!("cannot create cache directory: {err}"),
        })?;
        Ok(DiskCache {
            dir: dir.to_path_buf(),
            trust_stale: false,
        })
    }

    /// Skips fingerprint validation on lookup.
    ///
    /// Useful when the image store is known immutable and re-hashing every
    /// library on load is the dominant cost. Format-version and parse checks
    /// still apply.
    #[must_use]
    pub fn trust_stale(mut self, trust: bool) -> Self {
        self.trust_stale = trust;
        self
    }

    /// The file a given image path persists to.
    #[must_use]
    pub fn file_for(&self, path: &Path) -> PathBuf {
        let key = Fingerprint::of_bytes(path.to_string_lossy().as_bytes()).sha1;
        self.dir.join(format!("{key}.json"))
    }

    /// Loads and fully validates the persisted entry for `path`.
    ///
    /// This is the strict form behind [`SymbolCache::lookup`]; it reports
    /// *why* an entry was rejected, which lookup flattens into a miss.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::CacheCorrupt`] when the persisted file is
    /// unreadable, unparseable, carries a foreign format version, or its
    /// fingerprint no longer matches the image on disk.
    pub fn load_validated(&self, path: &Path) -> Result<CacheEntry> {
        let corrupt = |message: String| Error::CacheCorrupt {
            path: path.to_path_buf(),
            message,
        };

        let file = self.file_for(path);
        let text = fs::read_to_string(&file)
            .map_err(|err| corrupt(format!("cannot read {}: {err}", file.display())))?;
        let parsed: CacheFile =
            serde_json::from_str(&text).map_err(|err| corrupt(format!("parse error: {err}")))?;

        if parsed.version != CACHE_FORMAT_VERSION {
            return Err(corrupt(format!(
                "format version {} (expected {CACHE_FORMAT_VERSION})",
                parsed.version
            )));
        }

        if !self.trust_stale {
            let current = Fingerprint::of(path)?;
            if current != parsed.entry.fingerprint {
                return Err(corrupt(
                    "fingerprint changed since entry was stored".to_string(),
                ));
            }
        }

        Ok(parsed.entry)
    }
}

impl SymbolCache for DiskCache {
    fn lookup(&self, path: &Path) -> Option<CacheEntry> {
        self.load_validated(path).ok()
    }

    fn store(&mut self, path: &Path, entry: &CacheEntry) {
        let file = CacheFile {
            version: CACHE_FORMAT_VERSION,
            entry: entry.clone(),
        };
        // Serialization of these types cannot fail; a write failure just
        // means the next run rebuilds.
        if let Ok(text) = serde_json::to_string_pretty(&file) {
            let _ = fs::write(self.file_for(path), text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct TempDirs {
        cache: PathBuf,
        images: PathBuf,
    }

    impl TempDirs {
        fn new(tag: &str) -> TempDirs {
            let root = std::env::temp_dir().join(format!(
                "wintercept-cache-{tag}-{}",
                std::process::id()
            ));
            let dirs = TempDirs {
                cache: root.join("cache"),
                images: root.join("images"),
            };
            fs::create_dir_all(&dirs.images).unwrap();
            dirs
        }
    }

    impl Drop for TempDirs {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(self.cache.parent().unwrap());
        }
    }

    fn write_image(dirs: &TempDirs, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dirs.images.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn entry_for(path: &Path) -> CacheEntry {
        let mut exports = BTreeMap::new();
        exports.insert("puts".to_string(), 0x1500u32);
        CacheEntry::new("msvcrt.dll", Fingerprint::of(path).unwrap(), exports)
    }

    #[test]
    fn test_miss_then_hit() {
        let dirs = TempDirs::new("miss-hit");
        let mut cache = DiskCache::open(&dirs.cache).unwrap();
        let image = write_image(&dirs, "a.dll", b"image contents");

        assert!(cache.lookup(&image).is_none());
        cache.store(&image, &entry_for(&image));
        let hit = cache.lookup(&image).expect("fresh entry should hit");
        assert_eq!(hit.exports.get("puts"), Some(&0x1500));
    }

    #[test]
    fn test_changed_file_invalidates() {
        let dirs = TempDirs::new("invalidate");
        let mut cache = DiskCache::open(&dirs.cache).unwrap();
        let image = write_image(&dirs, "b.dll", b"version one");
        cache.store(&image, &entry_for(&image));

        fs::write(&image, b"version two").unwrap();
        assert!(cache.lookup(&image).is_none());
        let err = cache.load_validated(&image).unwrap_err();
        assert!(matches!(err, Error::CacheCorrupt { .. }));
    }

    #[test]
    fn test_corrupt_file_is_a_miss_not_a_failure() {
        let dirs = TempDirs::new("corrupt");
        let mut cache = DiskCache::open(&dirs.cache).unwrap();
        let image = write_image(&dirs, "c.dll", b"bytes");
        cache.store(&image, &entry_for(&image));

        fs::write(cache.file_for(&image), b"{ not json").unwrap();
        assert!(cache.lookup(&image).is_none());
        assert!(matches!(
            cache.load_validated(&image).unwrap_err(),
            Error::CacheCorrupt { .. }
        ));
    }

    #[test]
    fn test_trust_stale_skips_fingerprint_check() {
        let dirs = TempDirs::new("trust");
        let mut cache = DiskCache::open(&dirs.cache).unwrap().trust_stale(true);
        let image = write_image(&dirs, "e.dll", b"version one");
        cache.store(&image, &entry_for(&image));

        fs::write(&image, b"version two").unwrap();
        assert!(cache.lookup(&image).is_some());
    }

    #[test]
    fn test_foreign_version_is_a_miss() {
        let dirs = TempDirs::new("version");
        let mut cache = DiskCache::open(&dirs.cache).unwrap();
        let image = write_image(&dirs, "d.dll", b"bytes");
        cache.store(&image, &entry_for(&image));

        let file = cache.file_for(&image);
        let bumped = fs::read_to_string(&file)
            .unwrap()
            .replace("\"version\": 1", "\"version\": 99");
        fs::write(&file, bumped).unwrap();
        assert!(cache.lookup(&image).is_none());
    }
}
