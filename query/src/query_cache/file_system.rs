use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::{CacheEntry, CacheError, Instant, QueryCache, QueryKey};

/// A cache that persists entries to a directory, so they survive restarts.
///
/// Each key is one file, named after the hex-encoded SHA-256 of the key, so names have a fixed
/// length whatever the key. The key itself is stored in the entry and checked on read. Writes go
/// to a temporary file in the same directory and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileSystemCache {
    dir: PathBuf,
}

/// On-disk envelope of a cache entry.
#[derive(Clone, miniserde::Serialize, miniserde::Deserialize)]
struct PersistQueryData {
    /// The key the entry was saved under.
    key: String,
    /// The serialized query data.
    value: String,
    /// The time the query was last updated in millis.
    updated_at: u64,
}

impl PersistQueryData {
    fn new(key: &QueryKey, entry: CacheEntry) -> Self {
        PersistQueryData {
            key: key.as_str().to_string(),
            value: entry.value,
            updated_at: entry.saved_at.as_millis(),
        }
    }
}

impl From<PersistQueryData> for CacheEntry {
    fn from(data: PersistQueryData) -> Self {
        CacheEntry {
            value: data.value,
            saved_at: Instant::from_millis(data.updated_at),
        }
    }
}

const ENTRY_EXTENSION: &str = "json";

impl FileSystemCache {
    /// Opens (and creates if needed) a cache rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The directory holding the entries.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &QueryKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", hash_key(key), ENTRY_EXTENSION))
    }
}

fn hash_key(key: &QueryKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

impl QueryCache for FileSystemCache {
    fn save(&self, key: &QueryKey, entry: CacheEntry) -> Result<(), CacheError> {
        let encoded = miniserde::json::to_string(&PersistQueryData::new(key, entry));

        let mut file = NamedTempFile::new_in(&self.dir)?;
        file.write_all(encoded.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(self.entry_path(key))
            .map_err(|error| CacheError::Io(error.error))?;
        Ok(())
    }

    fn get(&self, key: &QueryKey) -> Result<Option<CacheEntry>, CacheError> {
        let raw = match fs::read_to_string(self.entry_path(key)) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let data: PersistQueryData =
            miniserde::json::from_str(&raw).map_err(|_| CacheError::InvalidEntry {
                key: key.clone(),
                reason: "malformed entry envelope".to_string(),
            })?;

        if data.key != key.as_str() {
            tracing::warn!(%key, stored = %data.key, "cache entry belongs to another key");
            return Ok(None);
        }
        Ok(Some(data.into()))
    }

    fn invalidate(&self, key: &QueryKey) -> Result<(), CacheError> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn clear(&self) -> Result<(), CacheError> {
        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                    Err(error) => return Err(error.into()),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{InvalidationPolicy, QueryCacheExt};

    #[test]
    fn entries_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let key = QueryKey::new("cards");

        {
            let cache = FileSystemCache::open(dir.path()).unwrap();
            cache
                .save_value(&key, &vec!["A", "B"], Instant::from_millis(42))
                .unwrap();
        }

        let reopened = FileSystemCache::open(dir.path()).unwrap();
        let entry = reopened.get(&key).unwrap().unwrap();
        assert_eq!(entry.saved_at, Instant::from_millis(42));
        assert_eq!(
            reopened.get_value::<Vec<String>>(&key).unwrap(),
            Some(vec!["A".to_string(), "B".to_string()])
        );
    }

    #[test]
    fn get_after_invalidate_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCache::open(dir.path()).unwrap();
        let key = QueryKey::new("cards");

        cache
            .save(&key, CacheEntry::new("1", Instant::from_millis(0)))
            .unwrap();
        cache.invalidate(&key).unwrap();

        assert_eq!(cache.get(&key).unwrap(), None);
        cache.invalidate(&key).unwrap();
    }

    #[test]
    fn keys_with_path_characters_stay_inside_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCache::open(dir.path()).unwrap();
        let key = QueryKey::new("../../etc/passwd");

        cache
            .save(&key, CacheEntry::new("1", Instant::from_millis(0)))
            .unwrap();

        assert!(cache.entry_path(&key).starts_with(dir.path()));
        assert!(cache.get(&key).unwrap().is_some());
    }

    #[test]
    fn long_keys_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCache::open(dir.path()).unwrap();
        let key = QueryKey::new("search").append("a".repeat(240));
        assert!(key.as_str().len() > 200);

        cache.save_value(&key, &1_u32, Instant::from_millis(7)).unwrap();

        assert_eq!(cache.get_value::<u32>(&key).unwrap(), Some(1));
        let name = cache.entry_path(&key);
        let name = name.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 64 + 1 + ENTRY_EXTENSION.len());

        cache.invalidate(&key).unwrap();
        assert_eq!(cache.get(&key).unwrap(), None);
    }

    #[test]
    fn entry_stored_for_another_key_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCache::open(dir.path()).unwrap();
        let cards = QueryKey::new("cards");
        let decks = QueryKey::new("decks");

        cache
            .save(&decks, CacheEntry::new("1", Instant::from_millis(0)))
            .unwrap();
        fs::copy(cache.entry_path(&decks), cache.entry_path(&cards)).unwrap();

        assert_eq!(cache.get(&cards).unwrap(), None);
        assert!(cache.get(&decks).unwrap().is_some());
    }

    #[test]
    fn malformed_envelope_is_invalid_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCache::open(dir.path()).unwrap();
        let key = QueryKey::new("cards");

        fs::write(cache.entry_path(&key), "{ truncated").unwrap();

        assert!(matches!(
            cache.get(&key),
            Err(CacheError::InvalidEntry { .. })
        ));
        assert!(!cache.is_valid(
            &key,
            Instant::from_millis(0),
            InvalidationPolicy::NeverExpires
        ));
    }

    #[test]
    fn validity_uses_persisted_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCache::open(dir.path()).unwrap();
        let key = QueryKey::new("cards");
        let saved_at = Instant::from_millis(1_000);

        cache.save(&key, CacheEntry::new("1", saved_at)).unwrap();

        let policy = InvalidationPolicy::ExpiresAfter(Duration::from_secs(500));
        assert!(cache.is_valid(&key, saved_at + Duration::from_secs(100), policy));
        assert!(!cache.is_valid(&key, saved_at + Duration::from_secs(500), policy));
    }

    #[test]
    fn clear_only_removes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCache::open(dir.path()).unwrap();
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        cache
            .save(&QueryKey::new("a"), CacheEntry::new("1", Instant::from_millis(0)))
            .unwrap();
        cache
            .save(&QueryKey::new("b"), CacheEntry::new("2", Instant::from_millis(0)))
            .unwrap();
        cache.clear().unwrap();

        assert_eq!(cache.get(&QueryKey::new("a")).unwrap(), None);
        assert!(dir.path().join("notes.txt").exists());
    }
}
