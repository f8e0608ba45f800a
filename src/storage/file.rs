//! Directory-backed storage.

use super::StorageAdapter;
use crate::error::{Result, StoreError};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for entry files.
const ENTRY_MAGIC: &[u8; 4] = b"STH\0";

/// Current entry format version.
const ENTRY_VERSION: u8 = 1;

/// Magic, version, length and checksum bytes around the value.
const ENTRY_OVERHEAD: u64 = 4 + 1 + 8 + 4;

/// Extension of entry files.
const ENTRY_EXT: &str = "entry";

/// One file per key under a directory.
///
/// File names are the hex encoding of the key, so any key is a valid name.
/// Each file holds a small header, the value and a CRC32 of the value;
/// writes go through a temporary file and a rename. A file that fails
/// validation reads as missing.
pub struct FileStorage {
    /// Base directory.
    path: PathBuf,

    /// Recently read or written values.
    cache: Mutex<LruCache<String, String>>,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    pub fn new(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.path
            .join(format!("{}.{}", hex::encode(key.as_bytes()), ENTRY_EXT))
    }

    fn write_entry(&self, key: &str, value: &str) -> Result<()> {
        let entry_path = self.entry_path(key);
        let tmp_path = entry_path.with_extension("tmp");
        let content = value.as_bytes();

        {
            let mut file = File::create(&tmp_path)?;

            // Header
            file.write_all(ENTRY_MAGIC)?;
            file.write_all(&[ENTRY_VERSION])?;

            // Content
            file.write_all(&(content.len() as u64).to_le_bytes())?;
            file.write_all(content)?;

            // Checksum
            file.write_all(&crc32fast::hash(content).to_le_bytes())?;

            file.sync_all()?;
        }

        fs::rename(&tmp_path, &entry_path)?;
        Ok(())
    }

    fn read_entry(&self, key: &str) -> Result<Option<String>> {
        let entry_path = self.entry_path(key);
        let mut file = match File::open(&entry_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != ENTRY_MAGIC {
            return Err(StoreError::Deserialization("invalid entry magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != ENTRY_VERSION {
            return Err(StoreError::Deserialization(format!(
                "unsupported entry version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        let file_len = file.metadata()?.len();
        if file_len.checked_sub(ENTRY_OVERHEAD) != Some(len) {
            return Err(StoreError::Deserialization(format!(
                "entry length {} does not match file size {}",
                len, file_len
            )));
        }

        let mut content = vec![0u8; len as usize];
        file.read_exact(&mut content)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&content);
        if stored != computed {
            return Err(StoreError::Deserialization(format!(
                "checksum mismatch: expected {:08x}, got {:08x}",
                stored, computed
            )));
        }

        String::from_utf8(content)
            .map(Some)
            .map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

impl StorageAdapter for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        if let Some(cached) = self.cache.lock().get(key).cloned() {
            return Some(cached);
        }
        match self.read_entry(key) {
            Ok(Some(value)) => {
                self.cache.lock().put(key.to_string(), value.clone());
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Unreadable storage entry");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> bool {
        match self.write_entry(key, value) {
            Ok(()) => {
                self.cache.lock().put(key.to_string(), value.to_string());
                true
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to write storage entry");
                self.cache.lock().pop(key);
                false
            }
        }
    }

    fn remove(&self, key: &str) -> bool {
        self.cache.lock().pop(key);
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(key, error = %e, "Failed to remove storage entry");
                false
            }
        }
    }

    fn clear(&self) -> bool {
        self.cache.lock().clear();
        self.keys().iter().all(|key| self.remove(key))
    }

    fn keys(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.path) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                    return None;
                }
                let stem = path.file_stem()?.to_str()?;
                String::from_utf8(hex::decode(stem).ok()?).ok()
            })
            .collect();
        keys.sort();
        keys
    }

    fn is_available(&self) -> bool {
        self.path.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_retrieve() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("kv"), 16).unwrap();

        assert!(storage.set("app:state", "{\"count\":1}"));
        assert_eq!(storage.get("app:state").as_deref(), Some("{\"count\":1}"));

        // A fresh handle reads from disk.
        let reopened = FileStorage::new(dir.path().join("kv"), 16).unwrap();
        assert_eq!(reopened.get("app:state").as_deref(), Some("{\"count\":1}"));
    }

    #[test]
    fn test_keys_round_trip_through_file_names() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), 16).unwrap();

        storage.set("b/with slash", "2");
        storage.set("a", "1");

        assert_eq!(storage.keys(), vec!["a".to_string(), "b/with slash".to_string()]);
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), 16).unwrap();

        storage.set("a", "1");
        storage.set("b", "2");
        assert!(storage.remove("a"));
        assert!(storage.remove("missing"));
        assert!(storage.get("a").is_none());

        assert!(storage.clear());
        assert!(storage.keys().is_empty());
    }

    #[test]
    fn test_corrupt_entry_reads_as_missing() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), 16).unwrap();
        storage.set("k", "value");

        let path = storage.entry_path("k");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let reopened = FileStorage::new(dir.path(), 16).unwrap();
        assert!(reopened.get("k").is_none());
    }

    #[test]
    fn test_bad_length_header_reads_as_missing() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path(), 16).unwrap();
        storage.set("k", "value");

        let path = storage.entry_path("k");
        let mut bytes = fs::read(&path).unwrap();
        bytes[5..13].copy_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let reopened = FileStorage::new(dir.path(), 16).unwrap();
        assert!(reopened.get("k").is_none());
        assert!(matches!(
            reopened.read_entry("k"),
            Err(StoreError::Deserialization(_))
        ));

        // Truncated file with an otherwise plausible header.
        bytes[5..13].copy_from_slice(&5u64.to_le_bytes());
        bytes.truncate(bytes.len() - 2);
        fs::write(&path, &bytes).unwrap();
        assert!(reopened.get("k").is_none());
    }
}
