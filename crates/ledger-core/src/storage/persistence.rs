//! Key-value persistence
//!
//! A small `localStorage`-shaped API: string keys, string values, and a byte
//! quota. Writes that would exceed the quota fail with
//! `StoreError::StorageFull` and leave the previous value untouched.
//!
//! Storage location for `FileStorage`: `<data_dir>/local/` (configurable via
//! `Config`), one `<key>.json` file per key.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::{StoreError, StoreResult};

/// Synchronous string key-value storage
pub trait KeyValueStorage: Send + Sync {
    /// Read a value
    fn get_item(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a value, replacing any previous one
    fn set_item(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Delete a value; deleting an absent key is not an error
    fn remove_item(&self, key: &str) -> StoreResult<()>;

    /// Total bytes currently stored
    fn used_bytes(&self) -> StoreResult<u64>;

    /// Byte quota, if any
    fn quota(&self) -> Option<u64>;
}

fn check_quota(
    key: &str,
    quota: Option<u64>,
    used: u64,
    previous: u64,
    incoming: u64,
) -> StoreResult<()> {
    let Some(quota) = quota else {
        return Ok(());
    };
    let projected = used.saturating_sub(previous) + incoming;
    if projected > quota {
        return Err(StoreError::StorageFull {
            key: key.to_string(),
            details: format!("{} bytes needed, quota is {} bytes", projected, quota),
        });
    }
    Ok(())
}

/// File-backed storage, one file per key
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
    quota: Option<u64>,
}

impl FileStorage {
    /// Create storage rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quota: None,
        }
    }

    /// Limit the total stored bytes
    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }

    fn file_len(path: &Path) -> u64 {
        fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }
}

impl KeyValueStorage for FileStorage {
    fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path)?))
    }

    fn set_item(&self, key: &str, value: &str) -> StoreResult<()> {
        let path = self.path_for(key);
        check_quota(
            key,
            self.quota,
            self.used_bytes()?,
            Self::file_len(&path),
            value.len() as u64,
        )?;
        atomic_write(&path, value.as_bytes())
    }

    fn remove_item(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| StoreError::from_io(e, path))?;
        }
        Ok(())
    }

    fn used_bytes(&self) -> StoreResult<u64> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut total = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                total += Self::file_len(&path);
            }
        }
        Ok(total)
    }

    fn quota(&self) -> Option<u64> {
        self.quota
    }
}

/// In-memory storage, mostly for tests
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
    quota: Option<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the total stored bytes
    pub fn with_quota(quota: u64) -> Self {
        Self {
            items: Mutex::default(),
            quota: Some(quota),
        }
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let used = items.values().map(|v| v.len() as u64).sum();
        let previous = items.get(key).map_or(0, |v| v.len() as u64);
        check_quota(key, self.quota, used, previous, value.len() as u64)?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StoreResult<()> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.remove(key);
        Ok(())
    }

    fn used_bytes(&self) -> StoreResult<u64> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.values().map(|v| v.len() as u64).sum())
    }

    fn quota(&self) -> Option<u64> {
        self.quota
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
///
/// This ensures the target file is never left in a partially-written state.
/// Disk-full failures surface as `StoreError::StorageFull`.
pub fn atomic_write(path: &Path, data: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::from_io(e, parent.to_path_buf()))?;
    }

    // Same directory so the rename stays atomic
    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| StoreError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StoreError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StoreError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|e| StoreError::from_io(e, path.to_path_buf()))?;

    Ok(())
}
