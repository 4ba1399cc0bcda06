//! # Source info storage
//!
//! Remembers length, mime and resolved url per resource so a new source can
//! answer `length()` without a HEAD request.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::SourceInfo;

pub trait SourceInfoStorage: Send + Sync {
    fn get(&self, url: &str) -> Option<SourceInfo>;

    fn put(&self, url: &str, info: &SourceInfo);

    /// Flushes and releases whatever the storage holds on to.
    fn release(&self) {}
}

/// Keeps source info for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemorySourceInfoStorage {
    entries: Mutex<HashMap<String, SourceInfo>>,
}

impl MemorySourceInfoStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SourceInfoStorage for MemorySourceInfoStorage {
    fn get(&self, url: &str) -> Option<SourceInfo> {
        self.entries.lock().get(url).cloned()
    }

    fn put(&self, url: &str, info: &SourceInfo) {
        self.entries.lock().insert(url.to_owned(), info.clone());
    }
}

/// Remembers nothing; every source starts from scratch.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSourceInfoStorage;

impl SourceInfoStorage for NoSourceInfoStorage {
    fn get(&self, _url: &str) -> Option<SourceInfo> {
        None
    }

    fn put(&self, _url: &str, _info: &SourceInfo) {}
}

/// JSON file backed storage that survives restarts.
///
/// The file is rewritten on every change that alters an entry. Inside a tokio
/// runtime the write runs on the blocking pool, so `put` never blocks an async
/// task; `release` writes synchronously. Keep the file out of the cache
/// directory, or give it a leading dot so eviction ignores it.
#[derive(Debug)]
pub struct FileSourceInfoStorage {
    path: Arc<PathBuf>,
    entries: Mutex<HashMap<String, SourceInfo>>,
    generation: AtomicU64,
    /// Generation of the snapshot last written to disk.
    saved: Arc<Mutex<u64>>,
}

impl FileSourceInfoStorage {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Discarding unreadable source info file");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };
        debug!(path = ?path, entries = entries.len(), "Loaded source info");
        Ok(Self {
            path: Arc::new(path),
            entries: Mutex::new(entries),
            generation: AtomicU64::new(0),
            saved: Arc::new(Mutex::new(0)),
        })
    }

    /// Serializes the entries and tags the snapshot with a new generation.
    fn snapshot(&self, entries: &HashMap<String, SourceInfo>) -> Option<(u64, Vec<u8>)> {
        match serde_json::to_vec(entries) {
            Ok(json) => Some((self.generation.fetch_add(1, Ordering::AcqRel) + 1, json)),
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Error serializing source info");
                None
            }
        }
    }
}

/// Writes `json` unless a newer snapshot already reached the disk.
fn save_snapshot(path: &Path, saved: &Mutex<u64>, generation: u64, json: &[u8]) {
    let mut saved = saved.lock();
    if *saved >= generation {
        return;
    }
    match write_atomically(path, json) {
        Ok(()) => *saved = generation,
        Err(e) => warn!(path = ?path, error = %e, "Error saving source info"),
    }
}

fn write_atomically(path: &Path, json: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

impl SourceInfoStorage for FileSourceInfoStorage {
    fn get(&self, url: &str) -> Option<SourceInfo> {
        self.entries.lock().get(url).cloned()
    }

    fn put(&self, url: &str, info: &SourceInfo) {
        let snapshot = {
            let mut entries = self.entries.lock();
            if entries.get(url) == Some(info) {
                return;
            }
            entries.insert(url.to_owned(), info.clone());
            self.snapshot(&entries)
        };
        let Some((generation, json)) = snapshot else {
            return;
        };

        let path = self.path.clone();
        let saved = self.saved.clone();
        let save = move || save_snapshot(&path, &saved, generation, &json);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(save);
            }
            Err(_) => save(),
        }
    }

    fn release(&self) {
        let snapshot = self.snapshot(&self.entries.lock());
        if let Some((generation, json)) = snapshot {
            save_snapshot(&self.path, &self.saved, generation, &json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info() -> SourceInfo {
        SourceInfo {
            url: "http://cdn.example.com/v.mp4".into(),
            length: Some(1234),
            mime: Some("video/mp4".into()),
        }
    }

    #[test]
    fn test_memory_storage() {
        let storage = MemorySourceInfoStorage::new();
        assert!(storage.get("http://example.com/v.mp4").is_none());
        storage.put("http://example.com/v.mp4", &info());
        assert_eq!(storage.get("http://example.com/v.mp4"), Some(info()));
    }

    #[test]
    fn test_no_storage_forgets() {
        NoSourceInfoStorage.put("http://example.com/v.mp4", &info());
        assert!(NoSourceInfoStorage.get("http://example.com/v.mp4").is_none());
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sources.json");
        {
            let storage = FileSourceInfoStorage::open(&path).unwrap();
            storage.put("http://example.com/v.mp4", &info());
        }
        let storage = FileSourceInfoStorage::open(&path).unwrap();
        assert_eq!(storage.get("http://example.com/v.mp4"), Some(info()));
    }

    #[tokio::test]
    async fn test_file_storage_writes_in_background() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sources.json");
        let storage = FileSourceInfoStorage::open(&path).unwrap();
        storage.put("http://example.com/v.mp4", &info());

        let mut reloaded = None;
        for _ in 0..100 {
            let reopened = FileSourceInfoStorage::open(&path).unwrap();
            reloaded = reopened.get("http://example.com/v.mp4");
            if reloaded.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(reloaded, Some(info()));
    }

    #[tokio::test]
    async fn test_release_flushes_latest_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sources.json");
        let storage = FileSourceInfoStorage::open(&path).unwrap();
        let mut second = info();
        second.length = Some(99);
        storage.put("http://example.com/a.mp4", &info());
        storage.put("http://example.com/b.mp4", &second);
        storage.release();

        let reopened = FileSourceInfoStorage::open(&path).unwrap();
        assert_eq!(reopened.get("http://example.com/a.mp4"), Some(info()));
        assert_eq!(reopened.get("http://example.com/b.mp4"), Some(second));
    }

    #[test]
    fn test_file_storage_ignores_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sources.json");
        fs::write(&path, b"not json").unwrap();
        let storage = FileSourceInfoStorage::open(&path).unwrap();
        assert!(storage.get("http://example.com/v.mp4").is_none());
    }
}
