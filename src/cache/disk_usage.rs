//! # Disk usage
//!
//! Eviction policies applied whenever a cache file is completed or accessed.
//! Trimming happens on a spawned task; passes over one policy are serialized.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::TEMP_POSTFIX;

/// Decides which complete cache files survive.
pub trait DiskUsage: Send + Sync {
    /// Marks `file` as recently used and trims the directory if needed.
    fn touch(&self, file: &Path);

    /// Protects `file` from eviction while an engine is using it.
    fn pin(&self, _file: &Path) {}

    fn unpin(&self, _file: &Path) {}
}

/// Never evicts anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedDiskUsage;

impl DiskUsage for UnlimitedDiskUsage {
    fn touch(&self, _file: &Path) {}
}

/// Bounds applied by [`LruDiskUsage`]; a file set is accepted when every
/// configured bound holds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsageLimits {
    pub max_size: Option<u64>,
    pub max_count: Option<usize>,
}

impl DiskUsageLimits {
    fn accepts(&self, total_size: u64, count: usize) -> bool {
        self.max_size.is_none_or(|max| total_size <= max)
            && self.max_count.is_none_or(|max| count <= max)
    }
}

/// Least-recently-modified eviction over the directory of the touched file.
#[derive(Clone)]
pub struct LruDiskUsage {
    limits: DiskUsageLimits,
    pinned: Arc<Mutex<HashMap<PathBuf, usize>>>,
    trim_lock: Arc<tokio::sync::Mutex<()>>,
}

impl LruDiskUsage {
    pub fn new(limits: DiskUsageLimits) -> Self {
        Self {
            limits,
            pinned: Arc::new(Mutex::new(HashMap::new())),
            trim_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn total_count(max_count: usize) -> Self {
        Self::new(DiskUsageLimits {
            max_count: Some(max_count),
            ..Default::default()
        })
    }

    pub fn total_size(max_size: u64) -> Self {
        Self::new(DiskUsageLimits {
            max_size: Some(max_size),
            ..Default::default()
        })
    }

    pub fn limits(&self) -> DiskUsageLimits {
        self.limits
    }

    /// Runs one trim pass synchronously. Exposed for callers that need the
    /// effect immediately instead of after the background task runs.
    pub async fn trim_now(&self, file: &Path) -> io::Result<()> {
        let _guard = self.trim_lock.lock().await;
        let file = file.to_path_buf();
        let limits = self.limits;
        let pinned = self.pinned.clone();
        tokio::task::spawn_blocking(move || touch_and_trim(&file, limits, &pinned))
            .await
            .map_err(io::Error::other)?
    }
}

impl DiskUsage for LruDiskUsage {
    fn touch(&self, file: &Path) {
        let this = self.clone();
        let file = file.to_path_buf();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(path = ?file, "No runtime available, skipping cache trim");
            return;
        };
        handle.spawn(async move {
            if let Err(e) = this.trim_now(&file).await {
                warn!(path = ?file, error = %e, "Error trimming cache");
            }
        });
    }

    fn pin(&self, file: &Path) {
        *self.pinned.lock().entry(file.to_path_buf()).or_insert(0) += 1;
    }

    fn unpin(&self, file: &Path) {
        let mut pinned = self.pinned.lock();
        if let Some(count) = pinned.get_mut(file) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(file);
            }
        }
    }
}

fn touch_and_trim(
    file: &Path,
    limits: DiskUsageLimits,
    pinned: &Mutex<HashMap<PathBuf, usize>>,
) -> io::Result<()> {
    set_modified_now(file)?;
    let Some(dir) = file.parent() else {
        return Ok(());
    };

    let mut files = complete_files(dir)?;
    let mut total_size: u64 = files.iter().map(|f| f.size).sum();
    let mut count = files.len();
    if limits.accepts(total_size, count) {
        return Ok(());
    }

    files.sort_by_key(|f| f.modified);
    for candidate in files {
        if limits.accepts(total_size, count) {
            break;
        }
        if candidate.path == file || pinned.lock().contains_key(&candidate.path) {
            continue;
        }
        match fs::remove_file(&candidate.path) {
            Ok(()) => {
                total_size = total_size.saturating_sub(candidate.size);
                count -= 1;
                info!(
                    path = ?candidate.path,
                    size = candidate.size,
                    "Evicted cache file"
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                total_size = total_size.saturating_sub(candidate.size);
                count -= 1;
            }
            Err(e) => warn!(path = ?candidate.path, error = %e, "Error deleting cache file"),
        }
    }
    debug!(total_size, count, "Cache trim finished");
    Ok(())
}

struct CacheFileEntry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

fn complete_files(dir: &Path) -> io::Result<Vec<CacheFileEntry>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(TEMP_POSTFIX) || name.starts_with('.') {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            // Raced with a concurrent delete.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        files.push(CacheFileEntry {
            path: entry.path(),
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    Ok(files)
}

fn set_modified_now(file: &Path) -> io::Result<()> {
    match File::options().append(true).open(file) {
        Ok(f) => f.set_modified(SystemTime::now()),
        // Deleted before the pass ran; nothing to touch but trimming still applies.
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
