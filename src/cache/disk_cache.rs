use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{DiskUsage, UnlimitedDiskUsage, TEMP_POSTFIX};
use crate::error::{ProxyCacheError, Result};

/// Append-only file buffer for one resource.
///
/// While downloading, bytes live in `<name>.download`; [`DiskCache::complete`]
/// renames it to `<name>`. The written length only grows, and readers may read
/// anything below it while the single writer keeps appending.
///
/// Reads never take the writer lock. They use positional reads on a shared
/// descriptor, which stays valid across the completing rename.
pub struct DiskCache {
    complete_path: PathBuf,
    temp_path: PathBuf,
    writer: Mutex<Option<File>>,
    reader: Arc<std::fs::File>,
    written: AtomicU64,
    completed: AtomicBool,
    disk_usage: Arc<dyn DiskUsage>,
}

impl DiskCache {
    /// Opens the cache for `path`, which may name either the complete file or
    /// its in-progress counterpart.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_disk_usage(path, Arc::new(UnlimitedDiskUsage)).await
    }

    pub async fn with_disk_usage(
        path: impl AsRef<Path>,
        disk_usage: Arc<dyn DiskUsage>,
    ) -> Result<Self> {
        let complete_path = complete_path_of(path.as_ref());
        let temp_path = temp_path_of(&complete_path);
        if let Some(dir) = complete_path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let completed = fs::try_exists(&complete_path).await?;
        let (writer, reader) = if completed {
            (None, File::open(&complete_path).await?)
        } else {
            let writer = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&temp_path)
                .await?;
            (Some(writer), File::open(&temp_path).await?)
        };
        let written = reader.metadata().await?.len();
        debug!(path = ?complete_path, completed, written, "Opened disk cache");

        if completed {
            disk_usage.touch(&complete_path);
        }

        Ok(Self {
            complete_path,
            temp_path,
            writer: Mutex::new(writer),
            reader: Arc::new(reader.into_std().await),
            written: AtomicU64::new(written),
            completed: AtomicBool::new(completed),
            disk_usage,
        })
    }

    /// Number of bytes readable so far.
    pub fn available(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub async fn append(&self, data: &[u8]) -> Result<()> {
        if self.completed.load(Ordering::Acquire) {
            return Err(ProxyCacheError::AppendAfterComplete(
                self.complete_path.clone(),
            ));
        }
        let mut guard = self.writer.lock().await;
        // Completion may have won the lock race.
        if self.completed.load(Ordering::Acquire) {
            return Err(ProxyCacheError::AppendAfterComplete(
                self.complete_path.clone(),
            ));
        }
        let file = guard.as_mut().ok_or_else(|| closed(&self.temp_path))?;
        let offset = self.written.load(Ordering::Acquire);
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        self.written
            .store(offset + data.len() as u64, Ordering::Release);
        Ok(())
    }

    /// Reads `len` bytes starting at `offset`. Never waits for data: the whole
    /// range must already be written.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let available = self.available();
        let length = len as u64;
        if offset.checked_add(length).is_none_or(|end| end > available) {
            return Err(ProxyCacheError::ReadOutOfBounds {
                offset,
                length,
                available,
            });
        }
        if len == 0 {
            return Ok(Bytes::new());
        }
        let reader = self.reader.clone();
        let buf = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            read_exact_at(&reader, &mut buf, offset).map(|()| buf)
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(Bytes::from(buf))
    }

    /// Drops every written byte so the download can start over.
    pub async fn truncate(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        if self.completed.load(Ordering::Acquire) {
            return Err(ProxyCacheError::AlreadyCompleted(
                self.complete_path.clone(),
            ));
        }
        let file = guard.as_mut().ok_or_else(|| closed(&self.temp_path))?;
        let dropped = self.written.swap(0, Ordering::AcqRel);
        file.set_len(0).await?;
        warn!(path = ?self.temp_path, dropped, "Truncated partial cache file");
        Ok(())
    }

    /// Renames the in-progress file to its final name and notifies disk usage.
    pub async fn complete(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        if self.completed.load(Ordering::Acquire) {
            return Err(ProxyCacheError::AlreadyCompleted(
                self.complete_path.clone(),
            ));
        }
        if let Some(file) = guard.as_mut() {
            file.flush().await?;
            file.sync_all().await?;
        }
        // On failure the writer stays open, so appends and completion can be retried.
        fs::rename(&self.temp_path, &self.complete_path).await?;
        *guard = None;
        self.completed.store(true, Ordering::Release);
        drop(guard);

        debug!(path = ?self.complete_path, size = self.available(), "Cache completed");
        self.disk_usage.touch(&self.complete_path);
        Ok(())
    }

    /// Whether the complete file exists on disk right now.
    pub async fn is_completed(&self) -> bool {
        fs::try_exists(&self.complete_path).await.unwrap_or(false)
    }

    /// Completion as recorded by this instance, without touching the disk.
    pub fn completed_flag(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn complete_path(&self) -> &Path {
        &self.complete_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }
}

#[cfg(unix)]
fn read_exact_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &std::fs::File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Final file name for `path`, stripping the in-progress suffix if present.
pub fn complete_path_of(path: &Path) -> PathBuf {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) if name.ends_with(TEMP_POSTFIX) && name.len() > TEMP_POSTFIX.len() => {
            path.with_file_name(&name[..name.len() - TEMP_POSTFIX.len()])
        }
        _ => path.to_path_buf(),
    }
}

pub fn temp_path_of(complete: &Path) -> PathBuf {
    let mut name = complete
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_POSTFIX);
    complete.with_file_name(name)
}

fn closed(path: &Path) -> ProxyCacheError {
    ProxyCacheError::Io(std::io::Error::other(format!(
        "cache file {} is closed",
        path.display()
    )))
}
