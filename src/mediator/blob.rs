//! Short-lived local copies of media files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::app::{Result, TributaryError};

static INSTANCES: AtomicU64 = AtomicU64::new(0);

/// A fully written blob. The file disappears once its TTL runs out, whether
/// or not anyone read it.
#[derive(Debug, Clone)]
pub struct Blob {
    path: PathBuf,
    pub size: u64,
    pub allocated_at: Instant,
}

impl Blob {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A blob being written. Dropping it before [`BlobWriter::commit`] deletes
/// the partial file.
pub struct BlobWriter {
    file: tokio::fs::File,
    path: PathBuf,
    len: u64,
    allocated_at: Instant,
    committed: bool,
}

impl BlobWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.len += chunk.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn commit(mut self) -> Result<Blob> {
        self.file.flush().await?;
        self.committed = true;
        Ok(Blob {
            path: self.path.clone(),
            size: self.len,
            allocated_at: self.allocated_at,
        })
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub struct BlobCache {
    dir: PathBuf,
    ttl: Duration,
    /// Allocation time of every file still on disk.
    entries: Mutex<HashMap<PathBuf, Instant>>,
    /// Unique per cache instance so processes sharing `dir` never reuse a name.
    prefix: String,
    sequence: AtomicU64,
}

impl BlobCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Ok(Self {
            dir,
            ttl,
            entries: Mutex::new(HashMap::new()),
            prefix: format!(
                "{}-{:x}-{}",
                std::process::id(),
                started,
                INSTANCES.fetch_add(1, Ordering::Relaxed)
            ),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn default_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| TributaryError::Config("Could not find cache directory".into()))?;
        Ok(cache_dir.join("tributary").join("blobs"))
    }

    /// Start a new blob under `scope`. Expired blobs are evicted first.
    pub fn allocate(&self, scope: &str) -> Result<BlobWriter> {
        let mut entries = self.lock()?;
        self.evict_locked(&mut entries);

        let scope_dir = self.dir.join(sanitize(scope));
        fs::create_dir_all(&scope_dir)?;

        let id = self.sequence.fetch_add(1, Ordering::Relaxed);
        let path = scope_dir.join(format!("{}-{:016x}.blob", self.prefix, id));
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let allocated_at = Instant::now();
        entries.insert(path.clone(), allocated_at);

        Ok(BlobWriter {
            file: tokio::fs::File::from_std(file),
            path,
            len: 0,
            allocated_at,
            committed: false,
        })
    }

    /// Discard everything a previous process left in the directory.
    pub fn purge(&self) -> Result<()> {
        let mut entries = self.lock()?;
        entries.clear();
        fs::remove_dir_all(&self.dir)?;
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Remove every blob older than the TTL. Returns how many were removed.
    pub fn evict_expired(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        Ok(self.evict_locked(&mut entries))
    }

    /// Read a blob, refusing files larger than `max_bytes` or already expired.
    pub async fn read(&self, blob: &Blob, max_bytes: u64) -> Result<Vec<u8>> {
        if blob.allocated_at.elapsed() >= self.ttl || !blob.path.exists() {
            return Err(TributaryError::NotFound(format!(
                "blob {} expired",
                blob.path.display()
            )));
        }

        let size = tokio::fs::metadata(&blob.path).await?.len();
        if size > max_bytes {
            return Err(TributaryError::TooLarge {
                size,
                limit: max_bytes,
            });
        }

        Ok(tokio::fs::read(&blob.path).await?)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PathBuf, Instant>>> {
        self.entries
            .lock()
            .map_err(|e| TributaryError::Other(format!("Blob cache lock poisoned: {}", e)))
    }

    fn evict_locked(&self, entries: &mut HashMap<PathBuf, Instant>) -> usize {
        let expired: Vec<PathBuf> = entries
            .iter()
            .filter(|(_, allocated_at)| allocated_at.elapsed() >= self.ttl)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &expired {
            entries.remove(path);
            match fs::remove_file(path) {
                Ok(()) => debug!("Evicted blob {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to evict blob {}: {}", path.display(), e),
            }
        }

        expired.len()
    }
}

fn sanitize(scope: &str) -> String {
    let cleaned: String = scope
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
