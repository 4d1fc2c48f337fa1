//! Shared stores injected into the orchestrator and the service.
//!
//! - [`DownloadCache`]: URL → already downloaded file, optionally shared
//!   between jobs through pristine copies
//! - [`JobRegistry`]: in-memory job table polled by progress queries
//! - [`RateLimitStore`]: per-IP download timestamps persisted as JSON
//! - [`DownloadCounter`]: persisted count of delivered archives
//! - [`CloneHistory`]: append-only JSON-lines log of finished jobs
//!
//! The persisted stores serialize their read-modify-write cycles behind an
//! async mutex and replace files by rename, so concurrent jobs never lose an
//! increment and readers never see a half-written file.

use crate::error::Result;
use crate::job::{CloneJob, JobEvent, JobId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Writes `content` to a sibling temp file and renames it over `path`.
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = sibling_temp_path(path);
    tokio::fs::write(&tmp, content).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// `dir/name.ext` → `dir/name.ext.part`
pub fn sibling_temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// Cache key for a URL string.
pub fn cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Remembers where each URL was downloaded so later references can copy the
/// file instead of fetching it again.
///
/// A cache from [`DownloadCache::new`] points at files inside one job's
/// working directory, which that job later optimizes and rewrites in place;
/// it must not outlive the job. [`DownloadCache::shared_in`] keeps its own
/// untouched copy of every download instead and can serve any number of
/// jobs. Its directory is removed once the last clone of the cache is
/// dropped.
#[derive(Clone, Default)]
pub struct DownloadCache {
    entries: Arc<Mutex<HashMap<String, PathBuf>>>,
    dir: Option<Arc<TempDir>>,
}

impl DownloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache that stores copies in a fresh directory under `parent`.
    pub fn shared_in(parent: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix("website-archiver-cache-")
            .tempdir_in(parent)?;
        Ok(Self {
            entries: Arc::default(),
            dir: Some(Arc::new(dir)),
        })
    }

    pub fn is_shared(&self) -> bool {
        self.dir.is_some()
    }

    /// Path of a previous download of `url`, if that file still exists.
    pub fn lookup(&self, url: &str) -> Option<PathBuf> {
        let key = cache_key(url);
        let mut entries = self.entries.lock().ok()?;
        match entries.get(&key) {
            Some(path) if path.is_file() => Some(path.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Records a finished download of `url` at `path`. Must run before any
    /// post-processing touches the file.
    pub async fn record(&self, url: &str, path: &Path) -> Result<()> {
        let key = cache_key(url);
        let stored = match &self.dir {
            Some(dir) => {
                let target = dir.path().join(&key);
                // Jobs may store the same URL at once; each copies to its own temp name.
                let tmp = dir.path().join(format!("{key}.{}.part", Uuid::new_v4()));
                tokio::fs::copy(path, &tmp).await?;
                if let Err(e) = tokio::fs::rename(&tmp, &target).await {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
                target
            }
            None => path.to_path_buf(),
        };

        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, stored);
        }
        Ok(())
    }

    /// Drops stored copies older than `max_age`. Returns how many were removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        self.prune_at(max_age, SystemTime::now())
    }

    pub fn prune_at(&self, max_age: Duration, now: SystemTime) -> usize {
        if self.dir.is_none() {
            return 0;
        }
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };

        let before = entries.len();
        entries.retain(|_, path| {
            let fresh = std::fs::metadata(&*path)
                .and_then(|m| m.modified())
                .map(|modified| now.duration_since(modified).unwrap_or_default() <= max_age)
                .unwrap_or(false);
            if !fresh {
                let _ = std::fs::remove_file(&*path);
            }
            fresh
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory table of clone jobs.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<JobId, CloneJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: CloneJob) {
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.insert(job.id.clone(), job);
        }
    }

    pub fn get(&self, id: &str) -> Option<CloneJob> {
        self.jobs.read().ok()?.get(id).cloned()
    }

    /// Applies an orchestrator event; returns false for unknown jobs.
    pub fn apply(&self, id: &str, event: &JobEvent) -> bool {
        let Ok(mut jobs) = self.jobs.write() else {
            return false;
        };
        match jobs.get_mut(id) {
            Some(job) => {
                job.apply(event);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<CloneJob> {
        self.jobs.write().ok()?.remove(id)
    }

    /// Drops the job record once `grace` has elapsed.
    pub fn evict_after(&self, id: &str, grace: Duration) {
        let registry = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if registry.remove(&id).is_some() {
                debug!(job_id = %id, "evicted delivered job");
            }
        });
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sliding-window download limit per client IP.
pub struct RateLimitStore {
    path: PathBuf,
    max_per_window: usize,
    window: Duration,
    lock: tokio::sync::Mutex<()>,
}

impl RateLimitStore {
    pub fn new(path: impl Into<PathBuf>, max_per_window: usize, window: Duration) -> Self {
        Self {
            path: path.into(),
            max_per_window,
            window,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Records a download for `ip` and returns true if it was within the limit.
    pub async fn try_acquire(&self, ip: &str) -> Result<bool> {
        self.try_acquire_at(ip, Utc::now()).await
    }

    pub async fn try_acquire_at(&self, ip: &str, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.lock.lock().await;

        let mut data = self.load().await;
        let window_ms = self.window.as_millis() as i64;
        let now_ms = now.timestamp_millis();

        let stamps = data.entry(ip.to_string()).or_default();
        stamps.retain(|ts| now_ms - ts < window_ms);

        if stamps.len() >= self.max_per_window {
            return Ok(false);
        }
        stamps.push(now_ms);
        data.retain(|_, v| !v.is_empty());

        write_atomic(&self.path, &serde_json::to_vec(&data)?).await?;
        Ok(true)
    }

    /// Remaining downloads for `ip` in the current window.
    pub async fn remaining(&self, ip: &str) -> usize {
        let _guard = self.lock.lock().await;
        let data = self.load().await;
        let window_ms = self.window.as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();
        let used = data
            .get(ip)
            .map(|v| v.iter().filter(|ts| now_ms - **ts < window_ms).count())
            .unwrap_or(0);
        self.max_per_window.saturating_sub(used)
    }

    async fn load(&self) -> HashMap<String, Vec<i64>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = ?self.path, error = %e, "rate limit store unreadable, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }
}

/// Global count of delivered archives.
pub struct DownloadCounter {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl DownloadCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn get(&self) -> u64 {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    pub async fn increment(&self) -> Result<u64> {
        let _guard = self.lock.lock().await;
        let count = self.read().await + 1;
        write_atomic(&self.path, count.to_string().as_bytes()).await?;
        Ok(count)
    }

    async fn read(&self) -> u64 {
        tokio::fs::read_to_string(&self.path)
            .await
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry<'a> {
    pub date: DateTime<Utc>,
    pub url: &'a str,
    pub archive: Option<String>,
    pub status: &'a str,
    pub error: Option<&'a str>,
}

/// Append-only log of finished clone jobs.
pub struct CloneHistory {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl CloneHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn record(&self, entry: &HistoryEntry<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
