//! Job-level entry points for a front end.
//!
//! [`CloneService`] owns the injected stores, starts clone jobs in the
//! background and answers progress and delivery queries. HTTP framing,
//! file names in responses and client IP extraction are the caller's job.

use crate::archive::sweep_archives;
use crate::cloner::WebCloner;
use crate::config::ArchiverConfig;
use crate::error::{CloneError, Result};
use crate::job::{CloneJob, CloneOptions, JobId, JobStatus};
use crate::resolver::is_fetchable;
use crate::store::{CloneHistory, DownloadCache, DownloadCounter, HistoryEntry, JobRegistry, RateLimitStore};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const HISTORY_FILE: &str = "clones.log";
pub const COUNTER_FILE: &str = "downloads_count.json";
pub const RATE_LIMIT_FILE: &str = "downloads_per_ip.json";

#[derive(Clone)]
pub struct CloneService {
    config: Arc<ArchiverConfig>,
    registry: JobRegistry,
    cache: DownloadCache,
    rate_limits: Arc<RateLimitStore>,
    counter: Arc<DownloadCounter>,
    history: Arc<CloneHistory>,
}

impl CloneService {
    /// Persistent stores live under `storage.storage_dir`. The download
    /// cache shared by all jobs lives in its own directory under the temp dir.
    pub fn new(config: ArchiverConfig) -> Result<Self> {
        let storage = &config.storage;
        let dir = &storage.storage_dir;
        let temp_dir = storage.temp_dir();
        let cache = DownloadCache::shared_in(&temp_dir).map_err(|source| CloneError::WorkingDir {
            path: temp_dir.clone(),
            source,
        })?;

        Ok(Self {
            rate_limits: Arc::new(RateLimitStore::new(
                dir.join(RATE_LIMIT_FILE),
                storage.max_downloads_per_ip,
                storage.rate_limit_window(),
            )),
            counter: Arc::new(DownloadCounter::new(dir.join(COUNTER_FILE))),
            history: Arc::new(CloneHistory::new(dir.join(HISTORY_FILE))),
            registry: JobRegistry::new(),
            cache,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Registers a job and starts it in the background. Returns immediately.
    pub fn start_clone(&self, url: &str, options: CloneOptions) -> Result<JobId> {
        let parsed = parse_target(url)?;
        let id = Uuid::new_v4().to_string();
        self.registry.insert(CloneJob::new(id.clone(), parsed.as_str(), options));

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let cloner = WebCloner::new((*self.config).clone(), options)
            .with_cache(self.cache.clone())
            .with_events(events_tx);

        let registry = self.registry.clone();
        let job_id = id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                registry.apply(&job_id, &event);
            }
        });

        let history = self.history.clone();
        let span = tracing::info_span!("clone_job", job_id = %id);
        let url = parsed.to_string();
        tokio::spawn(
            async move {
                let result = cloner.run(&url).await;
                // Closing the last sender lets the forwarder drain and stop.
                drop(cloner);
                let _ = forwarder.await;

                let (archive, error) = match &result {
                    Ok(report) => (
                        report
                            .archive_path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned()),
                        None,
                    ),
                    Err(e) => (None, Some(e.to_string())),
                };
                let entry = HistoryEntry {
                    date: Utc::now(),
                    url: &url,
                    archive,
                    status: if result.is_ok() { "success" } else { "failed" },
                    error: error.as_deref(),
                };
                if let Err(e) = history.record(&entry).await {
                    warn!(error = %e, "could not append to clone history");
                }
            }
            .instrument(span),
        );

        info!(job_id = %id, url = %parsed, "clone job queued");
        Ok(id)
    }

    /// Like [`start_clone`](Self::start_clone), but first charges one
    /// download to `ip`.
    pub async fn start_clone_for_ip(&self, ip: &str, url: &str, options: CloneOptions) -> Result<JobId> {
        parse_target(url)?;
        if !self.rate_limits.try_acquire(ip).await? {
            warn!(ip, "download limit reached");
            return Err(CloneError::RateLimited { ip: ip.to_string() });
        }
        self.start_clone(url, options)
    }

    pub async fn remaining_downloads(&self, ip: &str) -> usize {
        self.rate_limits.remaining(ip).await
    }

    pub fn progress(&self, id: &str) -> Option<CloneJob> {
        self.registry.get(id)
    }

    /// Path of the finished archive. `None` until the job is done.
    pub fn archive(&self, id: &str) -> Option<PathBuf> {
        let job = self.registry.get(id)?;
        if job.status != JobStatus::Done {
            return None;
        }
        job.archive_path.filter(|p| p.is_file())
    }

    /// Records a delivered archive: bumps the global counter and forgets
    /// the job after the grace window. Returns the new counter value.
    pub async fn mark_delivered(&self, id: &str) -> Result<u64> {
        if self.archive(id).is_none() {
            return Err(CloneError::JobNotFound(id.to_string()));
        }

        let total = self.counter.increment().await?;
        self.registry.evict_after(id, self.config.storage.delivery_grace());
        info!(job_id = id, total_downloads = total, "archive delivered");
        Ok(total)
    }

    pub async fn downloads_count(&self) -> u64 {
        self.counter.get().await
    }

    /// Starts the periodic removal of expired archives and cached downloads.
    /// The first sweep runs immediately.
    pub fn spawn_retention_sweeper(&self) -> JoinHandle<()> {
        let storage = &self.config.storage;
        let dir = storage.storage_dir.clone();
        let max_age = storage.retention();
        let interval = storage.cleanup_interval();
        let cache = self.cache.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let dir = dir.clone();
                match tokio::task::spawn_blocking(move || sweep_archives(&dir, max_age)).await {
                    Ok(Ok(removed)) => debug!(removed, "retention sweep finished"),
                    Ok(Err(e)) => warn!(error = %e, "retention sweep failed"),
                    Err(e) => warn!(error = %e, "retention sweep task panicked"),
                }

                let pruned = cache.prune(max_age);
                if pruned > 0 {
                    debug!(pruned, "dropped stale cached downloads");
                }
            }
        })
    }
}

fn parse_target(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim()).map_err(|e| CloneError::InvalidUrl(format!("{url}: {e}")))?;
    if !is_fetchable(&parsed) {
        return Err(CloneError::InvalidUrl(format!("{url}: only http(s) URLs can be cloned")));
    }
    Ok(parsed)
}
