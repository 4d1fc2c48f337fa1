//! The clone pipeline for a single job.
//!
//! `queued → fetching-seed → extracting → downloading → rewriting →
//! archiving → done`, or `failed` from any of them. Progress leaves through
//! an event channel; the cloner never touches caller-owned job state.

use crate::archive::create_archive;
use crate::config::ArchiverConfig;
use crate::error::{CloneError, Result};
use crate::extract::{
    scan_css, ExtractedPage, FallbackExtractor, RenderSettings, RenderedExtractor,
    ResourceExtractor, StaticExtractor,
};
use crate::fetcher::{ByteBudget, FetchOutcome, FetchSettings, Fetcher};
use crate::job::{format_bytes, CloneOptions, ErrorRecord, JobCounters, JobEvent, JobStatus};
use crate::limiter::ConcurrencyLimiter;
use crate::optimize::{AssetKind, OptimizeSettings, Optimizer};
use crate::resolver::{is_fetchable, PathResolver, UrlClass};
use crate::rewriter::Rewriter;
use crate::site_tree::{list_files, FileKind};
use crate::store::{write_atomic, DownloadCache};
use futures::future::join_all;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};
use url::Url;

/// Full-page capture of the seed, stored next to the mirrored site.
pub const SCREENSHOT_FILE: &str = "screenshot.png";

/// Result of a finished job.
#[derive(Debug, Clone)]
pub struct CloneReport {
    pub url: Url,
    pub archive_path: PathBuf,
    pub counters: JobCounters,
    pub errors: Vec<ErrorRecord>,
    pub pages: usize,
    pub strategy: &'static str,
    pub elapsed: Duration,
}

pub struct WebCloner {
    config: ArchiverConfig,
    options: CloneOptions,
    cache: DownloadCache,
    events: Option<UnboundedSender<JobEvent>>,
    extractor: Option<Arc<dyn ResourceExtractor>>,
}

impl WebCloner {
    pub fn new(config: ArchiverConfig, options: CloneOptions) -> Self {
        Self {
            config,
            options,
            cache: DownloadCache::new(),
            events: None,
            extractor: None,
        }
    }

    /// Uses `cache` instead of a cache private to this run. Only a cache from
    /// [`DownloadCache::shared_in`] may serve several jobs.
    pub fn with_cache(mut self, cache: DownloadCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<JobEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replaces the default rendered-then-static seed extraction.
    pub fn with_extractor(mut self, extractor: Arc<dyn ResourceExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Clones `url` into a new archive under the storage directory.
    ///
    /// Per-resource failures are collected in the report. Only failures of
    /// the seed page, the working directory or the archive end the job.
    pub async fn run(&self, url: &str) -> Result<CloneReport> {
        let progress = Arc::new(Progress::new(self.events.clone()));
        match self.execute(url, &progress).await {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(url, error = %e, "clone failed");
                progress.fail(&e);
                Err(e)
            }
        }
    }

    async fn execute(&self, raw_url: &str, progress: &Arc<Progress>) -> Result<CloneReport> {
        let started = Instant::now();
        let cloning = &self.config.cloning;

        let seed_url = Url::parse(raw_url.trim())
            .map_err(|e| CloneError::InvalidUrl(format!("{raw_url}: {e}")))?;
        if !is_fetchable(&seed_url) {
            return Err(CloneError::InvalidUrl(format!("{raw_url}: only http(s) URLs can be cloned")));
        }

        info!(url = %seed_url, options = ?self.options, "starting clone");
        progress.stage(JobStatus::FetchingSeed, 5, format!("Loading {seed_url}"));

        let workdir = self.create_working_dir().await?;
        let root = workdir.path().to_path_buf();
        debug!(path = ?root, "working directory created");

        let fetcher = self.build_fetcher()?;
        let seed = self
            .seed_extractor(&fetcher)
            .extract(&seed_url)
            .await
            .map_err(|e| CloneError::SeedUnreachable {
                url: seed_url.to_string(),
                message: e.to_string(),
            })?;

        // The static path already counted the body while fetching it.
        if seed.strategy != StaticExtractor::NAME && !fetcher.budget().consume(seed.html.len() as u64) {
            return Err(CloneError::SizeLimit {
                url: seed.url.to_string(),
                limit: fetcher.budget().limit(),
            });
        }

        let resolver = PathResolver::new(&seed.url, cloning.include_externals);
        progress.stage(
            JobStatus::Extracting,
            10,
            format!("Page loaded ({} strategy), collecting resources", seed.strategy),
        );

        let seed_path = page_path(&resolver, &seed.url);
        write_atomic(&root.join(&seed_path), seed.html.as_bytes()).await?;
        if let Some(png) = &seed.screenshot {
            if let Err(e) = write_atomic(&root.join(SCREENSHOT_FILE), png).await {
                warn!(error = %e, "could not save screenshot");
            }
        }

        let mut site = SiteMap::new(&seed, seed_path);
        if self.options.save_structure && cloning.max_depth > 1 {
            self.crawl(&seed, &resolver, &fetcher, &root, &mut site, progress).await;
        }

        let ctx = Arc::new(JobContext {
            root: root.clone(),
            fetcher,
            resolver: resolver.clone(),
            claims: Mutex::new(Claims::new(cloning.max_files)),
            errors: Mutex::new(site.errors.clone()),
            progress: progress.clone(),
        });
        progress.add_errors(site.errors.len());

        for (url, path) in &site.pages {
            ctx.claim_page(url, path);
        }

        let mut planned = Vec::new();
        for url in &site.resources {
            match resolver.to_local_path(url) {
                Some(local) => {
                    if ctx.claim(url, &local) {
                        planned.push((url.clone(), local));
                    }
                }
                None => debug!(url = %url, "no local path, leaving reference as is"),
            }
        }

        progress.set_total(planned.len());
        progress.stage(
            JobStatus::Downloading,
            20,
            format!("Downloading {} resources", planned.len()),
        );

        let limiter = ConcurrencyLimiter::new(cloning.concurrency);
        let handles: Vec<_> = planned
            .into_iter()
            .map(|(url, local)| limiter.schedule(ctx.clone().download(url, local)))
            .collect();

        for outcome in join_all(handles).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "download task failed"),
                Err(e) => warn!(error = %e, "download task panicked"),
            }
        }

        progress.stage(JobStatus::Rewriting, 85, "Rewriting links to local files");
        let rewriter = Rewriter::new(resolver);
        let tree_root = root.clone();
        let (files, rewrite_errors) = tokio::task::spawn_blocking(move || -> Result<_> {
            let files = list_files(&tree_root)?;
            let errors = rewriter.rewrite_tree(&tree_root, &files);
            Ok((files, errors))
        })
        .await
        .map_err(|e| CloneError::Task(e.to_string()))??;
        progress.add_errors(rewrite_errors.len());
        ctx.extend_errors(rewrite_errors);

        progress.stage(
            JobStatus::Archiving,
            95,
            format!("Packaging {} files", files.len()),
        );
        let host = seed.url.host_str().unwrap_or("site");
        let archive_path = create_archive(&root, files, &self.config.storage.storage_dir, host).await?;

        if let Err(e) = workdir.close() {
            warn!(path = ?root, error = %e, "could not remove working directory");
        }

        let counters = progress.counters();
        let errors = ctx.errors();
        let elapsed = started.elapsed();
        info!(
            url = %seed_url,
            archive = ?archive_path,
            downloaded = counters.downloaded,
            optimized = counters.optimized,
            errors = counters.errors,
            size = %format_bytes(counters.bytes),
            elapsed_secs = elapsed.as_secs_f64(),
            "clone finished"
        );
        progress.done(&archive_path);

        Ok(CloneReport {
            url: seed.url,
            archive_path,
            counters,
            errors,
            pages: site.pages.len(),
            strategy: seed.strategy,
            elapsed,
        })
    }

    async fn create_working_dir(&self) -> Result<TempDir> {
        let parent = self.config.storage.temp_dir();
        let failed = |source| CloneError::WorkingDir {
            path: parent.clone(),
            source,
        };

        tokio::fs::create_dir_all(&parent).await.map_err(failed)?;
        tempfile::Builder::new()
            .prefix("website-archiver-")
            .tempdir_in(&parent)
            .map_err(failed)
    }

    fn user_agent(&self) -> &str {
        if self.options.mobile_version {
            &self.config.cloning.mobile_user_agent
        } else {
            &self.config.cloning.user_agent
        }
    }

    fn build_fetcher(&self) -> Result<Fetcher> {
        let cloning = &self.config.cloning;
        let optimize = if self.options.simple_download {
            OptimizeSettings::disabled()
        } else {
            OptimizeSettings::from_config(cloning)
        };

        Fetcher::new(
            FetchSettings::from_config(cloning, self.user_agent()),
            Arc::new(ByteBudget::new(cloning.max_total_size)),
            self.cache.clone(),
            Optimizer::new(optimize),
        )
    }

    fn seed_extractor(&self, fetcher: &Fetcher) -> Arc<dyn ResourceExtractor> {
        if let Some(extractor) = &self.extractor {
            return extractor.clone();
        }

        let cloning = &self.config.cloning;
        let mut strategies: Vec<Box<dyn ResourceExtractor>> = Vec::new();
        if cloning.render {
            strategies.push(Box::new(RenderedExtractor::new(RenderSettings {
                user_agent: self.user_agent().to_string(),
                viewport: if self.options.mobile_version {
                    cloning.mobile_viewport
                } else {
                    cloning.viewport
                },
                timeout: cloning.timeout(),
                settle: Duration::from_millis(cloning.render_settle_ms),
                capture_screenshot: cloning.capture_screenshot,
                executable: cloning.chrome_executable.clone(),
            })));
        }
        strategies.push(Box::new(StaticExtractor::new(fetcher.clone())));

        Arc::new(FallbackExtractor::new(strategies))
    }

    /// Breadth-first walk over internal links. The seed is level 1.
    async fn crawl(
        &self,
        seed: &ExtractedPage,
        resolver: &PathResolver,
        fetcher: &Fetcher,
        root: &Path,
        site: &mut SiteMap,
        progress: &Progress,
    ) {
        let max_depth = self.config.cloning.max_depth;
        let max_pages = self.config.cloning.max_files;
        let extractor = StaticExtractor::new(fetcher.clone());

        let mut visited: HashSet<String> = HashSet::from([seed.url.to_string()]);
        let mut queue: VecDeque<(Url, usize)> = seed.links.iter().map(|u| (u.clone(), 2)).collect();

        while let Some((url, depth)) = queue.pop_front() {
            if depth > max_depth || site.pages.len() >= max_pages {
                continue;
            }
            if resolver.classify(&url) != UrlClass::Internal || !visited.insert(url.to_string()) {
                continue;
            }
            let Some(local) = resolver.to_local_path(&url) else {
                continue;
            };
            if FileKind::from_path(&local) != FileKind::Html || site.has_page(&local) {
                continue;
            }

            let page = match extractor.extract(&url).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(url = %url, error = %e, "could not load linked page");
                    site.errors.push(ErrorRecord {
                        url: url.to_string(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            if let Err(e) = write_atomic(&root.join(&local), page.html.as_bytes()).await {
                warn!(url = %url, error = %e, "could not save linked page");
                continue;
            }
            debug!(url = %url, path = ?local, depth, "saved linked page");
            progress.message(format!("Saved page {} ({} so far)", url, site.pages.len() + 1));

            queue.extend(page.links.iter().map(|link| (link.clone(), depth + 1)));
            site.add_page(&page, local);
        }
    }
}

/// Local file for an HTML page. Pages whose URL maps to a non-HTML name
/// (`/view.php`) are saved with an `.html` extension instead.
pub fn page_path(resolver: &PathResolver, url: &Url) -> PathBuf {
    let mut path = resolver
        .to_local_path(url)
        .unwrap_or_else(|| PathBuf::from("index.html"));
    if FileKind::from_path(&path) != FileKind::Html {
        path.set_extension("html");
    }
    path
}

/// Pages saved so far and the resources they reference.
struct SiteMap {
    pages: Vec<(Url, PathBuf)>,
    resources: BTreeSet<Url>,
    errors: Vec<ErrorRecord>,
}

impl SiteMap {
    fn new(seed: &ExtractedPage, seed_path: PathBuf) -> Self {
        Self {
            pages: vec![(seed.url.clone(), seed_path)],
            resources: seed.resources.clone(),
            errors: Vec::new(),
        }
    }

    fn has_page(&self, path: &Path) -> bool {
        self.pages.iter().any(|(_, p)| p == path)
    }

    fn add_page(&mut self, page: &ExtractedPage, path: PathBuf) {
        self.pages.push((page.url.clone(), path));
        self.resources.extend(page.resources.iter().cloned());
    }
}

/// URLs and paths already owned by a task of this job, and how many
/// resources may still be scheduled.
struct Claims {
    urls: HashSet<String>,
    paths: HashSet<PathBuf>,
    scheduled: usize,
    max_files: usize,
    capped: bool,
}

impl Claims {
    fn new(max_files: usize) -> Self {
        Self {
            urls: HashSet::new(),
            paths: HashSet::new(),
            scheduled: 0,
            max_files,
            capped: false,
        }
    }

    fn is_taken(&self, url: &Url, path: &Path) -> bool {
        self.urls.contains(url.as_str()) || self.paths.contains(path)
    }

    fn insert(&mut self, url: &Url, path: &Path) {
        self.urls.insert(url.to_string());
        self.paths.insert(path.to_path_buf());
    }

    /// Reserves a resource and its file. False if either is taken or
    /// `max_files` resources were already reserved.
    fn reserve(&mut self, url: &Url, path: &Path) -> bool {
        if self.is_taken(url, path) {
            return false;
        }
        if self.scheduled >= self.max_files {
            if !self.capped {
                self.capped = true;
                warn!(max = self.max_files, url = %url, "file limit reached, further resources skipped");
            }
            return false;
        }
        self.insert(url, path);
        self.scheduled += 1;
        true
    }
}

/// State shared by the download tasks of one job.
struct JobContext {
    root: PathBuf,
    fetcher: Fetcher,
    resolver: PathResolver,
    claims: Mutex<Claims>,
    errors: Mutex<Vec<ErrorRecord>>,
    progress: Arc<Progress>,
}

impl JobContext {
    /// Marks an already saved page as taken. Pages do not count against
    /// `max_files`.
    fn claim_page(&self, url: &Url, path: &Path) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.insert(url, path);
        }
    }

    /// Atomically reserves a resource and its file. See [`Claims::reserve`].
    fn claim(&self, url: &Url, path: &Path) -> bool {
        self.claims
            .lock()
            .map(|mut claims| claims.reserve(url, path))
            .unwrap_or(false)
    }

    /// Fetches one resource. Stylesheets are scanned right away and their
    /// own resources fetched in this same task.
    async fn download(self: Arc<Self>, url: Url, local: PathBuf) -> Result<()> {
        let attempts = self.fetcher.attempts();
        let mut pending = vec![(url, local)];

        while let Some((url, local)) = pending.pop() {
            let dest = self.root.join(&local);
            match self.fetcher.fetch(&url, &dest, attempts).await {
                Ok(outcome) => {
                    self.progress.resource_done(&outcome);
                    if outcome.kind == AssetKind::Css || FileKind::from_path(&local) == FileKind::Css {
                        pending.extend(self.stylesheet_children(&url, &dest).await);
                    }
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "resource failed");
                    self.push_error(ErrorRecord {
                        url: url.to_string(),
                        message: e.to_string(),
                    });
                    self.progress.resource_failed();
                }
            }
        }

        Ok(())
    }

    async fn stylesheet_children(&self, url: &Url, path: &Path) -> Vec<(Url, PathBuf)> {
        let css = match tokio::fs::read(path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!(url = %url, error = %e, "could not read stylesheet");
                return Vec::new();
            }
        };

        scan_css(&css, url)
            .into_iter()
            .filter_map(|child| {
                let local = self.resolver.to_local_path(&child)?;
                self.claim(&child, &local).then_some((child, local))
            })
            .collect()
    }

    fn push_error(&self, record: ErrorRecord) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(record);
        }
    }

    fn extend_errors(&self, records: Vec<ErrorRecord>) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.extend(records);
        }
    }

    fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

struct ProgressState {
    status: JobStatus,
    percent: u8,
    counters: JobCounters,
    /// Resource tasks finished either way
    settled: usize,
}

/// Tracks counters and emits [`JobEvent`]s. Percentages never decrease.
struct Progress {
    events: Option<UnboundedSender<JobEvent>>,
    state: Mutex<ProgressState>,
}

impl Progress {
    fn new(events: Option<UnboundedSender<JobEvent>>) -> Self {
        Self {
            events,
            state: Mutex::new(ProgressState {
                status: JobStatus::Queued,
                percent: 0,
                counters: JobCounters::default(),
                settled: 0,
            }),
        }
    }

    /// Applies `change` under the lock and emits the resulting state with
    /// the message it returns.
    fn update<F>(&self, archive_path: Option<PathBuf>, error: Option<String>, change: F)
    where
        F: FnOnce(&mut ProgressState) -> String,
    {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let before = state.percent;
        let message = change(&mut state);
        state.percent = state.percent.clamp(before, 100);

        if let Some(events) = &self.events {
            let _ = events.send(JobEvent {
                status: state.status,
                percent: state.percent,
                message,
                counters: state.counters,
                archive_path,
                error,
            });
        }
    }

    fn stage(&self, status: JobStatus, percent: u8, message: impl Into<String>) {
        let message = message.into();
        info!(%status, percent, "{}", message);
        self.update(None, None, |state| {
            state.status = status;
            state.percent = percent;
            message
        });
    }

    fn message(&self, message: String) {
        self.update(None, None, |_| message);
    }

    fn set_total(&self, total: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.counters.total = total;
        }
    }

    fn resource_done(&self, outcome: &FetchOutcome) {
        self.settle(|counters| {
            counters.downloaded += 1;
            counters.bytes += outcome.bytes;
            if outcome.optimized {
                counters.optimized += 1;
            }
        });
    }

    fn resource_failed(&self) {
        self.settle(|counters| counters.errors += 1);
    }

    fn settle<F: FnOnce(&mut JobCounters)>(&self, change: F) {
        self.update(None, None, |state| {
            change(&mut state.counters);
            state.settled += 1;
            state.percent = downloading_percent(state.settled, state.counters.total);
            format!("Downloaded {}/{} resources", state.settled, state.counters.total)
        });
    }

    fn add_errors(&self, count: usize) {
        if count > 0 {
            if let Ok(mut state) = self.state.lock() {
                state.counters.errors += count;
            }
        }
    }

    fn counters(&self) -> JobCounters {
        self.state.lock().map(|s| s.counters).unwrap_or_default()
    }

    fn done(&self, archive_path: &Path) {
        self.update(Some(archive_path.to_path_buf()), None, |state| {
            state.status = JobStatus::Done;
            state.percent = 100;
            "Archive ready".to_string()
        });
    }

    fn fail(&self, error: &CloneError) {
        self.update(None, Some(error.to_string()), |state| {
            state.status = JobStatus::Failed;
            "Clone failed".to_string()
        });
    }
}

/// 20% → 80% across the downloading phase.
fn downloading_percent(settled: usize, total: usize) -> u8 {
    if total == 0 {
        return 80;
    }
    let ratio = settled.min(total) as f64 / total as f64;
    20 + (ratio * 60.0).round() as u8
}
