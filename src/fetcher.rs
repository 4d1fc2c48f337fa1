//! HTTP retrieval with retry, a job-wide byte budget and atomic writes.
//!
//! A resource is streamed into `<dest>.part` and renamed into place only once
//! the body is complete, so a failed or aborted download never leaves a
//! truncated file at a path other steps rely on.

use crate::config::CloningConfig;
use crate::error::{CloneError, Result};
use crate::optimize::{AssetKind, Optimizer};
use crate::store::{sibling_temp_path, DownloadCache};
use futures::StreamExt;
use mime::Mime;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

/// Bytes a job may still download, shared by all of its fetch tasks.
#[derive(Debug)]
pub struct ByteBudget {
    limit: u64,
    used: AtomicU64,
}

impl ByteBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    /// Counts `bytes` against the budget. A chunk that would pass the limit
    /// is not counted and false is returned.
    pub fn consume(&self, bytes: u64) -> bool {
        let total = self.used.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if total > self.limit {
            self.used.fetch_sub(bytes, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Returns bytes of a download that was thrown away.
    pub fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| Some(used.saturating_sub(bytes)));
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub user_agent: String,
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub attempts: u32,
    pub base_delay: Duration,
}

impl FetchSettings {
    pub fn from_config(config: &CloningConfig, user_agent: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            timeout: config.timeout(),
            follow_redirects: config.follow_redirects,
            attempts: config.retry_attempts.max(1),
            base_delay: config.retry_base_delay(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub bytes: u64,
    pub content_type: Option<Mime>,
    pub kind: AssetKind,
    pub from_cache: bool,
    pub optimized: bool,
}

/// A text document fetched into memory (the seed page on the static path).
#[derive(Debug, Clone)]
pub struct FetchedText {
    /// URL after redirects
    pub url: Url,
    pub content_type: Option<Mime>,
    pub body: String,
}

#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    settings: FetchSettings,
    budget: Arc<ByteBudget>,
    cache: DownloadCache,
    optimizer: Optimizer,
}

impl Fetcher {
    pub fn new(
        settings: FetchSettings,
        budget: Arc<ByteBudget>,
        cache: DownloadCache,
        optimizer: Optimizer,
    ) -> Result<Self> {
        let client = Self::build_http_client(&settings)?;
        Ok(Self {
            client,
            settings,
            budget,
            cache,
            optimizer,
        })
    }

    fn build_http_client(settings: &FetchSettings) -> Result<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let redirect = if settings.follow_redirects {
            Policy::limited(5)
        } else {
            Policy::none()
        };

        ClientBuilder::new()
            .use_rustls_tls()
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .timeout(settings.timeout)
            .redirect(redirect)
            .build()
            .map_err(|source| CloneError::Http {
                url: String::new(),
                source,
            })
    }

    pub fn budget(&self) -> &Arc<ByteBudget> {
        &self.budget
    }

    pub fn attempts(&self) -> u32 {
        self.settings.attempts
    }

    /// Downloads `url` to `dest`, retrying up to `attempts` times with
    /// exponential backoff, then runs the post-processing hook.
    ///
    /// A previous download of the same URL that still exists on disk is
    /// copied instead of fetched. Copies out of a shared cache are untouched
    /// originals and go through post-processing like fresh downloads.
    pub async fn fetch(&self, url: &Url, dest: &Path, attempts: u32) -> Result<FetchOutcome> {
        if let Some(cached) = self.cache.lookup(url.as_str()) {
            let bytes = self.copy_from_cache(url, &cached, dest).await?;
            let kind = AssetKind::detect(None, dest);
            let optimized = if self.cache.is_shared() {
                self.post_process(url, dest, kind).await
            } else {
                false
            };
            return Ok(FetchOutcome {
                bytes,
                content_type: None,
                kind,
                from_cache: true,
                optimized,
            });
        }

        let (bytes, content_type) = self
            .with_retry(url, attempts, || self.fetch_once(url, dest))
            .await?;
        if let Err(e) = self.cache.record(url.as_str(), dest).await {
            warn!(url = %url, error = %e, "could not cache download");
        }

        let kind = AssetKind::detect(content_type.as_ref(), dest);
        let optimized = self.post_process(url, dest, kind).await;

        Ok(FetchOutcome {
            bytes,
            content_type,
            kind,
            from_cache: false,
            optimized,
        })
    }

    async fn post_process(&self, url: &Url, dest: &Path, kind: AssetKind) -> bool {
        match self.optimizer.process(dest, kind).await {
            Ok(replaced) => replaced,
            Err(e) => {
                warn!(url = %url, error = %e, "post-processing failed, keeping original file");
                false
            }
        }
    }

    /// Fetches a document into memory, counting it against the budget.
    pub async fn fetch_text(&self, url: &Url) -> Result<FetchedText> {
        self.with_retry(url, self.settings.attempts, || self.fetch_text_once(url))
            .await
    }

    async fn with_retry<T, F, Fut>(&self, url: &Url, attempts: u32, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt + 1 >= attempts => return Err(e),
                Err(e) => {
                    let delay = self.settings.base_delay * 2u32.saturating_pow(attempt);
                    debug!(url = %url, attempt = attempt + 1, error = %e, ?delay, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send(&self, url: &Url) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| CloneError::Http {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CloneError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    async fn fetch_once(&self, url: &Url, dest: &Path) -> Result<(u64, Option<Mime>)> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self.send(url).await?;
        let content_type = content_type_of(&response);
        let tmp = sibling_temp_path(dest);

        let streamed = self.stream_to_file(url, response, &tmp).await;
        match streamed {
            Ok(bytes) => {
                tokio::fs::rename(&tmp, dest).await?;
                debug!(url = %url, path = ?dest, bytes, "saved");
                Ok((bytes, content_type))
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    /// Streams the body into `tmp`. Bytes of a failed stream are given back
    /// to the budget since the partial file is discarded.
    async fn stream_to_file(&self, url: &Url, response: reqwest::Response, tmp: &Path) -> Result<u64> {
        let mut written = 0u64;
        let result = self.write_stream(url, response, tmp, &mut written).await;
        if result.is_err() {
            self.budget.release(written);
        }
        result.map(|()| written)
    }

    async fn write_stream(
        &self,
        url: &Url,
        response: reqwest::Response,
        tmp: &Path,
        written: &mut u64,
    ) -> Result<()> {
        let mut file = tokio::fs::File::create(tmp).await?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| CloneError::Http {
                url: url.to_string(),
                source,
            })?;
            if !self.budget.consume(chunk.len() as u64) {
                return Err(CloneError::SizeLimit {
                    url: url.to_string(),
                    limit: self.budget.limit(),
                });
            }
            *written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn fetch_text_once(&self, url: &Url) -> Result<FetchedText> {
        let response = self.send(url).await?;
        let final_url = response.url().clone();
        let content_type = content_type_of(&response);
        let mut stream = response.bytes_stream();
        let mut body = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) if self.budget.consume(chunk.len() as u64) => chunk,
                Ok(_) => {
                    self.budget.release(body.len() as u64);
                    return Err(CloneError::SizeLimit {
                        url: url.to_string(),
                        limit: self.budget.limit(),
                    });
                }
                Err(source) => {
                    self.budget.release(body.len() as u64);
                    return Err(CloneError::Http {
                        url: url.to_string(),
                        source,
                    });
                }
            };
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedText {
            url: final_url,
            content_type,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    async fn copy_from_cache(&self, url: &Url, cached: &Path, dest: &Path) -> Result<u64> {
        let bytes = if cached == dest {
            tokio::fs::metadata(dest).await?.len()
        } else {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = sibling_temp_path(dest);
            let bytes = tokio::fs::copy(cached, &tmp).await?;
            tokio::fs::rename(&tmp, dest).await?;
            bytes
        };

        debug!(url = %url, from = ?cached, "reused cached download");
        Ok(bytes)
    }
}

fn content_type_of(response: &reqwest::Response) -> Option<Mime> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
