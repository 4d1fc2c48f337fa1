//! Resource discovery for a page.
//!
//! Two strategies implement [`ResourceExtractor`]: [`RenderedExtractor`]
//! drives a headless browser, [`StaticExtractor`] fetches the raw HTML and
//! parses it. [`FallbackExtractor`] tries a list of strategies in order and
//! returns the first success.

pub mod rendered;
pub mod static_html;

pub use rendered::{RenderSettings, RenderedExtractor};
pub use static_html::{scan_css, scan_html, PageRefs, StaticExtractor};

use crate::error::{CloneError, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{info, warn};
use url::Url;

/// A page together with everything it references.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    /// Page URL after redirects
    pub url: Url,
    /// HTML to persist for the page (rendered DOM or raw response)
    pub html: String,
    /// Deduplicated sub-resources (images, styles, scripts, fonts, media)
    pub resources: BTreeSet<Url>,
    /// Outgoing `<a href>` targets
    pub links: BTreeSet<Url>,
    /// Full-page PNG, when the strategy can take one
    pub screenshot: Option<Vec<u8>>,
    /// Name of the strategy that produced this page
    pub strategy: &'static str,
}

#[async_trait]
pub trait ResourceExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, url: &Url) -> Result<ExtractedPage>;
}

/// Ordered list of strategies; later ones run only when earlier ones fail.
pub struct FallbackExtractor {
    strategies: Vec<Box<dyn ResourceExtractor>>,
}

impl FallbackExtractor {
    pub fn new(strategies: Vec<Box<dyn ResourceExtractor>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl ResourceExtractor for FallbackExtractor {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn extract(&self, url: &Url) -> Result<ExtractedPage> {
        let mut last_error = None;

        for strategy in &self.strategies {
            match strategy.extract(url).await {
                Ok(page) => {
                    info!(
                        url = %url,
                        strategy = strategy.name(),
                        resources = page.resources.len(),
                        "page extracted"
                    );
                    return Ok(page);
                }
                Err(e) => {
                    warn!(url = %url, strategy = strategy.name(), error = %e, "extraction strategy failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| CloneError::SeedUnreachable {
            url: url.to_string(),
            message: "no extraction strategy configured".to_string(),
        }))
    }
}
