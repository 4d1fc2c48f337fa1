//! Headless Chromium extraction via chromiumoxide.
//!
//! The page is loaded in a fresh browser, every network response whose type
//! looks like a page resource is recorded, and the live DOM is queried for
//! lazy-load attributes that never triggered a request.

use super::static_html::scan_html;
use super::{ExtractedPage, ResourceExtractor};
use crate::config::Viewport;
use crate::error::{CloneError, Result};
use crate::resolver::{is_fetchable, normalize};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EventResponseReceived, SetUserAgentOverrideParams,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const RESOURCE_EXTENSIONS: &[&str] = &[
    "css", "js", "mjs", "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "bmp", "woff", "woff2",
    "ttf", "eot", "otf", "mp4", "webm", "mp3",
];

/// Collects resource URLs that only exist in the live DOM.
const DOM_RESOURCES_JS: &str = r#"
(() => {
  const found = new Set();
  const add = (v) => { if (v && /^https?:/.test(v)) found.add(v); };
  document.querySelectorAll('img').forEach(img => {
    add(img.currentSrc); add(img.src);
    add(img.dataset.src); add(img.dataset.lazy); add(img.dataset.original);
  });
  document.querySelectorAll('link[rel~="stylesheet"], link[rel*="icon"]').forEach(l => add(l.href));
  document.querySelectorAll('script[src]').forEach(s => add(s.src));
  document.querySelectorAll('source, video, audio, iframe, embed').forEach(el => {
    add(el.src); if (el.poster) add(el.poster);
  });
  document.querySelectorAll('[style*="url("]').forEach(el => {
    const m = el.style.backgroundImage.match(/url\(["']?([^"')]+)["']?\)/);
    if (m) add(new URL(m[1], document.baseURI).href);
  });
  return Array.from(found);
})()
"#;

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub user_agent: String,
    pub viewport: Viewport,
    /// Navigation timeout
    pub timeout: Duration,
    /// Extra wait after load for lazy content
    pub settle: Duration,
    pub capture_screenshot: bool,
    /// Browser binary; auto-detected when unset
    pub executable: Option<PathBuf>,
}

pub struct RenderedExtractor {
    settings: RenderSettings,
}

impl RenderedExtractor {
    pub const NAME: &'static str = "rendered";

    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    async fn launch(&self) -> Result<(Browser, tokio::task::JoinHandle<()>)> {
        let mut builder = BrowserConfig::builder()
            .window_size(self.settings.viewport.width, self.settings.viewport.height)
            .request_timeout(self.settings.timeout)
            .arg("--headless=new")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--no-first-run")
            .arg("--disable-extensions");
        if let Some(path) = &self.settings.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(CloneError::Render)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CloneError::Render(format!("failed to launch browser: {e}")))?;

        let handle = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        Ok((browser, handle))
    }

    async fn render(&self, browser: &Browser, url: &Url) -> Result<ExtractedPage> {
        let page = browser.new_page("about:blank").await.map_err(render_err)?;
        page.set_user_agent(SetUserAgentOverrideParams::new(self.settings.user_agent.clone()))
            .await
            .map_err(render_err)?;

        let responses: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let mut events = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(render_err)?;
        let sink = responses.clone();
        let listener = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Ok(mut seen) = sink.lock() {
                    seen.push((event.response.url.clone(), event.response.mime_type.clone()));
                }
            }
        });

        let navigated = self.navigate(&page, url).await;
        listener.abort();
        navigated?;

        let html = page.content().await.map_err(render_err)?;
        let final_url = page
            .url()
            .await
            .map_err(render_err)?
            .and_then(|u| Url::parse(&u).ok())
            .unwrap_or_else(|| url.clone());

        let mut refs = scan_html(&html, &final_url);

        if let Ok(seen) = responses.lock() {
            for (raw, mime_type) in seen.iter() {
                if let Ok(found) = Url::parse(raw) {
                    if found != final_url && is_fetchable(&found) && looks_like_resource(&found, mime_type) {
                        refs.resources.insert(strip_fragment(found));
                    }
                }
            }
        }

        match page.evaluate(DOM_RESOURCES_JS).await {
            Ok(result) => {
                let dom_urls: Vec<String> = result.into_value().unwrap_or_default();
                for raw in dom_urls {
                    if let Some(found) = normalize(&raw, &final_url).filter(is_fetchable) {
                        refs.resources.insert(found);
                    }
                }
            }
            Err(e) => warn!(url = %url, error = %e, "DOM resource query failed"),
        }

        let screenshot = if self.settings.capture_screenshot {
            match page
                .screenshot(ScreenshotParams::builder().full_page(true).build())
                .await
            {
                Ok(png) => Some(png),
                Err(e) => {
                    warn!(url = %url, error = %e, "screenshot failed");
                    None
                }
            }
        } else {
            None
        };

        Ok(ExtractedPage {
            url: final_url,
            html,
            resources: refs.resources,
            links: refs.links,
            screenshot,
            strategy: self.name(),
        })
    }

    async fn navigate(&self, page: &Page, url: &Url) -> Result<()> {
        let timeout = self.settings.timeout;

        tokio::time::timeout(timeout, page.goto(url.as_str()))
            .await
            .map_err(|_| CloneError::Render(format!("navigation timed out after {:?}", timeout)))?
            .map_err(render_err)?;

        if tokio::time::timeout(timeout, page.wait_for_navigation())
            .await
            .is_err()
        {
            debug!(url = %url, "page never reached idle, continuing");
        }

        tokio::time::sleep(self.settings.settle).await;
        Ok(())
    }
}

#[async_trait]
impl ResourceExtractor for RenderedExtractor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn extract(&self, url: &Url) -> Result<ExtractedPage> {
        let (mut browser, handler) = self.launch().await?;
        let result = self.render(&browser, url).await;

        if let Err(e) = browser.close().await {
            debug!(error = %e, "browser close failed");
        }
        let _ = browser.wait().await;
        handler.abort();

        result
    }
}

fn render_err(e: chromiumoxide::error::CdpError) -> CloneError {
    CloneError::Render(e.to_string())
}

fn strip_fragment(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

/// Whether a network response should be archived as a page resource.
pub fn looks_like_resource(url: &Url, mime_type: &str) -> bool {
    let mime_type = mime_type.to_ascii_lowercase();
    if mime_type.contains("text/css")
        || mime_type.contains("javascript")
        || mime_type.starts_with("image/")
        || mime_type.starts_with("font/")
        || mime_type.starts_with("video/")
        || mime_type.starts_with("audio/")
    {
        return true;
    }

    url.path()
        .rsplit('.')
        .next()
        .map(|ext| RESOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
