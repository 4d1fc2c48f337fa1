//! Raw HTML / CSS scanning.

use super::{ExtractedPage, ResourceExtractor};
use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::resolver::{is_fetchable, normalize};
use async_trait::async_trait;
use regex::Regex;
use select::document::Document;
use select::node::Node;
use select::predicate::{Attr, Name, Predicate};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use url::Url;

/// Attributes that carry a single resource URL, per element.
const SOURCE_ATTRS: &[(&str, &[&str])] = &[
    ("img", &["src", "data-src", "data-lazy", "data-original", "data-lazy-src"]),
    ("script", &["src"]),
    ("source", &["src", "data-src"]),
    ("video", &["src", "poster", "data-src"]),
    ("audio", &["src"]),
    ("track", &["src"]),
    ("iframe", &["src"]),
    ("embed", &["src"]),
    ("object", &["data"]),
    ("input", &["src"]),
];

/// Attributes holding `srcset`-style candidate lists.
pub const SRCSET_ATTRS: &[&str] = &["srcset", "data-srcset"];

/// Every attribute the rewriter treats as a resource reference.
pub const REFERENCE_ATTRS: &[&str] = &[
    "src",
    "href",
    "data-src",
    "data-lazy",
    "data-original",
    "data-lazy-src",
    "poster",
    "data",
];

/// `url(...)` in CSS; group 2 is the reference, groups 1 and 3 the quotes.
pub fn css_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"url\(\s*(['"]?)([^'")]+?)(['"]?)\s*\)"#).expect("valid css url regex")
    })
}

/// References found in one HTML document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRefs {
    pub resources: BTreeSet<Url>,
    pub links: BTreeSet<Url>,
}

impl PageRefs {
    fn add_resource(&mut self, raw: &str, base: &Url) {
        if let Some(url) = fetchable(raw, base) {
            self.resources.insert(url);
        }
    }

    fn add_link(&mut self, raw: &str, base: &Url) {
        if let Some(url) = fetchable(raw, base) {
            self.links.insert(url);
        }
    }
}

fn fetchable(raw: &str, base: &Url) -> Option<Url> {
    let raw = raw.trim();
    if raw.starts_with("data:") {
        return None;
    }
    normalize(raw, base).filter(is_fetchable)
}

/// Whether a `<link>` points at something the page needs to render.
pub fn is_resource_link(node: &Node) -> bool {
    let rel = node.attr("rel").unwrap_or("").to_ascii_lowercase();
    let kind = node.attr("as").unwrap_or("").to_ascii_lowercase();

    rel.split_whitespace().any(|r| {
        matches!(r, "stylesheet" | "icon" | "apple-touch-icon" | "mask-icon" | "manifest")
            || (matches!(r, "preload" | "prefetch")
                && matches!(kind.as_str(), "style" | "font" | "image" | "script"))
    })
}

/// Splits a `srcset` value into its candidate URLs.
pub fn srcset_urls(srcset: &str) -> impl Iterator<Item = &str> {
    srcset
        .split(',')
        .filter_map(|candidate| candidate.split_whitespace().next())
}

/// Collects resource and page references from an HTML document.
///
/// Relative references resolve against `<base href>` when present, otherwise
/// against `page_url`.
pub fn scan_html(html: &str, page_url: &Url) -> PageRefs {
    let document = Document::from(html);
    let mut refs = PageRefs::default();

    let base = document
        .find(Name("base"))
        .filter_map(|n| n.attr("href"))
        .find_map(|href| normalize(href, page_url))
        .unwrap_or_else(|| page_url.clone());

    for (element, attrs) in SOURCE_ATTRS {
        for node in document.find(Name(*element)) {
            for attr in *attrs {
                if let Some(value) = node.attr(attr) {
                    refs.add_resource(value, &base);
                }
            }
            for attr in SRCSET_ATTRS {
                if let Some(srcset) = node.attr(attr) {
                    for candidate in srcset_urls(srcset) {
                        refs.add_resource(candidate, &base);
                    }
                }
            }
        }
    }

    for link in document.find(Name("link").and(Attr("href", ()))) {
        if is_resource_link(&link) {
            if let Some(href) = link.attr("href") {
                refs.add_resource(href, &base);
            }
        }
    }

    for element in document.find(Attr("style", ())) {
        if let Some(style) = element.attr("style") {
            refs.resources.extend(scan_css(style, &base));
        }
    }

    for style in document.find(Name("style")) {
        refs.resources.extend(scan_css(&style.text(), &base));
    }

    for anchor in document.find(Name("a").and(Attr("href", ()))) {
        if let Some(href) = anchor.attr("href") {
            refs.add_link(href, &base);
        }
    }

    refs
}

/// Collects every non-`data:` `url(...)` reference in a stylesheet,
/// plus `@import "..."` targets.
pub fn scan_css(css: &str, base: &Url) -> BTreeSet<Url> {
    let mut found = BTreeSet::new();

    for cap in css_url_re().captures_iter(css) {
        if let Some(raw) = cap.get(2) {
            if let Some(url) = fetchable(raw.as_str(), base) {
                found.insert(url);
            }
        }
    }

    for cap in css_import_re().captures_iter(css) {
        if let Some(url) = cap.get(1).and_then(|raw| fetchable(raw.as_str(), base)) {
            found.insert(url);
        }
    }

    found
}

/// `@import "..."`; group 1 is the reference.
pub fn css_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"@import\s+['"]([^'"]+)['"]"#).expect("valid css import regex")
    })
}

/// Fetches the raw HTML over HTTP and scans it.
#[derive(Clone)]
pub struct StaticExtractor {
    fetcher: Fetcher,
}

impl StaticExtractor {
    pub const NAME: &'static str = "static";

    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl ResourceExtractor for StaticExtractor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn extract(&self, url: &Url) -> Result<ExtractedPage> {
        let fetched = self.fetcher.fetch_text(url).await?;
        let refs = scan_html(&fetched.body, &fetched.url);

        Ok(ExtractedPage {
            url: fetched.url,
            html: fetched.body,
            resources: refs.resources,
            links: refs.links,
            screenshot: None,
            strategy: self.name(),
        })
    }
}
