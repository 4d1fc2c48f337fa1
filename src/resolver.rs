//! URL normalization and URL → local path mapping.
//!
//! Every file written for a job lives at the path returned by
//! [`PathResolver::to_local_path`], so the mapping must stay a pure function of
//! the URL and the site origin.

use std::path::{Component, Path, PathBuf};
use url::{Origin, Url};

/// Directory that holds resources from other hosts.
pub const EXTERNAL_DIR: &str = "external-assets";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlClass {
    Internal,
    External,
}

/// Resolves `raw` against `base`, dropping any fragment.
///
/// Returns `None` for empty or malformed input.
pub fn normalize(raw: &str, base: &Url) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') {
        return None;
    }

    let mut url = base.join(raw).ok()?;
    url.set_fragment(None);
    Some(url)
}

/// Only http(s) resources can be fetched and stored.
pub fn is_fetchable(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.host_str().is_some()
}

pub fn classify(url: &Url, site_origin: &Origin) -> UrlClass {
    if &url.origin() == site_origin {
        UrlClass::Internal
    } else {
        UrlClass::External
    }
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    site: Url,
    origin: Origin,
    include_externals: bool,
}

impl PathResolver {
    pub fn new(site: &Url, include_externals: bool) -> Self {
        Self {
            site: site.clone(),
            origin: site.origin(),
            include_externals,
        }
    }

    pub fn site(&self) -> &Url {
        &self.site
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn classify(&self, url: &Url) -> UrlClass {
        classify(url, &self.origin)
    }

    /// Maps an absolute URL to its relative location inside the working
    /// directory.
    ///
    /// Internal URLs mirror their path (`/` → `index.html`, extension-less
    /// paths without a query get `.html`). External URLs land under
    /// `external-assets/<host>/`. The query string never reaches the file
    /// name, so `a.png?v=1` and `a.png?v=2` share one file.
    pub fn to_local_path(&self, url: &Url) -> Option<PathBuf> {
        if !is_fetchable(url) {
            return None;
        }

        let mut segments: Vec<String> = url
            .path()
            .split('/')
            .map(sanitize_segment)
            .collect();

        // Leading empty segment from the absolute path
        if segments.first().is_some_and(|s| s.is_empty()) {
            segments.remove(0);
        }

        let trailing_slash = segments.last().map_or(true, |s| s.is_empty());
        segments.retain(|s| !s.is_empty());

        if segments.iter().any(|s| s == "." || s == "..") {
            return None;
        }

        let mut path = PathBuf::new();
        match self.classify(url) {
            UrlClass::Internal => {
                for segment in &segments {
                    path.push(segment);
                }
                if segments.is_empty() || trailing_slash {
                    path.push("index.html");
                } else if path.extension().is_none() && url.query().is_none() {
                    let mut name = path.file_name()?.to_os_string();
                    name.push(".html");
                    path.set_file_name(name);
                }
            }
            UrlClass::External => {
                if !self.include_externals {
                    return None;
                }
                path.push(EXTERNAL_DIR);
                path.push(sanitize_segment(url.host_str()?));
                for segment in &segments {
                    path.push(segment);
                }
                if segments.is_empty() || trailing_slash {
                    path.push("index");
                }
            }
        }

        is_contained(&path).then_some(path)
    }

    /// Relative reference from the file at `from` to the file at `to`, both
    /// relative to the working directory, using `/` separators.
    pub fn relative_reference(from: &Path, to: &Path) -> String {
        let from_dir = from.parent().unwrap_or_else(|| Path::new(""));
        let relative = pathdiff::diff_paths(to, from_dir).unwrap_or_else(|| to.to_path_buf());

        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Replaces characters that are unsafe in file names, following the same
/// rules for every segment so references and files always agree.
pub fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() => c,
            '.' | '-' | '_' | '~' | '+' | '@' => c,
            _ => '_',
        })
        .collect()
}

fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}
