//! Points saved HTML and CSS at the local copies of their resources.
//!
//! Every reference is resolved against the URL its file was saved from (or
//! the page's `<base href>`) and mapped through the [`PathResolver`]. When
//! the mapped file exists in the tree the reference becomes a
//! document-relative path; everything else is left untouched. A relative
//! path written by this pass resolves back to the same file, so a second
//! pass changes nothing.

use crate::extract::static_html::{css_import_re, css_url_re, srcset_urls, REFERENCE_ATTRS, SRCSET_ATTRS};
use crate::job::ErrorRecord;
use crate::resolver::{is_fetchable, PathResolver, EXTERNAL_DIR};
use crate::site_tree::{FileKind, SavedFile};
use crate::store::sibling_temp_path;
use html5ever::serialize::{SerializeOpts, TraversalScope};
use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::{parse_document, serialize, ParseOpts};
use markup5ever_rcdom::{Handle, NodeData, RcDom, SerializableHandle};
use regex::{Captures, Regex};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use url::Url;

/// Per-file rewriting context.
struct Target<'a> {
    /// The file being rewritten, relative to the tree root
    file: &'a Path,
    /// URL references resolve against
    base: Url,
    existing: &'a HashSet<PathBuf>,
    /// Set once a `<base>` was dropped: references that stay online must
    /// become absolute to keep pointing where they did.
    absolutize: bool,
}

#[derive(Debug, Clone)]
pub struct Rewriter {
    resolver: PathResolver,
}

impl Rewriter {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    /// Rewrites every HTML and CSS file in `files`. Failures are returned
    /// per file and never stop the pass.
    pub fn rewrite_tree(&self, root: &Path, files: &[SavedFile]) -> Vec<ErrorRecord> {
        let existing: HashSet<PathBuf> = files.iter().map(|f| f.relative.clone()).collect();
        let mut errors = Vec::new();

        for file in files.iter().filter(|f| f.kind != FileKind::Other) {
            match self.rewrite_file(root, file, &existing) {
                Ok(true) => debug!(file = ?file.relative, "rewrote references"),
                Ok(false) => {}
                Err(e) => {
                    warn!(file = ?file.relative, error = %e, "rewrite failed, file left as saved");
                    errors.push(ErrorRecord {
                        url: file.relative.to_string_lossy().into_owned(),
                        message: format!("rewrite failed: {e}"),
                    });
                }
            }
        }

        errors
    }

    fn rewrite_file(&self, root: &Path, file: &SavedFile, existing: &HashSet<PathBuf>) -> io::Result<bool> {
        let path = root.join(&file.relative);
        let Ok(content) = String::from_utf8(fs::read(&path)?) else {
            return Ok(false);
        };

        let rewritten = match file.kind {
            FileKind::Html => self.rewrite_html(&content, &file.relative, existing)?,
            FileKind::Css => self.rewrite_css(&content, &file.relative, existing),
            FileKind::Other => None,
        };

        match rewritten {
            Some(updated) => {
                let tmp = sibling_temp_path(&path);
                fs::write(&tmp, updated.as_bytes())?;
                fs::rename(&tmp, &path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns the rewritten document, or `None` when no reference changed.
    pub fn rewrite_html(
        &self,
        html: &str,
        file: &Path,
        existing: &HashSet<PathBuf>,
    ) -> io::Result<Option<String>> {
        let dom = parse_document(RcDom::default(), ParseOpts::default()).one(html);
        let mut target = self.target(file, existing);

        let mut changed = false;
        if let Some(href) = take_base_href(&dom.document) {
            changed = true;
            if let Ok(base) = target.base.join(href.trim()) {
                target.base = base;
                target.absolutize = true;
            }
        }

        self.rewrite_node(&dom.document, &target, &mut changed);
        if !changed {
            return Ok(None);
        }

        let mut out = Vec::new();
        let document: SerializableHandle = dom.document.clone().into();
        serialize(
            &mut out,
            &document,
            SerializeOpts {
                traversal_scope: TraversalScope::ChildrenOnly(None),
                ..Default::default()
            },
        )?;

        String::from_utf8(out)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Returns the rewritten stylesheet, or `None` when nothing changed.
    pub fn rewrite_css(&self, css: &str, file: &Path, existing: &HashSet<PathBuf>) -> Option<String> {
        let target = self.target(file, existing);
        self.rewrite_css_text(css, &target)
    }

    fn target<'a>(&self, file: &'a Path, existing: &'a HashSet<PathBuf>) -> Target<'a> {
        Target {
            file,
            base: self.document_url(file),
            existing,
            absolutize: false,
        }
    }

    /// The URL a saved file stands for. Files under
    /// `external-assets/<host>/` belong to that host; everything else belongs
    /// to the site.
    fn document_url(&self, file: &Path) -> Url {
        let parts: Vec<String> = file
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();

        if parts.len() > 2 && parts[0] == EXTERNAL_DIR {
            let external = Url::parse(&format!("https://{}/", parts[1]))
                .and_then(|host| host.join(&parts[2..].join("/")));
            if let Ok(url) = external {
                return url;
            }
        }

        let site = self.resolver.site();
        site.join(&format!("/{}", parts.join("/")))
            .unwrap_or_else(|_| site.clone())
    }

    fn rewrite_node(&self, handle: &Handle, target: &Target, changed: &mut bool) {
        if let NodeData::Element { name, attrs, .. } = &handle.data {
            for attr in attrs.borrow_mut().iter_mut() {
                let key: &str = &attr.name.local;
                let replacement = if REFERENCE_ATTRS.contains(&key) {
                    self.localize(&attr.value, target)
                } else if SRCSET_ATTRS.contains(&key) {
                    self.rewrite_srcset(&attr.value, target)
                } else if key == "style" {
                    self.rewrite_css_text(&attr.value, target)
                } else {
                    None
                };

                if let Some(value) = replacement {
                    attr.value = StrTendril::from(value);
                    *changed = true;
                }
            }

            if &*name.local == "style" {
                for child in handle.children.borrow().iter() {
                    if let NodeData::Text { contents } = &child.data {
                        let rewritten = self.rewrite_css_text(&contents.borrow(), target);
                        if let Some(css) = rewritten {
                            *contents.borrow_mut() = StrTendril::from(css);
                            *changed = true;
                        }
                    }
                }
            }
        }

        for child in handle.children.borrow().iter() {
            self.rewrite_node(child, target, changed);
        }
    }

    fn rewrite_srcset(&self, srcset: &str, target: &Target) -> Option<String> {
        let mut changed = false;
        let candidates: Vec<String> = srcset
            .split(',')
            .filter(|c| !c.trim().is_empty())
            .map(|candidate| {
                let candidate = candidate.trim();
                let Some(url) = srcset_urls(candidate).next() else {
                    return candidate.to_string();
                };
                match self.localize(url, target) {
                    Some(local) => {
                        changed = true;
                        format!("{}{}", local, &candidate[url.len()..])
                    }
                    None => candidate.to_string(),
                }
            })
            .collect();

        changed.then(|| candidates.join(", "))
    }

    fn rewrite_css_text(&self, css: &str, target: &Target) -> Option<String> {
        let mut changed = false;
        let mut pass = |re: &Regex, input: &str, group: usize| -> String {
            re.replace_all(input, |cap: &Captures| {
                let whole = &cap[0];
                match cap.get(group).and_then(|m| self.localize(m.as_str(), target).map(|l| (m, l))) {
                    Some((m, local)) => {
                        changed = true;
                        let start = m.start() - cap.get(0).map_or(0, |w| w.start());
                        format!("{}{}{}", &whole[..start], local, &whole[start + m.as_str().len()..])
                    }
                    None => whole.to_string(),
                }
            })
            .into_owned()
        };

        let urls_done = pass(css_url_re(), css, 2);
        let imports_done = pass(css_import_re(), &urls_done, 1);
        changed.then_some(imports_done)
    }

    /// Replacement for `raw`: the relative path of its local copy, or its
    /// absolute URL once a `<base>` was dropped. `None` when nothing changes.
    fn localize(&self, raw: &str, target: &Target) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            return None;
        }

        let resolved = target.base.join(raw).ok()?;
        if !is_fetchable(&resolved) {
            return None;
        }

        let local = self
            .resolver
            .to_local_path(&resolved)
            .filter(|local| target.existing.contains(local));
        let reference = match local {
            Some(local) => {
                let mut reference = PathResolver::relative_reference(target.file, &local);
                if let Some(fragment) = resolved.fragment() {
                    reference.push('#');
                    reference.push_str(fragment);
                }
                reference
            }
            None if target.absolutize => resolved.to_string(),
            None => return None,
        };

        (reference != raw).then_some(reference)
    }
}

/// Removes the `href` of the first `<base>` element and returns it.
fn take_base_href(handle: &Handle) -> Option<String> {
    if let NodeData::Element { name, attrs, .. } = &handle.data {
        if &*name.local == "base" {
            let mut attrs = attrs.borrow_mut();
            if let Some(pos) = attrs.iter().position(|a| &*a.name.local == "href") {
                return Some(attrs.remove(pos).value.to_string());
            }
        }
    }
    handle.children.borrow().iter().find_map(take_base_href)
}
