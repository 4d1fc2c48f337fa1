//! Post-download transforms: image recompression and CSS/JS minification.
//!
//! Every transform either replaces the file with a complete new version or
//! leaves it untouched. Callers treat errors as warnings.

use crate::config::CloningConfig;
use crate::error::{CloneError, Result};
use crate::store::sibling_temp_path;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageEncoder, ImageFormat};
use mime::Mime;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Css,
    Script,
    Other,
}

impl AssetKind {
    /// Classifies by content type, falling back to the file extension.
    pub fn detect(content_type: Option<&Mime>, path: &Path) -> Self {
        if let Some(mime) = content_type {
            let subtype = mime.subtype().as_str();
            if mime.type_() == mime::IMAGE {
                return AssetKind::Image;
            }
            if mime.type_() == mime::TEXT && subtype == "css" {
                return AssetKind::Css;
            }
            if matches!(subtype, "javascript" | "x-javascript" | "ecmascript") {
                return AssetKind::Script;
            }
        }

        let guessed = mime_guess::from_path(path).first();
        match guessed {
            Some(m) if m.type_() == mime::IMAGE => AssetKind::Image,
            Some(m) if m.subtype() == "css" => AssetKind::Css,
            Some(m) if m.subtype() == "javascript" => AssetKind::Script,
            _ => AssetKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OptimizeSettings {
    pub optimize_images: bool,
    pub minify_code: bool,
    pub image_quality: u8,
    pub max_width: u32,
    pub max_height: u32,
}

impl OptimizeSettings {
    pub fn from_config(config: &CloningConfig) -> Self {
        Self {
            optimize_images: config.optimize_images,
            minify_code: config.minify_code,
            image_quality: config.image_quality,
            max_width: config.image_max_width,
            max_height: config.image_max_height,
        }
    }

    pub fn disabled() -> Self {
        Self {
            optimize_images: false,
            minify_code: false,
            image_quality: 85,
            max_width: 1920,
            max_height: 1080,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    settings: OptimizeSettings,
}

impl Optimizer {
    pub fn new(settings: OptimizeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &OptimizeSettings {
        &self.settings
    }

    /// Applies the transform matching `kind`. Returns true if the file was
    /// replaced with an optimized version.
    pub async fn process(&self, path: &Path, kind: AssetKind) -> Result<bool> {
        match kind {
            AssetKind::Image if self.settings.optimize_images => {
                let settings = self.settings;
                let path = path.to_path_buf();
                tokio::task::spawn_blocking(move || optimize_image(&path, &settings))
                    .await
                    .map_err(|e| CloneError::Task(e.to_string()))?
            }
            AssetKind::Css if self.settings.minify_code => {
                self.rewrite_text(path, minify_css).await
            }
            AssetKind::Script if self.settings.minify_code => {
                self.rewrite_text(path, minify_js).await
            }
            _ => Ok(false),
        }
    }

    async fn rewrite_text(&self, path: &Path, transform: fn(&str) -> String) -> Result<bool> {
        let bytes = tokio::fs::read(path).await?;
        let Ok(text) = String::from_utf8(bytes) else {
            return Ok(false);
        };

        let minified = transform(&text);
        if minified.len() >= text.len() {
            return Ok(false);
        }

        replace_file(path, minified.as_bytes()).await?;
        Ok(true)
    }
}

async fn replace_file(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = sibling_temp_path(path);
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Shrinks oversized images to fit the configured box and re-encodes them.
/// The result is kept only if it is smaller than the original.
fn optimize_image(path: &Path, settings: &OptimizeSettings) -> Result<bool> {
    let original = std::fs::read(path)?;
    let format = match image::guess_format(&original) {
        Ok(f @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP)) => f,
        _ => return Ok(false),
    };

    let img = image::load_from_memory_with_format(&original, format).map_err(|e| {
        CloneError::PostProcess {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    })?;

    let img = if img.width() > settings.max_width || img.height() > settings.max_height {
        img.resize(settings.max_width, settings.max_height, FilterType::Lanczos3)
    } else {
        img
    };

    let encoded = encode(&img, format, settings.image_quality).map_err(|message| {
        CloneError::PostProcess {
            path: path.to_path_buf(),
            message,
        }
    })?;

    if encoded.len() >= original.len() {
        return Ok(false);
    }

    let tmp = sibling_temp_path(path);
    std::fs::write(&tmp, &encoded)?;
    std::fs::rename(&tmp, path)?;
    Ok(true)
}

fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> std::result::Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut buffer, quality)
                .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
                .map_err(|e| e.to_string())?;
        }
        ImageFormat::Png => {
            PngEncoder::new_with_quality(&mut buffer, CompressionType::Best, PngFilter::Adaptive)
                .write_image(img.as_bytes(), img.width(), img.height(), img.color())
                .map_err(|e| e.to_string())?;
        }
        ImageFormat::WebP => {
            let encoder = webp::Encoder::from_image(img).map_err(|e| e.to_string())?;
            buffer.extend_from_slice(&encoder.encode(quality as f32));
        }
        other => return Err(format!("unsupported format {:?}", other)),
    }
    Ok(buffer)
}

/// Characters that need no surrounding whitespace.
fn is_tight(c: char) -> bool {
    matches!(c, '{' | '}' | ';' | ',' | '>')
}

/// Strips comments and redundant whitespace from a stylesheet.
///
/// Quoted strings and `url(...)` bodies are copied byte for byte.
pub fn minify_css(css: &str) -> String {
    let chars: Vec<char> = css.chars().collect();
    let mut out = String::with_capacity(css.len());
    let mut pending_space = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i = comment_end(&chars, i + 2);
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            i += 1;
            continue;
        }
        if is_tight(c) {
            if c == '}' && out.ends_with(';') {
                out.pop();
            }
            out.push(c);
            pending_space = false;
            i += 1;
            continue;
        }

        if pending_space && !out.is_empty() && !out.ends_with(is_tight) {
            out.push(' ');
        }
        pending_space = false;

        let end = if c == '"' || c == '\'' {
            string_end(&chars, i)
        } else if starts_url(&chars, i) {
            url_end(&chars, i + 4)
        } else {
            i + 1
        };
        out.extend(&chars[i..end]);
        i = end;
    }

    out
}

/// Index just past the `*/` closing a comment body that starts at `from`.
fn comment_end(chars: &[char], from: usize) -> usize {
    let mut j = from;
    while j + 1 < chars.len() {
        if chars[j] == '*' && chars[j + 1] == '/' {
            return j + 2;
        }
        j += 1;
    }
    chars.len()
}

/// Index just past the string opened by the quote at `start`.
fn string_end(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut j = start + 1;
    while j < chars.len() {
        match chars[j] {
            '\\' => j += 2,
            c if c == quote => return j + 1,
            // An unterminated string ends at the line break.
            '\n' => return j,
            _ => j += 1,
        }
    }
    chars.len()
}

fn starts_url(chars: &[char], i: usize) -> bool {
    let Some(head) = chars.get(i..i + 4) else {
        return false;
    };
    let is_url = head.iter().collect::<String>().eq_ignore_ascii_case("url(");
    let boundary = i == 0 || !matches!(chars[i - 1], c if c.is_alphanumeric() || c == '-' || c == '_');
    is_url && boundary
}

/// Index just past the `)` closing a `url(` whose body starts at `from`.
fn url_end(chars: &[char], from: usize) -> usize {
    let mut j = from;
    while j < chars.len() {
        match chars[j] {
            '"' | '\'' => j = string_end(chars, j),
            '\\' => j += 2,
            ')' => return j + 1,
            _ => j += 1,
        }
    }
    chars.len()
}

/// Drops blank lines and trailing whitespace.
///
/// Only a template literal can carry line breaks inside a JS string, so a
/// script containing a backtick is returned unchanged.
pub fn minify_js(js: &str) -> String {
    if js.contains('`') {
        return js.to_string();
    }
    js.lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
