use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use url::Url;
use website_archiver::extract::{scan_css, scan_html};
use website_archiver::optimize::minify_css;
use website_archiver::resolver::PathResolver;
use website_archiver::rewriter::Rewriter;

const PAGE: &str = r#"
    <html>
        <head>
            <link rel="stylesheet" href="/style.css">
            <script src="/script.js"></script>
            <link rel="stylesheet" href="https://cdn.example.net/theme.css">
            <script src="//cdn.example.net/utils.js"></script>
            <style>.hero { background: url('/images/hero.jpg'); }</style>
        </head>
        <body>
            <img src="/logo.png" alt="Logo" srcset="/logo.png 1x, /logo@2x.png 2x">
            <img src="/banner.jpg" alt="Banner">
            <div style="background-image: url(/images/bg.jpg)"></div>
            <a href="/about">About</a>
            <a href="/contact">Contact</a>
            <a href="/products">Products</a>
        </body>
    </html>
"#;

const STYLESHEET: &str = r#"
    @import "fonts.css";
    .bg1 { background-image: url('/images/bg1.jpg'); }
    .bg2 { background: url("/images/bg2.jpg"); }
    .bg3 { background-image: url(../images/bg3.jpg); }
    .icon { background: url(data:image/png;base64,iVBORw0KGgo=); }
    @font-face { font-family: Inter; src: url(https://cdn.example.net/inter.woff2) format("woff2"); }
"#;

fn site() -> Url {
    Url::parse("https://example.com/").unwrap()
}

fn bench_scan_html(c: &mut Criterion) {
    let base = site();
    c.bench_function("scan_html", |b| {
        b.iter(|| scan_html(black_box(PAGE), &base));
    });
}

fn bench_scan_css(c: &mut Criterion) {
    let base = Url::parse("https://example.com/css/main.css").unwrap();
    c.bench_function("scan_css", |b| {
        b.iter(|| scan_css(black_box(STYLESHEET), &base));
    });
}

fn bench_local_paths(c: &mut Criterion) {
    let resolver = PathResolver::new(&site(), true);
    let urls: Vec<Url> = [
        "https://example.com/",
        "https://example.com/about",
        "https://example.com/images/photo.jpg?v=3",
        "https://example.com/path%20with%20spaces/file.css",
        "https://cdn.example.net/lib/jquery.min.js",
        "https://example.com/docs/",
    ]
    .iter()
    .map(|u| Url::parse(u).unwrap())
    .collect();

    c.bench_function("to_local_path", |b| {
        b.iter(|| {
            for url in &urls {
                black_box(resolver.to_local_path(url));
            }
        });
    });
}

fn bench_rewrite(c: &mut Criterion) {
    let rewriter = Rewriter::new(PathResolver::new(&site(), true));
    let existing: HashSet<PathBuf> = [
        "style.css",
        "script.js",
        "logo.png",
        "logo@2x.png",
        "banner.jpg",
        "images/hero.jpg",
        "images/bg.jpg",
        "images/bg1.jpg",
        "images/bg2.jpg",
        "external-assets/cdn.example.net/theme.css",
        "external-assets/cdn.example.net/utils.js",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();

    c.bench_function("rewrite_html", |b| {
        b.iter(|| rewriter.rewrite_html(black_box(PAGE), Path::new("index.html"), &existing));
    });

    c.bench_function("rewrite_css", |b| {
        b.iter(|| rewriter.rewrite_css(black_box(STYLESHEET), Path::new("css/main.css"), &existing));
    });
}

fn bench_minify_css(c: &mut Criterion) {
    c.bench_function("minify_css", |b| {
        b.iter(|| minify_css(black_box(STYLESHEET)));
    });
}

criterion_group!(
    benches,
    bench_scan_html,
    bench_scan_css,
    bench_local_paths,
    bench_rewrite,
    bench_minify_css
);
criterion_main!(benches);
