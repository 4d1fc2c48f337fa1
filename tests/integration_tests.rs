use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;
use url::Url;
use website_archiver::extract::scan_html;
use website_archiver::job::JobEvent;
use website_archiver::resolver::PathResolver;
use website_archiver::rewriter::Rewriter;
use website_archiver::site_tree::list_files;
use website_archiver::{
    ArchiverConfig, CloneError, CloneOptions, CloneService, ExtractedPage, JobStatus, ResourceExtractor,
    WebCloner,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(dir: &Path) -> ArchiverConfig {
    let mut config = ArchiverConfig::default();
    config.cloning.render = false;
    config.cloning.timeout_secs = 5;
    config.cloning.retry_attempts = 2;
    config.cloning.retry_base_delay_ms = 5;
    config.storage.storage_dir = dir.join("storage");
    config.storage.temp_dir = Some(dir.join("work"));
    config
}

async fn serve(server: &MockServer, route: &str, mime: &str, body: impl Into<Vec<u8>>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.into(), mime))
        .mount(server)
        .await;
}

/// Every entry of a ZIP archive, by name.
fn read_archive(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut zip = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut entries = BTreeMap::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).unwrap();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        entries.insert(entry.name().to_string(), content);
    }
    entries
}

fn text(entries: &BTreeMap<String, Vec<u8>>, name: &str) -> String {
    String::from_utf8(entries[name].clone()).unwrap()
}

fn names(entries: &BTreeMap<String, Vec<u8>>) -> Vec<&str> {
    entries.keys().map(String::as_str).collect()
}

fn leftover_working_dirs(dir: &TempDir) -> usize {
    match std::fs::read_dir(dir.path().join("work")) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn test_clone_site_with_external_script() {
    let site = MockServer::start().await;
    let cdn = MockServer::start().await;

    let index = format!(
        r#"<html><head><link rel="stylesheet" href="/style.css"><script src="{}/a.js"></script></head><body><h1>Hello</h1></body></html>"#,
        cdn.uri()
    );
    serve(&site, "/", "text/html", index).await;
    serve(&site, "/style.css", "text/css", "body { background: url(logo.png); }").await;
    serve(&site, "/logo.png", "image/png", b"not really a png".to_vec()).await;
    serve(&cdn, "/a.js", "application/javascript", "console.log('a');").await;

    let dir = tempdir().unwrap();
    let cloner = WebCloner::new(test_config(dir.path()), CloneOptions::default());
    let report = cloner.run(&format!("{}/", site.uri())).await.unwrap();

    assert_eq!(report.strategy, "static");
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.counters.downloaded, 3);
    assert_eq!(report.counters.total, 2);
    assert!(report.archive_path.starts_with(dir.path().join("storage")));
    assert!(report
        .archive_path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("127.0.0.1-"));

    let entries = read_archive(&report.archive_path);
    assert_eq!(
        names(&entries),
        vec!["external-assets/127.0.0.1/a.js", "index.html", "logo.png", "style.css"]
    );

    let html = text(&entries, "index.html");
    assert!(html.contains(r#"href="style.css""#), "{html}");
    assert!(html.contains(r#"src="external-assets/127.0.0.1/a.js""#), "{html}");
    assert!(!html.contains("http://"), "{html}");

    let css = text(&entries, "style.css");
    assert!(css.contains("logo.png"));
    assert!(!css.contains("http://"));

    assert_eq!(leftover_working_dirs(&dir), 0);
}

#[tokio::test]
async fn test_failed_resource_is_recorded_and_skipped() {
    let site = MockServer::start().await;
    serve(
        &site,
        "/",
        "text/html",
        r#"<html><body><img src="/a.png"><img src="/b.png"><img src="/missing.png"></body></html>"#,
    )
    .await;
    serve(&site, "/a.png", "image/png", b"a".to_vec()).await;
    serve(&site, "/b.png", "image/png", b"b".to_vec()).await;
    Mock::given(method("GET"))
        .and(path("/missing.png"))
        .respond_with(ResponseTemplate::new(404))
        // retry_attempts = 2
        .expect(2)
        .mount(&site)
        .await;

    let dir = tempdir().unwrap();
    let cloner = WebCloner::new(test_config(dir.path()), CloneOptions::default());
    let report = cloner.run(&format!("{}/", site.uri())).await.unwrap();

    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].url.ends_with("/missing.png"));
    assert_eq!(report.counters.errors, 1);
    assert_eq!(report.counters.downloaded, 2);

    let entries = read_archive(&report.archive_path);
    assert_eq!(names(&entries), vec!["a.png", "b.png", "index.html"]);

    // The broken reference stays as written.
    let html = text(&entries, "index.html");
    assert!(html.contains(r#"src="/missing.png""#), "{html}");
    assert!(html.contains(r#"src="a.png""#), "{html}");
}

#[tokio::test]
async fn test_shared_resource_fetched_once() {
    let site = MockServer::start().await;
    serve(
        &site,
        "/",
        "text/html",
        r#"<html><head>
            <link rel="stylesheet" href="/theme.css">
            <style>.hero { background: url('/dup.png'); }</style>
        </head><body>
            <img src="/dup.png" srcset="/dup.png 2x">
            <div style="background-image: url(/dup.png)"></div>
            <img src="/dup.png?v=2">
        </body></html>"#,
    )
    .await;
    serve(&site, "/theme.css", "text/css", ".logo { background: url(dup.png); }").await;
    Mock::given(method("GET"))
        .and(path("/dup.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"dup".to_vec(), "image/png"))
        .expect(1)
        .mount(&site)
        .await;

    let dir = tempdir().unwrap();
    let cloner = WebCloner::new(test_config(dir.path()), CloneOptions::default());
    let report = cloner.run(&format!("{}/", site.uri())).await.unwrap();

    assert!(report.errors.is_empty(), "{:?}", report.errors);
    let entries = read_archive(&report.archive_path);
    assert_eq!(names(&entries), vec!["dup.png", "index.html", "theme.css"]);
    assert_eq!(entries["dup.png"], b"dup");
}

#[tokio::test]
async fn test_size_cap_skips_large_resource() {
    let site = MockServer::start().await;
    serve(
        &site,
        "/",
        "text/html",
        r#"<html><body><img src="/big.png"><img src="/small.png"></body></html>"#,
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/big.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0u8; 50_000], "image/png"))
        .expect(1)
        .mount(&site)
        .await;
    serve(&site, "/small.png", "image/png", vec![1u8; 64]).await;

    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.cloning.max_total_size = 4_096;
    config.cloning.concurrency = 1;
    let cloner = WebCloner::new(config, CloneOptions::default());
    let report = cloner.run(&format!("{}/", site.uri())).await.unwrap();

    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].url.ends_with("/big.png"));
    assert!(report.errors[0].message.contains("4096"), "{}", report.errors[0].message);

    let entries = read_archive(&report.archive_path);
    assert_eq!(names(&entries), vec!["index.html", "small.png"]);
}

#[tokio::test]
async fn test_unreachable_seed_fails_job() {
    let site = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&site)
        .await;

    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cloner = WebCloner::new(test_config(dir.path()), CloneOptions::default()).with_events(tx);
    let err = cloner.run(&format!("{}/", site.uri())).await.unwrap_err();
    drop(cloner);

    assert!(matches!(err, CloneError::SeedUnreachable { .. }), "{err}");

    let mut events: Vec<JobEvent> = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let last = events.last().unwrap();
    assert_eq!(last.status, JobStatus::Failed);
    assert!(last.error.as_deref().unwrap().contains("503"));
    assert!(last.archive_path.is_none());

    assert_eq!(leftover_working_dirs(&dir), 0);
    let archives = std::fs::read_dir(dir.path().join("storage")).map(|d| d.count()).unwrap_or(0);
    assert_eq!(archives, 0);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_ends_done() {
    let site = MockServer::start().await;
    let imgs: String = (0..6).map(|i| format!(r#"<img src="/img{i}.png">"#)).collect();
    serve(&site, "/", "text/html", format!("<html><body>{imgs}</body></html>")).await;
    for i in 0..6 {
        serve(&site, &format!("/img{i}.png"), "image/png", vec![i as u8; 16]).await;
    }

    let dir = tempdir().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cloner = WebCloner::new(test_config(dir.path()), CloneOptions::default()).with_events(tx);
    let report = cloner.run(&format!("{}/", site.uri())).await.unwrap();
    drop(cloner);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let percents: Vec<u8> = events.iter().map(|e| e.percent).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");

    let stages: Vec<JobStatus> = events.iter().map(|e| e.status).collect();
    for status in [
        JobStatus::FetchingSeed,
        JobStatus::Extracting,
        JobStatus::Downloading,
        JobStatus::Rewriting,
        JobStatus::Archiving,
    ] {
        assert!(stages.contains(&status), "missing {status}");
    }

    let last = events.last().unwrap();
    assert_eq!(last.status, JobStatus::Done);
    assert_eq!(last.percent, 100);
    assert_eq!(last.counters.downloaded, 6);
    assert_eq!(last.archive_path.as_deref(), Some(report.archive_path.as_path()));
}

#[tokio::test]
async fn test_mobile_version_sends_mobile_user_agent() {
    let site = MockServer::start().await;
    let config = test_config(Path::new("/unused"));
    Mock::given(method("GET"))
        .and(path("/"))
        .and(header("user-agent", config.cloning.mobile_user_agent.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html><body>m</body></html>", "text/html"))
        .expect(1)
        .mount(&site)
        .await;

    let dir = tempdir().unwrap();
    let options = CloneOptions {
        mobile_version: true,
        ..CloneOptions::default()
    };
    let cloner = WebCloner::new(test_config(dir.path()), options);
    let report = cloner.run(&format!("{}/", site.uri())).await.unwrap();

    let entries = read_archive(&report.archive_path);
    assert_eq!(names(&entries), vec!["index.html"]);
}

#[tokio::test]
async fn test_simple_download_keeps_files_untouched() {
    let site = MockServer::start().await;
    let css = "body {\n    color: red;\n}\n\n/* keep me */\n";
    serve(
        &site,
        "/",
        "text/html",
        r#"<html><head><link rel="stylesheet" href="site.css"></head></html>"#,
    )
    .await;
    serve(&site, "/site.css", "text/css", css).await;

    let dir = tempdir().unwrap();
    let options = CloneOptions {
        simple_download: true,
        ..CloneOptions::default()
    };
    let cloner = WebCloner::new(test_config(dir.path()), options);
    let report = cloner.run(&format!("{}/", site.uri())).await.unwrap();

    assert_eq!(report.counters.optimized, 0);
    let entries = read_archive(&report.archive_path);
    assert_eq!(text(&entries, "site.css"), css);
}

#[tokio::test]
async fn test_save_structure_follows_internal_links() {
    let site = MockServer::start().await;
    serve(
        &site,
        "/",
        "text/html",
        r#"<html><body><a href="/about">About</a><a href="https://elsewhere.example/">Out</a></body></html>"#,
    )
    .await;
    serve(
        &site,
        "/about",
        "text/html",
        r#"<html><head><link rel="stylesheet" href="/about.css"></head><body><a href="/">Home</a></body></html>"#,
    )
    .await;
    serve(&site, "/about.css", "text/css", "p { margin: 0 }").await;

    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.cloning.max_depth = 2;
    let options = CloneOptions {
        save_structure: true,
        ..CloneOptions::default()
    };
    let cloner = WebCloner::new(config, options);
    let report = cloner.run(&format!("{}/", site.uri())).await.unwrap();

    assert_eq!(report.pages, 2);
    let entries = read_archive(&report.archive_path);
    assert_eq!(names(&entries), vec!["about.css", "about.html", "index.html"]);

    let index = text(&entries, "index.html");
    assert!(index.contains(r#"href="about.html""#), "{index}");
    assert!(index.contains(r#"href="https://elsewhere.example/""#), "{index}");
    let about = text(&entries, "about.html");
    assert!(about.contains(r#"href="about.css""#), "{about}");
    assert!(about.contains(r#"href="index.html""#), "{about}");
}

#[tokio::test]
async fn test_rewritten_archive_is_stable() {
    let site = MockServer::start().await;
    serve(
        &site,
        "/",
        "text/html",
        r#"<html><head><link rel="stylesheet" href="/css/main.css"></head><body><img src="/img/a.png#top"></body></html>"#,
    )
    .await;
    serve(&site, "/css/main.css", "text/css", "body { background: url(/img/a.png) }").await;
    serve(&site, "/img/a.png", "image/png", b"a".to_vec()).await;

    let dir = tempdir().unwrap();
    let cloner = WebCloner::new(test_config(dir.path()), CloneOptions::default());
    let report = cloner.run(&format!("{}/", site.uri())).await.unwrap();
    let entries = read_archive(&report.archive_path);

    assert!(text(&entries, "css/main.css").contains("../img/a.png"));
    assert!(text(&entries, "index.html").contains(r#"src="img/a.png#top""#));

    // Unpack and run the rewriter again: nothing may change.
    let unpacked = tempdir().unwrap();
    for (name, content) in &entries {
        let target: PathBuf = unpacked.path().join(name);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, content).unwrap();
    }
    let site_url = Url::parse(&format!("{}/", site.uri())).unwrap();
    let rewriter = Rewriter::new(PathResolver::new(&site_url, true));
    let files = list_files(unpacked.path()).unwrap();
    assert!(rewriter.rewrite_tree(unpacked.path(), &files).is_empty());

    for (name, content) in &entries {
        assert_eq!(&std::fs::read(unpacked.path().join(name)).unwrap(), content, "{name} changed");
    }
}

#[tokio::test]
async fn test_service_job_lifecycle() {
    let site = MockServer::start().await;
    serve(
        &site,
        "/",
        "text/html",
        r#"<html><body><img src="/logo.png"></body></html>"#,
    )
    .await;
    serve(&site, "/logo.png", "image/png", b"logo".to_vec()).await;

    let dir = tempdir().unwrap();
    let service = CloneService::new(test_config(dir.path())).unwrap();
    let id = service
        .start_clone(&format!("{}/", site.uri()), CloneOptions::default())
        .unwrap();

    let mut job = service.progress(&id).unwrap();
    for _ in 0..200 {
        if job.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        job = service.progress(&id).unwrap();
    }

    assert_eq!(job.status, JobStatus::Done, "{:?}", job.error_message);
    assert_eq!(job.progress_percent, 100);
    assert_eq!(job.counters.downloaded, 1);
    assert!(job.finished_at.is_some());

    let archive = service.archive(&id).unwrap();
    assert!(archive.is_file());
    assert_eq!(names(&read_archive(&archive)), vec!["index.html", "logo.png"]);

    assert_eq!(service.mark_delivered(&id).await.unwrap(), 1);
    assert_eq!(service.downloads_count().await, 1);

    // The history line is written once the job task wraps up.
    let history_path = dir.path().join("storage").join("clones.log");
    let mut history = String::new();
    for _ in 0..100 {
        history = std::fs::read_to_string(&history_path).unwrap_or_default();
        if !history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(history.contains("success"), "{history}");
    assert!(history.contains(&site.uri()), "{history}");
}

/// Stands in for the browser: serves a fixed DOM and screenshot.
struct FixedRender {
    html: String,
}

#[async_trait]
impl ResourceExtractor for FixedRender {
    fn name(&self) -> &'static str {
        "rendered"
    }

    async fn extract(&self, url: &Url) -> website_archiver::Result<ExtractedPage> {
        let refs = scan_html(&self.html, url);
        Ok(ExtractedPage {
            url: url.clone(),
            html: self.html.clone(),
            resources: refs.resources,
            links: BTreeSet::new(),
            screenshot: Some(b"\x89PNG fake".to_vec()),
            strategy: self.name(),
        })
    }
}

#[tokio::test]
async fn test_injected_extractor_and_screenshot() {
    let site = MockServer::start().await;
    serve(&site, "/app.js", "application/javascript", "window.app = 1;").await;

    let dir = tempdir().unwrap();
    let extractor = Arc::new(FixedRender {
        html: r#"<html><body><div id="root"></div><script src="/app.js"></script></body></html>"#.to_string(),
    });
    let cloner = WebCloner::new(test_config(dir.path()), CloneOptions::default()).with_extractor(extractor);
    let report = cloner.run(&format!("{}/", site.uri())).await.unwrap();

    assert_eq!(report.strategy, "rendered");
    let entries = read_archive(&report.archive_path);
    assert_eq!(names(&entries), vec!["app.js", "index.html", "screenshot.png"]);
    assert!(text(&entries, "index.html").contains(r#"src="app.js""#));
}

#[tokio::test]
async fn test_rendered_seed_counts_against_size_cap() {
    let site = MockServer::start().await;
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.cloning.max_total_size = 64;

    let extractor = Arc::new(FixedRender {
        html: format!("<html><body>{}</body></html>", "x".repeat(200)),
    });
    let cloner = WebCloner::new(config, CloneOptions::default()).with_extractor(extractor);
    let err = cloner.run(&format!("{}/", site.uri())).await.unwrap_err();

    assert!(matches!(err, CloneError::SizeLimit { limit: 64, .. }), "{err}");
    assert_eq!(leftover_working_dirs(&dir), 0);
}

#[tokio::test]
async fn test_max_files_caps_stylesheet_children() {
    let site = MockServer::start().await;
    serve(
        &site,
        "/",
        "text/html",
        r#"<html><head><link rel="stylesheet" href="/s.css"></head><body></body></html>"#,
    )
    .await;
    serve(
        &site,
        "/s.css",
        "text/css",
        ".a { background: url(a.png) } .b { background: url(b.png) } .c { background: url(c.png) }",
    )
    .await;
    for image in ["/a.png", "/b.png", "/c.png"] {
        Mock::given(method("GET"))
            .and(path(image))
            .respond_with(ResponseTemplate::new(200).set_body_raw(b"png".to_vec(), "image/png"))
            .expect(0)
            .mount(&site)
            .await;
    }

    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.cloning.max_files = 1;
    let cloner = WebCloner::new(config, CloneOptions::default());
    let report = cloner.run(&format!("{}/", site.uri())).await.unwrap();

    assert_eq!(report.counters.downloaded, 1);
    let entries = read_archive(&report.archive_path);
    assert_eq!(names(&entries), vec!["index.html", "s.css"]);
}

#[tokio::test]
async fn test_relative_links_between_crawled_pages() {
    let site = MockServer::start().await;
    serve(
        &site,
        "/",
        "text/html",
        r#"<html><head><base href="/"></head><body><a href="docs/">Docs</a></body></html>"#,
    )
    .await;
    serve(
        &site,
        "/docs/",
        "text/html",
        r#"<html><body><a href="guide">Guide</a><a href="../">Home</a><img src="pic.png"></body></html>"#,
    )
    .await;
    serve(&site, "/docs/guide", "text/html", "<html><body>guide</body></html>").await;
    serve(&site, "/docs/pic.png", "image/png", b"pic".to_vec()).await;

    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.cloning.max_depth = 3;
    let options = CloneOptions {
        save_structure: true,
        ..CloneOptions::default()
    };
    let cloner = WebCloner::new(config, options);
    let report = cloner.run(&format!("{}/", site.uri())).await.unwrap();

    let entries = read_archive(&report.archive_path);
    assert_eq!(
        names(&entries),
        vec!["docs/guide.html", "docs/index.html", "docs/pic.png", "index.html"]
    );

    let index = text(&entries, "index.html");
    assert!(!index.contains("<base href"), "{index}");
    assert!(index.contains(r#"href="docs/index.html""#), "{index}");
    let docs = text(&entries, "docs/index.html");
    assert!(docs.contains(r#"href="guide.html""#), "{docs}");
    assert!(docs.contains(r#"href="../index.html""#), "{docs}");
    assert!(docs.contains(r#"src="pic.png""#), "{docs}");
}
