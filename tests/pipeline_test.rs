//! End-to-end tests for the import pipeline against mocked archive and CMS servers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tempfile::TempDir;
use wayback_importer::config::Config;
use wayback_importer::db::{get_page, Database, PageRecord, PageStatus};
use wayback_importer::importer::Pipeline;
use wiremock::matchers::{method, path, path_regex, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake-image-bytes";

const HOME_HTML: &str = r#"<html><head><title>Home | Example</title>
<meta name="description" content="The home page"></head>
<body>
<div id="wm-ipp-base">Wayback toolbar</div>
<article>
  <h1>Home</h1>
  <p>Read more <a href="/web/20240615000000/https://example.com/about">about us</a>.</p>
  <img src="/web/20240615000000im_/https://example.com/img/logo.png" alt="Logo">
</article>
</body></html>"#;

const ABOUT_HTML: &str = r#"<html><head><title>About</title></head>
<body><main>
  <h1>About</h1>
  <p>Back <a href="https://example.com/home/">home</a> or <a href="https://elsewhere.org/">away</a>.</p>
</main></body></html>"#;

const GALLERY_HTML: &str = r#"<html><body><article>
  <h1>Gallery</h1>
  <p>Holiday photos.</p>
  <aside><img src="/web/20240615000000im_/https://example.com/img/related.png" alt="Related"></aside>
  <img src="/web/20240615000000im_/https://example.com/img/missing.png" alt="Missing">
  <img src="/web/20240615000000im_/https://example.com/img/photo.png" alt="Photo">
  <img src="https://example.com/img/photo.png" alt="Photo again">
</article></body></html>"#;

/// A minimal stateful stand-in for the WordPress REST API.
#[derive(Clone, Default)]
struct FakeCms {
    state: Arc<Mutex<CmsState>>,
    reject_credentials: bool,
    /// Draft creation for this slug answers 500.
    broken_slug: Option<&'static str>,
    /// Reading the draft with this slug answers 500.
    unreadable_slug: Option<&'static str>,
    broken_uploads: bool,
}

#[derive(Default)]
struct CmsState {
    next_id: i64,
    posts: BTreeMap<i64, Value>,
    uploads: Vec<String>,
    writes: usize,
    server_errors: usize,
}

impl FakeCms {
    fn rejecting() -> Self {
        Self {
            reject_credentials: true,
            ..Self::default()
        }
    }

    fn server_errors(&self) -> usize {
        self.state.lock().unwrap().server_errors
    }

    fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    fn posts(&self) -> Vec<Value> {
        self.state.lock().unwrap().posts.values().cloned().collect()
    }

    fn post_by_slug(&self, slug: &str) -> Value {
        self.posts()
            .into_iter()
            .find(|p| p["slug"] == slug)
            .unwrap_or_else(|| panic!("no post with slug {slug}"))
    }

    fn uploads(&self) -> Vec<String> {
        self.state.lock().unwrap().uploads.clone()
    }
}

impl Respond for FakeCms {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if self.reject_credentials || !request.headers.contains_key("authorization") {
            return ResponseTemplate::new(401).set_body_json(json!({
                "code": "rest_not_logged_in",
                "message": "You are not currently logged in."
            }));
        }

        let mut state = self.state.lock().unwrap();
        let path = request.url.path().trim_start_matches("/wp-json/wp/v2/");
        let post_id = path
            .strip_prefix("posts/")
            .and_then(|id| id.parse::<i64>().ok());

        let server_error = ResponseTemplate::new(500).set_body_json(json!({
            "code": "internal_server_error",
            "message": "There has been a critical error on this website."
        }));

        match (request.method.as_str(), path, post_id) {
            ("POST", "media", _) if self.broken_uploads => {
                state.server_errors += 1;
                server_error
            }
            ("POST", "media", _) => {
                state.next_id += 1;
                state.writes += 1;
                let id = state.next_id;
                state
                    .uploads
                    .push(String::from_utf8_lossy(&request.body).into_owned());
                ResponseTemplate::new(201).set_body_json(json!({
                    "id": id,
                    "source_url": format!("https://cms/media/{id}.png"),
                }))
            }
            ("POST", "posts", _) => {
                let mut post: Value = serde_json::from_slice(&request.body).unwrap();
                if self.broken_slug.is_some_and(|slug| post["slug"] == slug) {
                    state.server_errors += 1;
                    return server_error;
                }
                state.next_id += 1;
                state.writes += 1;
                let id = state.next_id;
                let link = format!("https://cms/{}-draft", post["slug"].as_str().unwrap());
                post["id"] = json!(id);
                post["link"] = json!(link);
                state.posts.insert(id, post);
                ResponseTemplate::new(201).set_body_json(json!({ "id": id, "link": link }))
            }
            ("GET", _, Some(id)) => {
                let Some(post) = state.posts.get(&id).cloned() else {
                    return ResponseTemplate::new(404);
                };
                if self.unreadable_slug.is_some_and(|slug| post["slug"] == slug) {
                    state.server_errors += 1;
                    return server_error;
                }
                ResponseTemplate::new(200).set_body_json(json!({
                    "id": id,
                    "content": { "raw": post["content"], "rendered": post["content"] },
                }))
            }
            ("POST", _, Some(id)) => {
                let update: Value = serde_json::from_slice(&request.body).unwrap();
                state.writes += 1;
                match state.posts.get_mut(&id) {
                    Some(post) => {
                        post["content"] = update["content"].clone();
                        ResponseTemplate::new(200).set_body_json(json!({ "id": id }))
                    }
                    None => ResponseTemplate::new(404),
                }
            }
            _ => ResponseTemplate::new(404),
        }
    }
}

struct Harness {
    archive: MockServer,
    _cms_server: MockServer,
    cms: FakeCms,
    db: Database,
    config: Config,
    _temp_dir: TempDir,
}

impl Harness {
    async fn new(cms: FakeCms) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.sqlite");
        let db = Database::new(&db_path)
            .await
            .expect("Failed to create database");

        let archive = MockServer::start().await;
        let cms_server = MockServer::start().await;
        Mock::given(path_regex(r"^/wp-json/wp/v2/"))
            .respond_with(cms.clone())
            .mount(&cms_server)
            .await;

        let config = Config {
            wayback_base_url: archive.uri(),
            wp_url: cms_server.uri(),
            database_path: db_path,
            ..Config::for_testing()
        };

        Self {
            archive,
            _cms_server: cms_server,
            cms,
            db,
            config,
            _temp_dir: temp_dir,
        }
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.config.clone(), self.db.clone()).expect("Failed to build pipeline")
    }

    async fn page(&self, url: &str) -> PageRecord {
        get_page(self.db.pool(), url)
            .await
            .expect("Failed to get page")
            .expect("Page not found")
    }

    async fn mount_index(&self, rows: &[(&str, &str)]) {
        let mut body = vec![json!(["urlkey", "timestamp", "original", "statuscode", "digest", "length"])];
        for (url, ts) in rows {
            body.push(json!(["key", ts, url, "200", "DIGEST", "100"]));
        }
        Mock::given(method("GET"))
            .and(path("/cdx/search/cdx"))
            .and(query_param("url", "example.com/*"))
            .and(query_param("to", "20240801"))
            .and(query_param("filter", "statuscode:200"))
            .and(query_param_is_missing("collapse"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Array(body)))
            .mount(&self.archive)
            .await;
    }

    async fn mount_capture(&self, ts: &str, url: &str, html: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/web/{ts}/{url}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(html))
            .mount(&self.archive)
            .await;
    }

    async fn mount_image(&self, url: &str, ts: Option<&str>) {
        let mut rows = vec![json!(["urlkey", "timestamp", "original", "statuscode", "digest", "length"])];
        if let Some(ts) = ts {
            rows.push(json!(["key", ts, url, "200", "DIGEST", "16"]));
            Mock::given(method("GET"))
                .and(path(format!("/web/{ts}im_/{url}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG))
                .mount(&self.archive)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/cdx/search/cdx"))
            .and(query_param("url", url))
            .and(query_param("to", "20240615000000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Array(rows)))
            .mount(&self.archive)
            .await;
    }

    /// The two-page site used by most tests.
    async fn mount_example_site(&self) {
        self.mount_index(&[
            ("https://example.com/home", "20240615000000"),
            ("https://example.com/about", "20240720000000"),
            ("https://example.com/home", "20240101000000"),
        ])
        .await;
        self.mount_capture("20240615000000", "https://example.com/home", HOME_HTML)
            .await;
        self.mount_capture("20240720000000", "https://example.com/about", ABOUT_HTML)
            .await;
    }
}

#[tokio::test]
async fn test_full_import_rewrites_cross_links() {
    let h = Harness::new(FakeCms::default()).await;
    h.mount_example_site().await;
    h.mount_image("https://example.com/img/logo.png", Some("20240601000000"))
        .await;

    let summary = h.pipeline().run("example.com").await.expect("Run failed");

    assert_eq!(summary.discovery.captures, 3);
    assert_eq!(summary.discovery.inserted, 2);
    assert_eq!(summary.publish.published, 2);
    assert_eq!(summary.publish.failed, 0);
    let rewrite = summary.rewrite.expect("rewrite pass should run");
    assert_eq!(rewrite.rewritten, 2);
    assert_eq!(summary.counts.rewritten, 2);

    let home = h.page("https://example.com/home").await;
    assert_eq!(home.status_enum(), Some(PageStatus::Rewritten));
    assert_eq!(home.snapshot_timestamp, "20240615000000");
    assert_eq!(home.new_url.as_deref(), Some("https://cms/home-draft"));
    let about = h.page("https://example.com/about").await;
    assert_eq!(about.new_url.as_deref(), Some("https://cms/about-draft"));

    let home_post = h.cms.post_by_slug("home");
    let content = home_post["content"].as_str().unwrap();
    assert!(content.contains(r#"href="https://cms/about-draft""#));
    assert!(!content.contains(r#"href="https://example.com/about""#));
    assert!(content.contains(r#"src="https://cms/media/"#));
    assert!(!content.contains("wayback-import:image/"));
    assert!(!content.contains("Wayback toolbar"));
    assert_eq!(home_post["title"], "Home");
    assert_eq!(home_post["status"], "draft");
    assert_eq!(home_post["categories"], json!([1]));
    assert_eq!(home_post["excerpt"], "The home page");
    assert!(home_post["featured_media"].is_i64());

    let about_post = h.cms.post_by_slug("about");
    let content = about_post["content"].as_str().unwrap();
    assert!(content.contains(r#"href="https://cms/home-draft""#));
    assert!(content.contains(r#"href="https://elsewhere.org/""#));
    assert!(about_post.get("featured_media").is_none());

    let uploads = h.cms.uploads();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].contains(r#"filename="logo.png""#));
    assert!(uploads[0].contains("Logo"));
}

#[tokio::test]
async fn test_rerun_makes_no_cms_writes() {
    let h = Harness::new(FakeCms::default()).await;
    h.mount_example_site().await;
    h.mount_image("https://example.com/img/logo.png", Some("20240601000000"))
        .await;

    h.pipeline().run("example.com").await.expect("First run failed");
    let writes_after_first = h.cms.writes();
    // Two drafts, one upload, two link updates.
    assert_eq!(writes_after_first, 5);

    let summary = h.pipeline().run("example.com").await.expect("Second run failed");

    assert_eq!(h.cms.writes(), writes_after_first);
    assert_eq!(h.cms.posts().len(), 2);
    assert_eq!(summary.discovery.inserted, 0);
    assert_eq!(summary.publish.candidates, 0);
    assert_eq!(summary.rewrite.map(|r| r.rewritten), Some(0));
}

#[tokio::test]
async fn test_missing_image_capture_still_publishes() {
    let h = Harness::new(FakeCms::default()).await;
    h.mount_example_site().await;
    h.mount_image("https://example.com/img/logo.png", None).await;

    let summary = h.pipeline().run("example.com").await.expect("Run failed");
    assert_eq!(summary.publish.published, 2);

    let home = h.page("https://example.com/home").await;
    assert!(home.status_enum().is_some_and(|s| s.has_draft()));

    let home_post = h.cms.post_by_slug("home");
    let content = home_post["content"].as_str().unwrap();
    assert!(!content.contains("<img"));
    assert!(content.contains("Read more"));
    assert!(home_post.get("featured_media").is_none());
    assert!(h.cms.uploads().is_empty());
}

#[tokio::test]
async fn test_transient_fetch_error_is_retried_without_duplicates() {
    let h = Harness::new(FakeCms::default()).await;
    Mock::given(method("GET"))
        .and(path("/web/20240615000000/https://example.com/home"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&h.archive)
        .await;
    h.mount_example_site().await;
    h.mount_image("https://example.com/img/logo.png", Some("20240601000000"))
        .await;

    let summary = h.pipeline().run("example.com").await.expect("Run failed");
    assert_eq!(summary.publish.published, 2);
    assert_eq!(summary.publish.failed, 0);

    let home = h.page("https://example.com/home").await;
    assert!(home.status_enum().is_some_and(|s| s.has_draft()));
    assert_eq!(
        h.cms
            .posts()
            .iter()
            .filter(|p| p["slug"] == "home")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_empty_page_fails_without_stopping_the_run() {
    let h = Harness::new(FakeCms::default()).await;
    h.mount_index(&[
        ("https://example.com/about", "20240720000000"),
        ("https://example.com/blank", "20240720000000"),
    ])
    .await;
    h.mount_capture("20240720000000", "https://example.com/about", ABOUT_HTML)
        .await;
    h.mount_capture(
        "20240720000000",
        "https://example.com/blank",
        "<html><body><script>x()</script></body></html>",
    )
    .await;

    let summary = h.pipeline().run("example.com").await.expect("Run failed");
    assert_eq!(summary.publish.published, 1);
    assert_eq!(summary.publish.failed, 1);

    let blank = h.page("https://example.com/blank").await;
    assert_eq!(blank.status_enum(), Some(PageStatus::PublishFailed));
    assert_eq!(blank.error_detail.as_deref(), Some("empty content"));
    assert!(blank.new_url.is_none());
    assert_eq!(blank.attempts, 1);
}

#[tokio::test]
async fn test_missing_capture_marks_page_failed() {
    let h = Harness::new(FakeCms::default()).await;
    h.mount_index(&[("https://example.com/gone", "20240720000000")])
        .await;

    let summary = h.pipeline().run("example.com").await.expect("Run failed");
    assert_eq!(summary.publish.failed, 1);

    let gone = h.page("https://example.com/gone").await;
    assert_eq!(gone.status_enum(), Some(PageStatus::PublishFailed));
    assert!(gone
        .error_detail
        .as_deref()
        .is_some_and(|d| d.contains("capture not found")));
    assert_eq!(h.cms.writes(), 0);
}

#[tokio::test]
async fn test_unauthorized_cms_is_fatal() {
    let h = Harness::new(FakeCms::rejecting()).await;
    h.mount_example_site().await;
    h.mount_image("https://example.com/img/logo.png", None).await;

    let err = h
        .pipeline()
        .run("example.com")
        .await
        .expect_err("Run should stop on rejected credentials");
    assert!(format!("{err:#}").contains("credentials"));

    for url in ["https://example.com/home", "https://example.com/about"] {
        let page = h.page(url).await;
        assert!(!page.status_enum().is_some_and(|s| s.has_draft()));
        assert!(page.new_url.is_none());
    }
    assert!(h.cms.posts().is_empty());
}

#[tokio::test]
async fn test_index_unavailable_persists_nothing() {
    let h = Harness::new(FakeCms::default()).await;
    Mock::given(method("GET"))
        .and(path("/cdx/search/cdx"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&h.archive)
        .await;

    let pipeline = h.pipeline();
    let err = pipeline
        .run("example.com")
        .await
        .expect_err("Discovery should fail");
    assert!(format!("{err:#}").contains("snapshot index unavailable"));

    let counts = pipeline.status_counts().await.unwrap();
    assert_eq!(counts.total(), 0);
}

#[tokio::test]
async fn test_cancelled_run_skips_rewrite() {
    let h = Harness::new(FakeCms::default()).await;
    h.mount_example_site().await;

    let pipeline = h.pipeline();
    pipeline.cancellation_token().cancel();
    let summary = pipeline.run("example.com").await.expect("Run failed");

    assert_eq!(summary.discovery.inserted, 2);
    assert_eq!(summary.publish.published, 0);
    assert!(summary.rewrite.is_none());
    assert_eq!(summary.counts.discovered, 2);
    assert_eq!(h.cms.writes(), 0);
}

#[tokio::test]
async fn test_retry_failed_resets_attempts() {
    let h = Harness::new(FakeCms::default()).await;
    h.mount_index(&[("https://example.com/gone", "20240720000000")])
        .await;

    let config = Config {
        max_publish_attempts: 1,
        ..h.config.clone()
    };
    let pipeline = Pipeline::new(config, h.db.clone()).unwrap();

    pipeline.run("example.com").await.unwrap();
    let second = pipeline.publish_pending().await.unwrap();
    assert_eq!(second.candidates, 0);

    assert_eq!(pipeline.retry_failed().await.unwrap(), 1);
    let third = pipeline.publish_pending().await.unwrap();
    assert_eq!(third.candidates, 1);
    assert_eq!(third.failed, 1);
    assert_eq!(h.page("https://example.com/gone").await.attempts, 1);
}

#[tokio::test]
async fn test_latest_capture_before_cutoff_is_imported() {
    let h = Harness::new(FakeCms::default()).await;
    // The index lists captures of a URL oldest first.
    h.mount_index(&[
        ("https://example.com/home", "20230101000000"),
        ("http://example.com/home/", "20240101000000"),
        ("https://example.com/home", "20240615000000"),
    ])
    .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/web/2023|^/web/20240101"))
        .respond_with(ResponseTemplate::new(200).set_body_string(HOME_HTML))
        .expect(0)
        .mount(&h.archive)
        .await;
    h.mount_capture("20240615000000", "https://example.com/home", HOME_HTML)
        .await;
    h.mount_image("https://example.com/img/logo.png", None).await;

    let summary = h.pipeline().run("example.com").await.expect("Run failed");
    assert_eq!(summary.discovery.captures, 3);
    assert_eq!(summary.discovery.unique, 1);
    assert_eq!(summary.publish.published, 1);

    let home = h.page("https://example.com/home").await;
    assert_eq!(home.snapshot_timestamp, "20240615000000");
    assert!(home.status_enum().is_some_and(|s| s.has_draft()));
}

#[tokio::test]
async fn test_cms_server_error_fails_page_and_run_continues() {
    let cms = FakeCms {
        broken_slug: Some("about"),
        ..FakeCms::default()
    };
    let h = Harness::new(cms).await;
    h.mount_example_site().await;
    h.mount_image("https://example.com/img/logo.png", Some("20240601000000"))
        .await;

    let summary = h.pipeline().run("example.com").await.expect("Run failed");
    assert_eq!(summary.publish.published, 1);
    assert_eq!(summary.publish.failed, 1);
    // Retried before giving up.
    assert_eq!(h.cms.server_errors(), 3);

    let about = h.page("https://example.com/about").await;
    assert_eq!(about.status_enum(), Some(PageStatus::PublishFailed));
    assert!(about.new_url.is_none());
    assert_eq!(about.attempts, 1);
    assert!(about
        .error_detail
        .as_deref()
        .is_some_and(|d| d.contains("CMS server error (500")));

    let home = h.page("https://example.com/home").await;
    assert!(home.status_enum().is_some_and(|s| s.has_draft()));
    // No mapping for the failed page, so its link is left alone.
    let content = h.cms.post_by_slug("home")["content"].clone();
    assert!(content
        .as_str()
        .unwrap()
        .contains(r#"href="https://example.com/about""#));
}

#[tokio::test]
async fn test_media_upload_error_fails_page_without_draft() {
    let cms = FakeCms {
        broken_uploads: true,
        ..FakeCms::default()
    };
    let h = Harness::new(cms).await;
    h.mount_example_site().await;
    h.mount_image("https://example.com/img/logo.png", Some("20240601000000"))
        .await;

    let summary = h.pipeline().run("example.com").await.expect("Run failed");
    assert_eq!(summary.publish.published, 1);
    assert_eq!(summary.publish.failed, 1);

    let home = h.page("https://example.com/home").await;
    assert_eq!(home.status_enum(), Some(PageStatus::PublishFailed));
    assert!(home.error_detail.is_some());
    assert!(h.cms.posts().iter().all(|p| p["slug"] != "home"));
    assert!(h.page("https://example.com/about").await.new_url.is_some());
}

#[tokio::test]
async fn test_rewrite_failure_is_recorded_and_pass_continues() {
    let cms = FakeCms {
        unreadable_slug: Some("home"),
        ..FakeCms::default()
    };
    let h = Harness::new(cms).await;
    h.mount_example_site().await;
    h.mount_image("https://example.com/img/logo.png", Some("20240601000000"))
        .await;

    let summary = h.pipeline().run("example.com").await.expect("Run failed");
    let rewrite = summary.rewrite.expect("rewrite pass should run");
    assert_eq!(rewrite.scanned, 2);
    assert_eq!(rewrite.failed, 1);
    assert_eq!(rewrite.rewritten, 1);

    let home = h.page("https://example.com/home").await;
    assert_eq!(home.status_enum(), Some(PageStatus::Published));
    assert_eq!(home.new_url.as_deref(), Some("https://cms/home-draft"));
    assert!(home
        .error_detail
        .as_deref()
        .is_some_and(|d| d.starts_with("rewrite failed")));

    let about = h.page("https://example.com/about").await;
    assert_eq!(about.status_enum(), Some(PageStatus::Rewritten));
    assert!(about.error_detail.is_none());
    let content = h.cms.post_by_slug("about")["content"].clone();
    assert!(content
        .as_str()
        .unwrap()
        .contains(r#"href="https://cms/home-draft""#));
}

#[tokio::test]
async fn test_featured_media_is_first_uploaded_image() {
    let h = Harness::new(FakeCms::default()).await;
    h.mount_index(&[("https://example.com/gallery", "20240615000000")])
        .await;
    h.mount_capture("20240615000000", "https://example.com/gallery", GALLERY_HTML)
        .await;
    h.mount_image("https://example.com/img/missing.png", None).await;
    h.mount_image("https://example.com/img/photo.png", Some("20240610000000"))
        .await;
    // Images inside removed page furniture are never looked up.
    Mock::given(method("GET"))
        .and(path("/cdx/search/cdx"))
        .and(query_param("url", "https://example.com/img/related.png"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&h.archive)
        .await;

    let summary = h.pipeline().run("example.com").await.expect("Run failed");
    assert_eq!(summary.publish.published, 1);

    // The repeated photo is uploaded once.
    let uploads = h.cms.uploads();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].contains(r#"filename="photo.png""#));

    let post = h.cms.post_by_slug("gallery");
    let featured = post["featured_media"].as_i64().expect("featured media set");
    let content = post["content"].as_str().unwrap();
    let media_src = format!(r#"src="https://cms/media/{featured}.png""#);
    assert_eq!(content.matches(&media_src).count(), 2);
    assert!(!content.contains("missing.png"));
    assert!(!content.contains("Related"));
    assert!(!content.contains("<aside"));
}
