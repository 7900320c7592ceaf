//! End-to-end runs against a controllable HTTP origin.

use std::fs;
use std::path::Path;

use gssg::{
    config::MirrorConfig,
    crawler::{CrawlReport, Crawler},
    graph::LinkGraph,
    validator::ValidatorCache,
};
use mockito::{Matcher, Server};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use url::Url;

fn test_config(origin: &str, root: &Path) -> MirrorConfig {
    let mut cfg = MirrorConfig::new(Url::parse(origin).unwrap()).unwrap();
    cfg.dest = root.join("static");
    cfg.cache_dir = root.join("cache");
    cfg.assets = Vec::new();
    cfg.not_found_allowlist = Vec::new();
    cfg.use_sitemap = false;
    cfg.concurrency = 4;
    cfg
}

async fn run(cfg: &MirrorConfig) -> CrawlReport {
    Crawler::new(cfg.clone()).unwrap().run().await.unwrap()
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn cold_run_builds_tree_then_warm_run_transfers_nothing() {
    let mut server = Server::new_async().await;
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&server.url(), tmp.path());
    let origin = cfg.origin.clone();

    // Cold origin: only unconditional requests are answered with bodies.
    let _root = server
        .mock("GET", "/")
        .match_header("if-none-match", Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_header("etag", "\"root-v1\"")
        .with_body(r#"<html><body><a href="/a/">a</a><link rel="stylesheet" href="/style.css?v=abc123"></body></html>"#)
        .create_async()
        .await;
    let _a = server
        .mock("GET", "/a/")
        .match_header("if-none-match", Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_header("etag", "\"a-v1\"")
        .with_body("<html><body>about</body></html>")
        .create_async()
        .await;
    let _css = server
        .mock("GET", "/style.css")
        .match_query(Matcher::UrlEncoded("v".into(), "abc123".into()))
        .match_header("if-none-match", Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "text/css")
        .with_header("etag", "\"css-v1\"")
        .with_body("body { color: #111; }")
        .create_async()
        .await;

    let report = run(&cfg).await;
    assert_eq!(report.errors.len(), 0, "unexpected errors: {:?}", report.errors);
    assert_eq!(report.fetched, 3);
    assert_eq!(report.not_modified, 0);

    assert!(cfg.dest.join("index.html").is_file());
    assert!(cfg.dest.join("a/index.html").is_file());
    assert!(cfg.dest.join("style.abc123.css").is_file());

    let graph = LinkGraph::load(cfg.graph_path());
    assert_eq!(graph.len(), 3);
    let root_node = graph.node(origin.as_str()).unwrap();
    assert_eq!(root_node.hyperlinks, vec![format!("{origin}a/")]);
    assert_eq!(root_node.resources, vec![format!("{origin}style.css?v=abc123")]);

    let manifest_before = fs::read(cfg.validator_path()).unwrap();
    let nodes_before: Vec<String> = graph.urls().map(|s| s.to_string()).collect();

    // Warm origin: every conditional request validates.
    let _root_304 = server
        .mock("GET", "/")
        .match_header("if-none-match", "\"root-v1\"")
        .with_status(304)
        .create_async()
        .await;
    let _a_304 = server
        .mock("GET", "/a/")
        .match_header("if-none-match", "\"a-v1\"")
        .with_status(304)
        .create_async()
        .await;
    let _css_304 = server
        .mock("GET", "/style.css")
        .match_query(Matcher::UrlEncoded("v".into(), "abc123".into()))
        .match_header("if-none-match", "\"css-v1\"")
        .with_status(304)
        .create_async()
        .await;

    let report = run(&cfg).await;
    assert_eq!(report.errors.len(), 0, "unexpected errors: {:?}", report.errors);
    assert_eq!(report.fetched, 0);
    assert_eq!(report.not_modified, 3);
    assert_eq!(report.deleted, 0);

    // The validator cache is byte-identical and the graph carried forward.
    assert_eq!(fs::read(cfg.validator_path()).unwrap(), manifest_before);
    let graph_after = LinkGraph::load(cfg.graph_path());
    let nodes_after: Vec<String> = graph_after.urls().map(|s| s.to_string()).collect();
    assert_eq!(nodes_after, nodes_before);
    for url in &nodes_before {
        assert_eq!(graph_after.node(url), graph.node(url));
    }
}

#[tokio::test]
async fn sitemap_listing_protects_a_page_the_site_stopped_linking() {
    let mut server = Server::new_async().await;
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&server.url(), tmp.path());
    cfg.use_sitemap = true;
    let origin = cfg.origin.clone();

    let _sitemap = server
        .mock("GET", "/sitemap.xml")
        .with_status(200)
        .with_header("content-type", "application/xml")
        .with_body(format!(
            r#"<?xml version="1.0"?><urlset><url><loc>{origin}a/</loc></url></urlset>"#
        ))
        .create_async()
        .await;
    let _root = server
        .mock("GET", "/")
        .match_header("if-none-match", Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_header("etag", "\"root-v1\"")
        .with_body(r#"<html><body><a href="/a/">a</a></body></html>"#)
        .create_async()
        .await;
    let _a = server
        .mock("GET", "/a/")
        .match_header("if-none-match", Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_header("etag", "\"a-v1\"")
        .with_body("<html><body>kept</body></html>")
        .create_async()
        .await;

    let report = run(&cfg).await;
    assert_eq!(report.errors.len(), 0, "unexpected errors: {:?}", report.errors);
    assert!(cfg.dest.join("a/index.html").is_file());

    // The site drops the link; the sitemap still lists the page.
    let _root_changed = server
        .mock("GET", "/")
        .match_header("if-none-match", "\"root-v1\"")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_header("etag", "\"root-v2\"")
        .with_body("<html><body>no links anymore</body></html>")
        .create_async()
        .await;
    let _a_304 = server
        .mock("GET", "/a/")
        .match_header("if-none-match", "\"a-v1\"")
        .with_status(304)
        .create_async()
        .await;

    let report = run(&cfg).await;
    assert_eq!(report.errors.len(), 0, "unexpected errors: {:?}", report.errors);
    assert_eq!(report.fetched, 1);
    assert_eq!(report.not_modified, 1);
    assert_eq!(report.deleted, 0);
    assert!(cfg.dest.join("a/index.html").is_file(), "sitemap entry must survive GC");
}

#[tokio::test]
async fn orphaned_files_are_collected_and_deploy_artifacts_kept() {
    let mut server = Server::new_async().await;
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&server.url(), tmp.path());

    let _root = server
        .mock("GET", "/")
        .match_header("if-none-match", Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_header("etag", "\"root-v1\"")
        .with_body("<html><body>plain</body></html>")
        .create_async()
        .await;

    let report = run(&cfg).await;
    assert_eq!(report.errors.len(), 0, "unexpected errors: {:?}", report.errors);

    // An operator drops a stray file; a post-processor owns CNAME.
    fs::create_dir_all(cfg.dest.join("ghost")).unwrap();
    fs::write(cfg.dest.join("ghost/index.html"), "<html></html>").unwrap();
    fs::write(cfg.dest.join("CNAME"), "blog.example.com\n").unwrap();

    let _root_304 = server
        .mock("GET", "/")
        .match_header("if-none-match", "\"root-v1\"")
        .with_status(304)
        .create_async()
        .await;

    let report = run(&cfg).await;
    assert_eq!(report.errors.len(), 0, "unexpected errors: {:?}", report.errors);
    assert_eq!(report.deleted, 1);
    assert!(!cfg.dest.join("ghost/index.html").exists());
    assert!(!cfg.dest.join("ghost").exists(), "emptied directory must be pruned");
    assert!(cfg.dest.join("CNAME").is_file(), "ignored paths are never deleted");
    assert!(cfg.dest.join("index.html").is_file());
}

#[tokio::test]
async fn missing_file_behind_a_valid_304_is_refetched_once() {
    let mut server = Server::new_async().await;
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&server.url(), tmp.path());
    let origin = cfg.origin.clone();

    let _root = server
        .mock("GET", "/")
        .match_header("if-none-match", Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_header("etag", "\"root-v1\"")
        .with_body(r#"<html><body><a href="/about/">about</a></body></html>"#)
        .create_async()
        .await;
    let about_cold = server
        .mock("GET", "/about/")
        .match_header("if-none-match", Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_header("etag", "\"about-v1\"")
        .with_body("<html><body>about v1</body></html>")
        .create_async()
        .await;

    let report = run(&cfg).await;
    assert_eq!(report.errors.len(), 0, "unexpected errors: {:?}", report.errors);
    assert!(cfg.dest.join("about/index.html").is_file());

    // The operator deletes the file; the origin still answers 304 to the
    // cached validator, but the unconditional retry gets a fresh body.
    fs::remove_file(cfg.dest.join("about/index.html")).unwrap();
    about_cold.remove_async().await;

    let _root_304 = server
        .mock("GET", "/")
        .match_header("if-none-match", "\"root-v1\"")
        .with_status(304)
        .create_async()
        .await;
    let _about_304 = server
        .mock("GET", "/about/")
        .match_header("if-none-match", "\"about-v1\"")
        .with_status(304)
        .create_async()
        .await;
    let _about_fresh = server
        .mock("GET", "/about/")
        .match_header("if-none-match", Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_header("etag", "\"about-v2\"")
        .with_body("<html><body>about v2</body></html>")
        .create_async()
        .await;

    let report = run(&cfg).await;
    assert_eq!(report.errors.len(), 0, "unexpected errors: {:?}", report.errors);
    assert_eq!(report.fetched, 1);
    assert_eq!(report.not_modified, 1);
    assert_eq!(read(&cfg.dest.join("about/index.html")), "<html><body>about v2</body></html>");

    let validator = ValidatorCache::load(cfg.validator_path());
    let entry = validator.entry(&format!("{origin}about/")).unwrap();
    assert_eq!(entry.etag.as_deref(), Some("\"about-v2\""));
}

#[tokio::test]
async fn video_subresources_pull_their_generated_thumbnail() {
    let mut server = Server::new_async().await;
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&server.url(), tmp.path());
    let origin = cfg.origin.clone();

    let _root = server
        .mock("GET", "/")
        .match_header("if-none-match", Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_header("etag", "\"root-v1\"")
        .with_body(r#"<html><body><video src="/content/media/clip.mp4"></video></body></html>"#)
        .create_async()
        .await;
    let _clip = server
        .mock("GET", "/content/media/clip.mp4")
        .with_status(200)
        .with_header("content-type", "video/mp4")
        .with_body("mp4-bytes")
        .create_async()
        .await;
    let _thumb = server
        .mock("GET", "/content/media/clip_thumb.jpg")
        .with_status(200)
        .with_header("content-type", "image/jpeg")
        .with_body("jpeg-bytes")
        .create_async()
        .await;

    let report = run(&cfg).await;
    assert_eq!(report.errors.len(), 0, "unexpected errors: {:?}", report.errors);
    assert_eq!(report.fetched, 3);

    assert!(cfg.dest.join("content/media/clip.mp4").is_file());
    assert!(cfg.dest.join("content/media/clip_thumb.jpg").is_file());

    let graph = LinkGraph::load(cfg.graph_path());
    let root_node = graph.node(origin.as_str()).unwrap();
    assert_eq!(
        root_node.resources,
        vec![
            format!("{origin}content/media/clip.mp4"),
            format!("{origin}content/media/clip_thumb.jpg"),
        ]
    );
}

#[tokio::test]
async fn missing_pages_are_collected_unless_allowlisted() {
    let mut server = Server::new_async().await;
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&server.url(), tmp.path());
    cfg.not_found_allowlist = vec!["/favicon.ico".to_string()];
    cfg.assets = vec!["/favicon.ico".to_string()];

    let _root = server
        .mock("GET", "/")
        .match_header("if-none-match", Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(r#"<html><body><a href="/vanished/">gone</a></body></html>"#)
        .create_async()
        .await;
    let _vanished = server
        .mock("GET", "/vanished/")
        .with_status(404)
        .create_async()
        .await;
    let _favicon = server
        .mock("GET", "/favicon.ico")
        .with_status(404)
        .create_async()
        .await;

    let report = run(&cfg).await;
    assert_eq!(report.errors.len(), 1);
    let err = &report.errors[0];
    assert_eq!(err.status, 404);
    assert!(err.url.ends_with("/vanished/"));
    assert!(err.referrer.is_some(), "404s carry the referring page");
    assert!(report.failed());
}
