use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::fetch::HttpOptions;

/// URL path prefixes whose files are mirrored verbatim, with no synthetic
/// `index.html` for extension-less names.
pub const DEFAULT_RAW_PREFIXES: &[&str] = &["content/files/", "content/media/", "content/images/"];

/// Relative paths under the output root that the GC must never delete.
/// These are deploy artifacts written outside the crawl (GitHub Pages
/// config, the post-processed 404 page).
pub const DEFAULT_GC_IGNORED: &[&str] = &["CNAME", "404.html", ".nojekyll"];

/// Assets registered into the entry seed alongside the root URL. Ghost does
/// not link these from page HTML, but a complete mirror needs them.
pub const DEFAULT_ASSETS: &[&str] = &[
    "/robots.txt",
    "/favicon.ico",
    "/sitemap.xml",
    "/public/ghost.css",
    "/public/404-ghost.png",
    "/public/404-ghost@2x.png",
];

/// 404s on these URL substrings are dropped instead of recorded; not every
/// blog ships the optional Ghost assets.
pub const DEFAULT_NOT_FOUND_ALLOWLIST: &[&str] = &["/public/404-ghost", "/favicon.ico"];

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Source origin; scheme, host and port are preserved verbatim.
    pub origin: Url,
    /// Output root for the mirrored tree.
    pub dest: PathBuf,
    /// Directory holding `manifest.json` and `graph.json`.
    pub cache_dir: PathBuf,
    /// Concurrent in-flight fetches.
    pub concurrency: usize,
    /// Seed the crawl from `<origin>/sitemap.xml`.
    pub use_sitemap: bool,
    pub http: HttpOptions,
    /// URL path prefixes saved without `index.html` synthesis.
    pub raw_prefixes: Vec<String>,
    /// Relative paths the GC skips.
    pub gc_ignored: Vec<String>,
    /// Explicit URL paths added to the entry seed.
    pub assets: Vec<String>,
    /// Substring patterns whose 404s are not errors.
    pub not_found_allowlist: Vec<String>,
    /// Validator entries older than this are expired at the end of a run.
    pub retention_days: i64,
    /// Carried for the deploy post-processors; the core does not rewrite.
    pub production_domain: Option<Url>,
}

impl MirrorConfig {
    pub fn new(origin: Url) -> Result<Self> {
        if origin.host_str().is_none() {
            return Err(anyhow!("origin URL has no host: {origin}"));
        }
        // The origin is an authority, not a page; the root page is derived
        // from it at crawl time.
        let origin = origin
            .join("/")
            .with_context(|| format!("failed to normalize origin: {origin}"))?;

        Ok(Self {
            origin,
            dest: PathBuf::from("static"),
            cache_dir: PathBuf::from(".gssg-cache"),
            concurrency: 10,
            use_sitemap: true,
            http: HttpOptions::default(),
            raw_prefixes: DEFAULT_RAW_PREFIXES.iter().map(|s| s.to_string()).collect(),
            gc_ignored: DEFAULT_GC_IGNORED.iter().map(|s| s.to_string()).collect(),
            assets: DEFAULT_ASSETS.iter().map(|s| s.to_string()).collect(),
            not_found_allowlist: DEFAULT_NOT_FOUND_ALLOWLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            retention_days: 30,
            production_domain: None,
        })
    }

    pub fn validator_path(&self) -> PathBuf {
        self.cache_dir.join("manifest.json")
    }

    pub fn graph_path(&self) -> PathBuf {
        self.cache_dir.join("graph.json")
    }
}
