use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{anyhow, Result};
use regex::Regex;
use url::Url;

use crate::{
    config::MirrorConfig,
    util::{self, path_extension, same_origin, strip_fragment},
};

/// Bidirectional mapping between origin URLs and paths under the output
/// root. `url_to_path` is total over normalized same-origin URLs;
/// `path_to_url` is partial and rejects files the crawl does not own
/// (hidden files, extension-less deploy files, the ignored list).
#[derive(Debug)]
pub struct PathPolicy {
    origin: Url,
    root: PathBuf,
    raw_prefixes: Vec<String>,
    ignored: Vec<String>,
}

fn version_file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+)\.([0-9a-f]+)\.([A-Za-z0-9]+)$").unwrap())
}

impl PathPolicy {
    pub fn new(config: &MirrorConfig) -> Self {
        let raw_prefixes = config
            .raw_prefixes
            .iter()
            .map(|p| format!("/{}", p.trim_matches('/')) + "/")
            .collect();
        Self {
            origin: config.origin.clone(),
            root: config.dest.clone(),
            raw_prefixes,
            ignored: config.gc_ignored.clone(),
        }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn in_raw_subtree(&self, path: &str) -> bool {
        self.raw_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Canonical URL key used across the crawler, graph and validator:
    /// fragment dropped, `/index.html` folded into its directory, and
    /// extension-less paths outside the raw subtrees given a trailing slash.
    pub fn normalize(&self, url: &Url) -> Url {
        let mut u = strip_fragment(url.clone());

        let path = u.path().to_string();
        if let Some(stripped) = path.strip_suffix("/index.html") {
            if stripped.is_empty() {
                u.set_path("/");
            } else {
                u.set_path(&format!("{stripped}/"));
            }
        }

        let path = u.path().to_string();
        if !path.ends_with('/')
            && path_extension(&path).is_none()
            && !self.in_raw_subtree(&path)
        {
            u.set_path(&format!("{path}/"));
        }

        u
    }

    /// Where a URL's body lives on disk. Total and injective over the URLs
    /// `normalize` produces.
    pub fn url_to_path(&self, url: &Url) -> Result<PathBuf> {
        if !same_origin(url, &self.origin) {
            return Err(anyhow!("URL is not under the mirrored origin: {url}"));
        }
        let u = self.normalize(url);
        let path = u.path();

        let rel = if path == "/" {
            "index.html".to_string()
        } else if path.ends_with('/') {
            format!("{}index.html", &path[1..])
        } else {
            let mut rel = path[1..].to_string();
            // A `?v=<token>` cache-buster is folded into the filename;
            // applies to real files only, never a synthesized index.html.
            if let Some(token) = u
                .query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.to_string())
            {
                if let Some(ext) = path_extension(&rel).map(|e| e.to_string()) {
                    let stem = &rel[..rel.len() - ext.len() - 1];
                    rel = format!("{stem}.{token}.{ext}");
                }
            }
            rel
        };

        Ok(self.root.join(rel))
    }

    /// Partial inverse of `url_to_path`. Returns None for files outside the
    /// policy: hidden files and directories, files with no extension
    /// (`CNAME`), and anything on the ignored list — those are owned by the
    /// deploy post-processors, never by the GC.
    pub fn path_to_url(&self, path: &Path) -> Option<Url> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let segments: Vec<&str> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        if segments.is_empty() || segments.iter().any(|s| s.starts_with('.')) {
            return None;
        }

        let rel_str = segments.join("/");
        for ig in &self.ignored {
            if rel_str == *ig || rel_str.starts_with(&format!("{ig}/")) {
                return None;
            }
        }

        let file = *segments.last().expect("non-empty segments");
        let dir = &segments[..segments.len() - 1];

        if file == "index.html" {
            let mut url_path = String::from("/");
            if !dir.is_empty() {
                url_path.push_str(&dir.join("/"));
                url_path.push('/');
            }
            let mut u = self.origin.clone();
            u.set_path(&url_path);
            return Some(u);
        }

        // Extension-less files are only ours inside the raw subtrees; at the
        // top level they are deploy artifacts (CNAME and friends).
        if path_extension(file).is_none() && !self.in_raw_subtree(&format!("/{rel_str}")) {
            return None;
        }

        if let Some(caps) = version_file_regex().captures(file) {
            let base = caps.get(1).expect("base").as_str();
            let token = caps.get(2).expect("token").as_str();
            let ext = caps.get(3).expect("ext").as_str();
            let mut url_path = String::from("/");
            if !dir.is_empty() {
                url_path.push_str(&dir.join("/"));
                url_path.push('/');
            }
            url_path.push_str(&format!("{base}.{ext}"));
            let mut u = self.origin.clone();
            u.set_path(&url_path);
            u.set_query(Some(&format!("v={token}")));
            return Some(u);
        }

        let mut u = self.origin.clone();
        u.set_path(&format!("/{rel_str}"));
        Some(u)
    }

    pub fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        util::write_atomic(path, bytes)
    }
}
