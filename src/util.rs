use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context, Result};
use url::Url;

pub fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn strip_fragment(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

/// Scheme + host + port comparison; the crawl never leaves the origin.
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

pub fn host_variants(host: &str) -> Vec<String> {
    let h = host.to_ascii_lowercase();
    if let Some(rest) = h.strip_prefix("www.") {
        vec![h.clone(), rest.to_string()]
    } else {
        vec![h.clone(), format!("www.{h}")]
    }
}

/// Extension of the last path segment, or None for directory-ish and
/// extension-less paths (`/about/`, `/robots`, `/.hidden`).
pub fn path_extension(path: &str) -> Option<&str> {
    let last = path.rsplit('/').next().unwrap_or("");
    match last.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

/// Write through a `<name>.part` sibling and rename over the target, so a
/// reader never observes a half-written body. A `.part` file orphaned by an
/// aborted run maps to no reachable URL and is swept with the next GC.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("cannot write to a parentless path: {}", path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("could not create {}", dir.display()))?;

    let mut staging = path.as_os_str().to_os_string();
    staging.push(".part");
    let staging = PathBuf::from(staging);

    fs::write(&staging, bytes)
        .with_context(|| format!("could not stage {}", staging.display()))?;
    fs::rename(&staging, path).with_context(|| {
        format!("could not move {} over {}", staging.display(), path.display())
    })?;
    Ok(())
}
