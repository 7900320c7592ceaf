use std::{collections::HashSet, sync::OnceLock};

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use crate::{
    sitemap,
    util::{path_extension, same_origin, strip_fragment},
};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "avi", "mkv"];

/// References found in one document body. Hyperlinks and resources are
/// same-origin, deduplicated, in discovery order. Seeds only appear for
/// sitemap bodies and feed the entry set rather than graph edges.
#[derive(Debug, Default)]
pub struct Extraction {
    pub hyperlinks: Vec<Url>,
    pub resources: Vec<Url>,
    pub seeds: Vec<Url>,
}

/// Extract references from a body. Pure in the body and content type: the
/// result never depends on when during a run it is called. Returns None for
/// documents the crawler does not parse (binaries, plain text).
pub fn extract(
    body: &[u8],
    content_type: Option<&str>,
    base: &Url,
    origin: &Url,
) -> Option<Extraction> {
    let ct = content_type.map(|c| c.to_ascii_lowercase()).unwrap_or_default();
    let ext = path_extension(base.path()).map(|e| e.to_ascii_lowercase());

    if ct.contains("text/html") || ct.contains("application/xhtml+xml") {
        return Some(extract_html(&String::from_utf8_lossy(body), base, origin));
    }
    if ct.contains("text/css") || ext.as_deref() == Some("css") {
        return Some(extract_css(&String::from_utf8_lossy(body), base, origin));
    }
    if ct.contains("xml") || ext.as_deref() == Some("xml") {
        if looks_like_sitemap(body) {
            return Some(extract_sitemap(body, origin));
        }
        return None;
    }
    if content_type.is_none() && is_probably_html(body) {
        return Some(extract_html(&String::from_utf8_lossy(body), base, origin));
    }
    None
}

/// Sniff for origins that omit or garble the content type.
pub fn is_probably_html(body: &[u8]) -> bool {
    let head = &body[..body.len().min(2048)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    head.contains("<html") || head.contains("<!doctype html")
}

fn looks_like_sitemap(body: &[u8]) -> bool {
    let head = &body[..body.len().min(2048)];
    let head = String::from_utf8_lossy(head);
    head.contains("<urlset") || head.contains("<sitemapindex")
}

fn extract_html(html: &str, base: &Url, origin: &Url) -> Extraction {
    let document = Html::parse_document(html);

    let mut candidates: Vec<String> = Vec::new();
    if let Some(sel) = selector("[href], [src], [srcset]") {
        for el in document.select(&sel) {
            if in_verbatim_block(&el) {
                continue;
            }
            if let Some(href) = el.value().attr("href") {
                candidates.push(href.to_string());
            }
            if let Some(src) = el.value().attr("src") {
                candidates.push(src.to_string());
            }
            if let Some(srcset) = el.value().attr("srcset") {
                // Each comma entry is `<url> <descriptor>`; the descriptor
                // (`2x`, `640w`) is dropped.
                for entry in srcset.split(',') {
                    if let Some(u) = entry.split_whitespace().next() {
                        candidates.push(u.to_string());
                    }
                }
            }
        }
    }

    let mut out = Extraction::default();
    let mut seen: HashSet<String> = HashSet::new();
    for raw in candidates {
        let Some(abs) = resolve_candidate(base, &raw) else {
            continue;
        };
        if !same_origin(&abs, origin) {
            continue;
        }
        if !seen.insert(abs.as_str().to_string()) {
            continue;
        }
        if is_hyperlink(&abs) {
            out.hyperlinks.push(abs);
        } else {
            push_resource(&mut out.resources, &mut seen, abs);
        }
    }

    out
}

/// Tutorial markup quotes URLs inside `pre`/`code`/`textarea`; those are
/// content, not references.
fn in_verbatim_block(el: &ElementRef) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| matches!(a.value().name(), "pre" | "code" | "textarea"))
}

fn extract_css(css: &str, base: &Url, origin: &Url) -> Extraction {
    let mut out = Extraction::default();
    let mut seen: HashSet<String> = HashSet::new();

    for caps in css_url_regex().captures_iter(css) {
        let raw = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if raw.to_ascii_lowercase().starts_with("data:") {
            continue;
        }
        let Some(abs) = resolve_candidate(base, raw) else {
            continue;
        };
        if !same_origin(&abs, origin) {
            continue;
        }
        if seen.insert(abs.as_str().to_string()) {
            push_resource(&mut out.resources, &mut seen, abs);
        }
    }

    out
}

fn extract_sitemap(body: &[u8], origin: &Url) -> Extraction {
    let mut out = Extraction::default();
    let doc = match sitemap::parse(body) {
        Ok(d) => d,
        Err(e) => {
            debug!(error = %e, "malformed sitemap body, no seeds extracted");
            return out;
        }
    };
    let mut seen: HashSet<String> = HashSet::new();
    for u in doc.pages.into_iter().chain(doc.children) {
        if same_origin(&u, origin) && seen.insert(u.as_str().to_string()) {
            out.seeds.push(u);
        }
    }
    out
}

/// Push a subresource; a recognised video additionally contributes the
/// CMS's auto-generated poster image, which no HTML ever links.
fn push_resource(resources: &mut Vec<Url>, seen: &mut HashSet<String>, url: Url) {
    let thumb = video_thumb_url(&url);
    resources.push(url);
    if let Some(t) = thumb {
        if seen.insert(t.as_str().to_string()) {
            resources.push(t);
        }
    }
}

fn video_thumb_url(url: &Url) -> Option<Url> {
    let path = url.path();
    let ext = path_extension(path)?;
    if !VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        return None;
    }
    let stem = &path[..path.len() - ext.len() - 1];
    let mut thumb = url.clone();
    thumb.set_path(&format!("{stem}_thumb.jpg"));
    thumb.set_query(None);
    Some(thumb)
}

fn resolve_candidate(base: &Url, raw: &str) -> Option<Url> {
    let t = raw.trim();
    if t.is_empty() || t.starts_with('#') {
        return None;
    }
    let lower = t.to_ascii_lowercase();
    for scheme in ["mailto:", "tel:", "javascript:", "data:"] {
        if lower.starts_with(scheme) {
            return None;
        }
    }

    let abs = if let Ok(u) = Url::parse(t) {
        u
    } else {
        base.join(t).ok()?
    };
    let abs = strip_fragment(abs);

    match abs.scheme() {
        "http" | "https" => Some(abs),
        _ => None,
    }
}

/// Extension-less and `.html` destinations are hyperlinks; everything with
/// another extension is a subresource.
fn is_hyperlink(url: &Url) -> bool {
    match path_extension(url.path()) {
        None => true,
        Some(ext) => ext.eq_ignore_ascii_case("html"),
    }
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

fn css_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).unwrap())
}
