use std::collections::{HashSet, VecDeque};
use std::io::Read;

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::fetch;
use crate::util::same_origin;

/// One sitemap document: page locs plus the child sitemaps it delegates to.
#[derive(Debug, Default)]
pub(crate) struct SitemapDoc {
    pub pages: Vec<Url>,
    pub children: Vec<Url>,
}

/// Harvest the origin's sitemap tree into entry-seed URLs.
///
/// The seed anchors reachability even for pages the site no longer links,
/// so a temporarily unlinked post survives GC as long as the sitemap still
/// lists it.
pub async fn harvest_entry_urls(client: &Client, origin: &Url, max_bytes: usize) -> Result<Vec<Url>> {
    let start = origin
        .join("sitemap.xml")
        .with_context(|| format!("failed to build sitemap URL for {origin}"))?;

    let mut out = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut pending: VecDeque<Url> = VecDeque::new();
    pending.push_back(start);

    while let Some(sm_url) = pending.pop_front() {
        if !visited.insert(sm_url.as_str().to_string()) {
            continue;
        }

        let (status, body) = match fetch::fetch_limited(client, sm_url.clone(), max_bytes).await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %sm_url, error = %e, "sitemap fetch failed, skipping");
                continue;
            }
        };
        if !status.is_success() {
            debug!(url = %sm_url, status = status.as_u16(), "sitemap not available");
            continue;
        }

        let xml = decompress(body)?;
        let doc = match parse(&xml) {
            Ok(d) => d,
            Err(e) => {
                warn!(url = %sm_url, error = %e, "sitemap parse failed, skipping");
                continue;
            }
        };

        out.extend(doc.pages.into_iter().filter(|u| same_origin(u, origin)));
        pending.extend(doc.children.into_iter().filter(|u| same_origin(u, origin)));
    }

    Ok(out)
}

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Some origins serve `.xml.gz` children; anything else passes through.
fn decompress(body: Vec<u8>) -> Result<Vec<u8>> {
    if !body.starts_with(&GZIP_MAGIC) {
        return Ok(body);
    }
    let mut xml = Vec::new();
    GzDecoder::new(body.as_slice())
        .read_to_end(&mut xml)
        .context("gzipped sitemap did not decompress")?;
    Ok(xml)
}

/// Pull the `loc` values out of a `<urlset>` or `<sitemapindex>` document.
///
/// A loc is a child sitemap when it sits inside a `<sitemap>` entry, and
/// also whenever it carries the `sitemap-` token: Ghost names its
/// per-section children `sitemap-<section>.xml` and some themes list them
/// in a flat urlset.
pub(crate) fn parse(bytes: &[u8]) -> Result<SitemapDoc> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut doc = SitemapDoc::default();
    let mut buf = Vec::new();
    let mut in_sitemap_entry = false;
    let mut capture: Option<String> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| anyhow!("invalid sitemap XML: {e}"))?;
        match event {
            Event::Start(tag) => match tag.local_name().as_ref() {
                b"sitemap" => in_sitemap_entry = true,
                b"loc" => capture = Some(String::new()),
                _ => {}
            },
            Event::Text(text) => {
                if let Some(loc) = capture.as_mut() {
                    loc.push_str(&text.unescape().unwrap_or_default());
                }
            }
            Event::End(tag) => match tag.local_name().as_ref() {
                b"sitemap" => in_sitemap_entry = false,
                b"loc" => {
                    if let Some(loc) = capture.take() {
                        let loc = loc.trim();
                        if let Ok(url) = Url::parse(loc) {
                            if in_sitemap_entry || loc.contains("sitemap-") {
                                doc.children.push(url);
                            } else {
                                doc.pages.push(url);
                            }
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(doc)
}
