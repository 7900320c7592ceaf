use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::{header, redirect, Client, Response, StatusCode};
use url::Url;

use crate::{
    error::FetchError,
    util::{host_variants, path_extension},
    validator::ValidatorCache,
};

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub user_agent: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            user_agent: format!("gssg/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

/// A 200 response worth keeping.
#[derive(Debug)]
pub struct FetchedBody {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Classification of one GET. `Transport` covers DNS, TCP, TLS and timeout
/// failures and is reported with HTTP status 0.
#[derive(Debug)]
pub enum FetchOutcome {
    NotModified,
    Ok(FetchedBody),
    Gone,
    OtherStatus(u16),
    Transport(String),
}

/// Conditional HTTP fetcher. Knows the validator cache but nothing about
/// files on disk; persistence belongs to the crawler.
pub struct Fetcher {
    client: Client,
    validator: Arc<Mutex<ValidatorCache>>,
    max_body_bytes: usize,
}

impl Fetcher {
    pub fn new(
        opts: &HttpOptions,
        origin: &Url,
        validator: Arc<Mutex<ValidatorCache>>,
    ) -> Result<Self> {
        let allowed_hosts: HashSet<String> = origin
            .host_str()
            .map(|h| host_variants(h).into_iter().collect())
            .unwrap_or_default();
        let client = build_client(opts, allowed_hosts)?;
        Ok(Self {
            client,
            validator,
            max_body_bytes: opts.max_body_bytes,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn fetch(&self, url: &Url) -> FetchOutcome {
        match self.fetch_inner(url, true).await {
            Ok(outcome) => outcome,
            Err(e) => FetchOutcome::Transport(e.to_string()),
        }
    }

    /// Skip the conditional headers so the origin must answer with a body.
    /// Used to repair a missing local file behind a cached validator.
    pub async fn fetch_unconditional(&self, url: &Url) -> FetchOutcome {
        match self.fetch_inner(url, false).await {
            Ok(outcome) => outcome,
            Err(e) => FetchOutcome::Transport(e.to_string()),
        }
    }

    async fn fetch_inner(&self, url: &Url, conditional: bool) -> Result<FetchOutcome, FetchError> {
        let mut req = self.client.get(url.clone()).header(header::ACCEPT, "*/*");

        if conditional {
            let cond = {
                let validator = self.validator.lock().expect("validator mutex poisoned");
                validator.conditional_headers(url.as_str())
            };
            if let Some(etag) = cond.if_none_match {
                req = req.header(header::IF_NONE_MATCH, etag);
            }
            if let Some(date) = cond.if_modified_since {
                req = req.header(header::IF_MODIFIED_SINCE, date);
            }
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(FetchOutcome::Gone);
        }
        if !status.is_success() {
            return Ok(FetchOutcome::OtherStatus(status.as_u16()));
        }

        let content_type = header_str(&resp, header::CONTENT_TYPE);
        let etag = header_str(&resp, header::ETAG);
        let last_modified = header_str(&resp, header::LAST_MODIFIED);

        let body = read_body_limited(resp, url, self.max_body_bytes).await?;

        let digest = blake3::hash(&body).to_hex().to_string();
        {
            let mut validator = self.validator.lock().expect("validator mutex poisoned");
            validator.update(url.as_str(), etag.clone(), last_modified.clone(), Some(digest));
        }

        Ok(FetchOutcome::Ok(FetchedBody {
            body,
            content_type,
            etag,
            last_modified,
        }))
    }
}

fn header_str(resp: &Response, name: header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Redirects are followed transparently, limited to 10 hops and confined to
/// the origin host.
fn build_client(opts: &HttpOptions, allowed_hosts: HashSet<String>) -> Result<Client> {
    let allowed_hosts = Arc::new(allowed_hosts);

    let policy = redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= 10 {
            return attempt.stop();
        }
        if let Some(host) = attempt.url().host_str() {
            if allowed_hosts.contains(&host.to_ascii_lowercase()) {
                return attempt.follow();
            }
        }
        attempt.stop()
    });

    Client::builder()
        .user_agent(opts.user_agent.clone())
        .timeout(opts.timeout)
        .connect_timeout(opts.connect_timeout)
        .redirect(policy)
        .brotli(true)
        .gzip(true)
        .deflate(true)
        .build()
        .context("failed to build HTTP client")
}

/// Plain capped GET without conditional headers or validator updates; the
/// sitemap harvest uses this before the crawl proper starts.
pub async fn fetch_limited(
    client: &Client,
    url: Url,
    max_bytes: usize,
) -> Result<(StatusCode, Vec<u8>), FetchError> {
    let resp = client
        .get(url.clone())
        .header(header::ACCEPT, "application/xml,text/xml;q=0.9,*/*;q=0.1")
        .send()
        .await?;
    let status = resp.status();
    let body = read_body_limited(resp, &url, max_bytes).await?;
    Ok((status, body))
}

async fn read_body_limited(
    resp: Response,
    url: &Url,
    max_bytes: usize,
) -> Result<Vec<u8>, FetchError> {
    let mut stream = resp.bytes_stream();
    let mut buf = BytesMut::new();

    while let Some(item) = stream.next().await {
        let chunk = item?;
        if buf.len() + chunk.len() > max_bytes {
            return Err(FetchError::BodyTooLarge {
                url: url.to_string(),
                limit: max_bytes,
            });
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(buf.to_vec())
}

const BINARY_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "ico", "bmp", "mp4", "mov", "webm", "avi", "mkv", "mp3",
    "wav", "ogg", "pdf", "woff", "woff2", "ttf", "eot", "otf", "zip", "gz",
];

/// Media content-types and known binary extensions skip link extraction;
/// everything else is treated as text.
pub fn is_binary(content_type: Option<&str>, url: &Url) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.starts_with("image/")
            || ct.starts_with("video/")
            || ct.starts_with("audio/")
            || ct.starts_with("font/")
            || ct.starts_with("application/pdf")
            || ct.starts_with("application/octet-stream")
        {
            return true;
        }
    }
    match path_extension(url.path()) {
        Some(ext) => BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}
