use std::{
    collections::{HashSet, VecDeque},
    fmt, fs,
    sync::{Arc, Mutex, OnceLock},
};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::MirrorConfig,
    extract,
    fetch::{is_binary, FetchOutcome, Fetcher},
    gc,
    graph::{GraphNode, LinkGraph},
    policy::PathPolicy,
    sitemap,
    util::{now_unix_secs, path_extension, same_origin},
    validator::ValidatorCache,
};

/// One failed URL. Collected during the run, surfaced in a single batch at
/// the end; status 0 marks transport and disk failures.
#[derive(Debug, Clone)]
pub struct CrawlError {
    pub url: String,
    pub status: u16,
    pub referrer: Option<String>,
    pub at: i64,
    pub detail: Option<String>,
}

impl fmt::Display for CrawlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.url, self.status)?;
        if let Some(referrer) = &self.referrer {
            write!(f, " linked from {referrer}")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct CrawlReport {
    /// URLs that returned a fresh body.
    pub fetched: usize,
    /// URLs answered with 304.
    pub not_modified: usize,
    /// Files the GC removed.
    pub deleted: usize,
    pub errors: Vec<CrawlError>,
}

impl CrawlReport {
    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// The scheduling core: a worklist-driven, bounded-parallel expander that
/// fetches each discovered URL at most once per run, writes bodies into the
/// output tree, builds a fresh graph, and reconciles disk afterwards.
pub struct Crawler {
    config: MirrorConfig,
    policy: Arc<PathPolicy>,
    validator: Arc<Mutex<ValidatorCache>>,
    fetcher: Arc<Fetcher>,
    old_graph: Arc<LinkGraph>,
}

struct TaskCtx {
    policy: Arc<PathPolicy>,
    fetcher: Arc<Fetcher>,
    validator: Arc<Mutex<ValidatorCache>>,
    old_graph: Arc<LinkGraph>,
    not_found_allowlist: Vec<String>,
}

/// Everything a worker learned about one URL. Workers own no shared crawl
/// state; the scheduler applies these on join.
struct TaskOutput {
    url: Url,
    node: Option<GraphNode>,
    children: Vec<Url>,
    seeds: Vec<Url>,
    error: Option<CrawlError>,
    fetched: bool,
    not_modified: bool,
}

impl TaskOutput {
    fn new(url: Url) -> Self {
        Self {
            url,
            node: None,
            children: Vec::new(),
            seeds: Vec::new(),
            error: None,
            fetched: false,
            not_modified: false,
        }
    }
}

impl Crawler {
    pub fn new(config: MirrorConfig) -> Result<Self> {
        let policy = Arc::new(PathPolicy::new(&config));
        let validator = Arc::new(Mutex::new(ValidatorCache::load(config.validator_path())));
        let old_graph = Arc::new(LinkGraph::load(config.graph_path()));
        let fetcher = Arc::new(Fetcher::new(
            &config.http,
            &config.origin,
            Arc::clone(&validator),
        )?);

        Ok(Self {
            config,
            policy,
            validator,
            fetcher,
            old_graph,
        })
    }

    pub async fn run(self) -> Result<CrawlReport> {
        fs::create_dir_all(&self.config.dest)
            .with_context(|| format!("failed to create output root: {}", self.config.dest.display()))?;
        fs::create_dir_all(&self.config.cache_dir).with_context(|| {
            format!("failed to create cache dir: {}", self.config.cache_dir.display())
        })?;

        let mut report = CrawlReport::default();
        let mut new_graph = LinkGraph::empty(self.config.graph_path());

        // The authoritative entry set. Retained beyond seeding: GC
        // reachability starts here even for entries whose fetch failed.
        let mut entries: HashSet<String> = HashSet::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(Url, Option<Url>)> = VecDeque::new();

        let root = self.policy.normalize(&self.config.origin);
        self.seed(&root, &mut entries, &mut seen, &mut queue);

        for asset in &self.config.assets {
            match self.config.origin.join(asset) {
                Ok(u) => {
                    let u = self.policy.normalize(&u);
                    self.seed(&u, &mut entries, &mut seen, &mut queue);
                }
                Err(e) => warn!(asset = %asset, error = %e, "skipping unparseable asset seed"),
            }
        }

        if self.config.use_sitemap {
            let harvested = sitemap::harvest_entry_urls(
                self.fetcher.client(),
                &self.config.origin,
                self.config.http.max_body_bytes,
            )
            .await
            .unwrap_or_else(|e| {
                warn!(error = %format!("{e:#}"), "sitemap harvest failed, continuing without it");
                Vec::new()
            });
            info!(count = harvested.len(), "sitemap entries harvested");
            for u in harvested {
                let u = self.policy.normalize(&u);
                self.seed(&u, &mut entries, &mut seen, &mut queue);
            }
        }

        let ctx = Arc::new(TaskCtx {
            policy: Arc::clone(&self.policy),
            fetcher: Arc::clone(&self.fetcher),
            validator: Arc::clone(&self.validator),
            old_graph: Arc::clone(&self.old_graph),
            not_found_allowlist: self.config.not_found_allowlist.clone(),
        });

        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();

        while !queue.is_empty() || !tasks.is_empty() {
            while tasks.len() < self.config.concurrency && !queue.is_empty() {
                let (url, referrer) = queue.pop_front().expect("non-empty queue");
                let ctx = Arc::clone(&ctx);
                tasks.spawn(handle(ctx, url, referrer));
            }

            if let Some(res) = tasks.join_next().await {
                let out = res.context("crawl task panicked")?;

                if out.fetched {
                    report.fetched += 1;
                }
                if out.not_modified {
                    report.not_modified += 1;
                }
                if let Some(err) = out.error {
                    report.errors.push(err);
                }
                if let Some(node) = out.node {
                    new_graph.insert(node);
                }

                for child in out.children {
                    if !same_origin(&child, &self.config.origin) {
                        continue;
                    }
                    if seen.insert(child.as_str().to_string()) {
                        queue.push_back((child, Some(out.url.clone())));
                    }
                }
                for seed in out.seeds {
                    let seed = self.policy.normalize(&seed);
                    entries.insert(seed.as_str().to_string());
                    if seen.insert(seed.as_str().to_string()) {
                        queue.push_back((seed, None));
                    }
                }
            }
        }

        info!(
            fetched = report.fetched,
            not_modified = report.not_modified,
            nodes = new_graph.len(),
            errors = report.errors.len(),
            "crawl settled"
        );

        // Disk reconciliation strictly after the loop: every graph update
        // happens-before the GC reads it.
        let reachable = new_graph.reachable_from(entries.iter().map(|s| s.as_str()));
        report.deleted = gc::sweep(&self.policy, &reachable);

        {
            let mut validator = self.validator.lock().expect("validator mutex poisoned");
            validator.expire(self.config.retention_days);
            validator.save()?;
        }
        new_graph.save()?;

        Ok(report)
    }

    fn seed(
        &self,
        url: &Url,
        entries: &mut HashSet<String>,
        seen: &mut HashSet<String>,
        queue: &mut VecDeque<(Url, Option<Url>)>,
    ) {
        entries.insert(url.as_str().to_string());
        if seen.insert(url.as_str().to_string()) {
            queue.push_back((url.clone(), None));
        }
    }
}

async fn handle(ctx: Arc<TaskCtx>, url: Url, referrer: Option<Url>) -> TaskOutput {
    let mut out = TaskOutput::new(url.clone());
    let referrer_str = referrer.map(|r| r.to_string());

    let out_path = match ctx.policy.url_to_path(&url) {
        Ok(p) => p,
        Err(e) => {
            error!(url = %url, error = %format!("{e:#}"), "URL rejected by path policy");
            out.error = Some(CrawlError {
                url: url.to_string(),
                status: 0,
                referrer: referrer_str,
                at: now_unix_secs(),
                detail: Some(format!("{e:#}")),
            });
            return out;
        }
    };

    debug!(url = %url, "fetching");
    let mut outcome = ctx.fetcher.fetch(&url).await;

    if matches!(outcome, FetchOutcome::NotModified) {
        // A 304 is only as good as what we kept from last time. A missing
        // file (operator deleted it) or a missing graph node (operator
        // deleted graph.json) both need the body again.
        let file_missing = !out_path.is_file();
        let node_missing =
            ctx.old_graph.node(url.as_str()).is_none() && is_parseable_kind(&url);
        if file_missing {
            warn!(url = %url, path = %out_path.display(), "cached 304 but file missing, refetching");
            ctx.validator
                .lock()
                .expect("validator mutex poisoned")
                .forget(url.as_str());
        }
        if file_missing || node_missing {
            outcome = ctx.fetcher.fetch_unconditional(&url).await;
        }
    }

    match outcome {
        FetchOutcome::NotModified => {
            out.not_modified = true;
            if let Some(prev) = ctx.old_graph.node(url.as_str()) {
                out.children = prev
                    .hyperlinks
                    .iter()
                    .chain(prev.resources.iter())
                    .filter_map(|s| Url::parse(s).ok())
                    .collect();
                out.node = Some(prev.clone());
            }
        }
        FetchOutcome::Ok(body) => {
            out.fetched = true;

            let skip_write = is_rss_feed(&url)
                && fs::read(&out_path)
                    .map(|existing| {
                        blank_last_build_date(&existing) == blank_last_build_date(&body.body)
                    })
                    .unwrap_or(false);

            if skip_write {
                debug!(url = %url, "feed unchanged apart from lastBuildDate, keeping file");
            } else if let Err(e) = ctx.policy.write_atomic(&out_path, &body.body) {
                error!(url = %url, path = %out_path.display(), error = %format!("{e:#}"), "failed to write body");
                out.error = Some(CrawlError {
                    url: url.to_string(),
                    status: 0,
                    referrer: referrer_str.clone(),
                    at: now_unix_secs(),
                    detail: Some(format!("{e:#}")),
                });
            }

            if !is_binary(body.content_type.as_deref(), &url) {
                if let Some(ex) = extract::extract(
                    &body.body,
                    body.content_type.as_deref(),
                    &url,
                    ctx.policy.origin(),
                ) {
                    let hyperlinks = normalize_targets(&ctx.policy, ex.hyperlinks);
                    let resources = normalize_targets(&ctx.policy, ex.resources);
                    out.children = hyperlinks.iter().chain(resources.iter()).cloned().collect();
                    out.seeds = ex.seeds;
                    out.node = Some(GraphNode {
                        url: url.as_str().to_string(),
                        hyperlinks: hyperlinks.iter().map(|u| u.as_str().to_string()).collect(),
                        resources: resources.iter().map(|u| u.as_str().to_string()).collect(),
                        last_parsed: now_unix_secs(),
                    });
                }
            }
        }
        FetchOutcome::Gone => {
            let allowlisted = ctx
                .not_found_allowlist
                .iter()
                .any(|p| url.as_str().contains(p.as_str()));
            if allowlisted {
                debug!(url = %url, "404 allowlisted, skipping");
            } else {
                warn!(url = %url, "404 at origin");
                out.error = Some(CrawlError {
                    url: url.to_string(),
                    status: 404,
                    referrer: referrer_str,
                    at: now_unix_secs(),
                    detail: None,
                });
            }
        }
        FetchOutcome::OtherStatus(status) => {
            warn!(url = %url, status, "origin error");
            out.error = Some(CrawlError {
                url: url.to_string(),
                status,
                referrer: referrer_str,
                at: now_unix_secs(),
                detail: None,
            });
        }
        FetchOutcome::Transport(reason) => {
            warn!(url = %url, reason = %reason, "transport error");
            out.error = Some(CrawlError {
                url: url.to_string(),
                status: 0,
                referrer: referrer_str,
                at: now_unix_secs(),
                detail: Some(reason),
            });
        }
    }

    out
}

/// Normalize extracted targets to canonical keys, keeping first-seen order.
fn normalize_targets(policy: &PathPolicy, urls: Vec<Url>) -> Vec<Url> {
    let mut seen: HashSet<String> = HashSet::new();
    urls.into_iter()
        .map(|u| policy.normalize(&u))
        .filter(|u| seen.insert(u.as_str().to_string()))
        .collect()
}

/// Documents whose bodies feed the graph; used to decide whether a 304
/// without a prior node still needs a real download.
fn is_parseable_kind(url: &Url) -> bool {
    let path = url.path();
    if path.ends_with('/') {
        return true;
    }
    matches!(
        path_extension(path).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("html") | Some("css") | Some("xml")
    )
}

fn is_rss_feed(url: &Url) -> bool {
    let path = url.path();
    path.contains("/rss/") || path.ends_with("/rss")
}

fn last_build_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<lastBuildDate>[^<]*</lastBuildDate>").unwrap())
}

/// Feeds re-render with a fresh `lastBuildDate` on every request; blank it
/// before comparing so an otherwise unchanged feed is not rewritten.
fn blank_last_build_date(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    last_build_date_regex()
        .replace_all(&text, "<lastBuildDate></lastBuildDate>")
        .into_owned()
}
