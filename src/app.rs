use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use url::Url;

use crate::{config::MirrorConfig, crawler::Crawler};

#[derive(Parser, Debug)]
#[command(
    name = "gssg",
    version,
    about = "Mirror a Ghost blog into a static directory tree"
)]
pub struct Cli {
    /// Source origin, e.g. http://localhost:2368
    #[arg(long)]
    pub domain: String,

    /// Public domain substituted into text files by the deploy
    /// post-processor; the crawler itself never rewrites
    #[arg(long = "production-domain", alias = "productionDomain")]
    pub production_domain: Option<String>,

    /// Output root directory
    #[arg(long, default_value = "static")]
    pub dest: PathBuf,

    /// Concurrent in-flight fetches
    #[arg(long, default_value_t = 10)]
    pub concurrency: usize,

    /// Announce the output tree for local preview after the run (serving is
    /// handled by the deploy scripts)
    #[arg(long)]
    pub preview: bool,

    /// Exit non-zero if any non-allowlisted error occurred
    #[arg(long = "fail-on-error")]
    pub fail_on_error: bool,

    /// Directory for the validator and graph manifests
    #[arg(long = "cache-dir", default_value = ".gssg-cache")]
    pub cache_dir: PathBuf,

    /// Disable sitemap seeding
    #[arg(long = "no-sitemap")]
    pub no_sitemap: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,

    /// Override User-Agent
    #[arg(long = "user-agent")]
    pub user_agent: Option<String>,
}

pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let origin = Url::parse(&cli.domain).with_context(|| format!("invalid --domain: {}", cli.domain))?;
    let mut config = MirrorConfig::new(origin)?;
    config.dest = cli.dest;
    config.cache_dir = cli.cache_dir;
    config.concurrency = cli.concurrency.clamp(1, 128);
    config.use_sitemap = !cli.no_sitemap;
    config.http.timeout = Duration::from_secs(cli.timeout);
    if let Some(ua) = cli.user_agent {
        config.http.user_agent = ua;
    }
    if let Some(prod) = cli.production_domain {
        config.production_domain =
            Some(Url::parse(&prod).with_context(|| format!("invalid --production-domain: {prod}"))?);
    }

    info!(origin = %config.origin, dest = %config.dest.display(), concurrency = config.concurrency, "starting mirror run");

    let dest = config.dest.clone();
    let fail_on_error = cli.fail_on_error;
    let report = Crawler::new(config)?.run().await?;

    info!(
        fetched = report.fetched,
        not_modified = report.not_modified,
        deleted = report.deleted,
        errors = report.errors.len(),
        "mirror run complete"
    );

    if !report.errors.is_empty() {
        eprintln!("{} crawl error(s):", report.errors.len());
        for err in &report.errors {
            eprintln!("  {err}");
        }
        if fail_on_error {
            std::process::exit(1);
        }
    }

    if cli.preview {
        info!(dest = %dest.display(), "tree ready for preview; serve it with the deploy scripts");
    }

    Ok(())
}
