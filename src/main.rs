//! Command-line entry point for the crawler.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use reqwest::redirect;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use crawlmap::{Engine, HostFilter, SiteMap};

const USER_AGENT: &str = concat!("crawlmap/", env!("CARGO_PKG_VERSION"));

/// Crawl a site breadth-first and print the discovered link map.
#[derive(Parser, Debug)]
#[command(name = "crawlmap", version, about)]
struct Cli {
    /// Seed URL to start crawling from
    seed: String,

    /// Additional hostnames to allow beyond the seed's host
    hosts: Vec<String>,

    /// HTTP timeout in seconds
    #[arg(
        short = 't',
        long = "timeout",
        env = "CRAWLMAP_TIMEOUT_SECS",
        default_value_t = 5
    )]
    timeout_secs: u64,

    /// Worker count; negative values mean |n| x available CPUs
    #[arg(
        short = 'w',
        long = "workers",
        env = "CRAWLMAP_WORKERS",
        default_value_t = 256,
        allow_negative_numbers = true
    )]
    workers: i64,

    /// Log filter, e.g. "info" or "crawlmap=debug"
    #[arg(short = 'l', long = "log", env = "CRAWLMAP_LOG", default_value = "info")]
    log: String,
}

impl Cli {
    fn worker_count(&self) -> usize {
        let n = if self.workers < 0 {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            self.workers.unsigned_abs() as usize * cpus
        } else {
            self.workers as usize
        };
        n.max(1)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("invalid log filter")?)
        .with_writer(io::stderr)
        .init();

    // Workers hold a non-Send HTML rewriter across awaits, so the whole crawl
    // runs on a current-thread runtime inside a LocalSet.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(crawl(cli)))
}

async fn crawl(cli: Cli) -> Result<()> {
    let seed = Url::parse(&cli.seed).context("invalid seed URL")?;
    let Some(seed_host) = seed.host_str() else {
        bail!("seed URL {seed} has no host");
    };

    let filter = Arc::new(HostFilter::new());
    filter.add_host(seed_host);
    for host in &cli.hosts {
        filter.add_host(host);
    }

    let timeout = Duration::from_secs(cli.timeout_secs);
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(redirect::Policy::limited(5))
        .timeout(timeout)
        .build()
        .context("building HTTP client")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let sitemap = Arc::new(SiteMap::new());
    let engine = Arc::new(Engine::new(
        &cancel,
        client,
        timeout,
        filter,
        Arc::clone(&sitemap),
    ));

    let rejections = engine.enqueue(None, [seed]).await;
    if let Some(rejection) = rejections.into_iter().next() {
        bail!("seed rejected: {rejection}");
    }

    let workers = cli.worker_count();
    info!(workers, timeout_secs = cli.timeout_secs, "starting crawl");
    Arc::clone(&engine).run(workers).await;

    let stats = engine.stats();
    info!(
        queued = stats.queued,
        visited = stats.visited,
        encountered = stats.encountered,
        "crawl finished"
    );

    sitemap
        .list(&mut io::stdout().lock())
        .context("writing sitemap")?;
    Ok(())
}

/// Cancels the parent token on SIGINT, SIGTERM, or SIGPIPE.
fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut pipe = signal(SignalKind::pipe()).context("installing SIGPIPE handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = pipe.recv() => {}
        }
        info!("signal received, shutting down");
        cancel.cancel();
    });
    Ok(())
}
