//! Crawl engine: admission control, worker pool, and idle-based shutdown.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use tokio::task::spawn_local;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::filter::HostFilter;
use crate::frontier::{Frontier, Visit, DEFAULT_FRONTIER_CAPACITY};
use crate::html::stream_links;
use crate::sitemap::{SiteMap, ROOT_KEY};

/// How often the supervisor samples the frontier and the activity clock.
const SUPERVISOR_TICK: Duration = Duration::from_secs(1);
/// Idle threshold as a multiple of the HTTP timeout.
const IDLE_FACTOR: f64 = 1.5;

/// Per-target admission failure returned by [`Engine::enqueue`].
#[derive(Debug)]
pub enum EnqueueError {
    /// Scheme is neither `http` nor `https`.
    UnsupportedScheme(Url),
    /// Host is not on the allow-list.
    FilteredOut(Url),
    /// The canonical URL was already admitted during this run.
    AlreadyEnqueued(Url),
    /// The engine is shutting down or already stopped.
    Cancelled,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedScheme(url) => {
                write!(f, "unsupported scheme {:?} in {url}", url.scheme())
            }
            Self::FilteredOut(url) => write!(f, "host not allowed: {url}"),
            Self::AlreadyEnqueued(url) => write!(f, "already enqueued: {url}"),
            Self::Cancelled => write!(f, "crawl cancelled"),
        }
    }
}

impl Error for EnqueueError {}

/// Point-in-time view of the run counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful enqueues.
    pub queued: u64,
    /// Successful HTTP fetches.
    pub visited: u64,
    /// URLs rejected by scheme, filter, or dedup.
    pub encountered: u64,
}

#[derive(Debug, Default)]
struct Stats {
    queued: AtomicU64,
    visited: AtomicU64,
    encountered: AtomicU64,
}

impl Stats {
    fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    fn record_visited(&self) {
        self.visited.fetch_add(1, Ordering::Relaxed);
    }

    fn record_encountered(&self) {
        self.encountered.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            visited: self.visited.load(Ordering::Relaxed),
            encountered: self.encountered.load(Ordering::Relaxed),
        }
    }
}

/// Tracks the most recent start-of-work event across all workers.
struct ActivityClock {
    started: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Release);
    }

    fn idle(&self) -> Duration {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Acquire);
        Duration::from_millis(elapsed.saturating_sub(last))
    }
}

/// Breadth-first crawl engine.
///
/// Owns the frontier, the dedup set, and the run counters. Workers pull
/// visits from the frontier, fetch them, and feed discovered links back
/// through [`Engine::enqueue`]; a supervisor cancels the run once the
/// frontier is empty and no worker has started work for longer than 1.5x the
/// HTTP timeout. The frontier is closed only after every worker has joined.
pub struct Engine {
    cancel: CancellationToken,
    client: Client,
    http_timeout: Duration,
    filter: Arc<HostFilter>,
    sitemap: Arc<SiteMap>,
    frontier: Frontier,
    stats: Stats,
    activity: ActivityClock,
}

impl Engine {
    /// Builds an engine bound to a child of `cancel`; cancelling the caller's
    /// token therefore unwinds the whole run.
    pub fn new(
        cancel: &CancellationToken,
        client: Client,
        http_timeout: Duration,
        filter: Arc<HostFilter>,
        sitemap: Arc<SiteMap>,
    ) -> Self {
        Self {
            cancel: cancel.child_token(),
            client,
            http_timeout,
            filter,
            sitemap,
            frontier: Frontier::new(DEFAULT_FRONTIER_CAPACITY),
            stats: Stats::default(),
            activity: ActivityClock::new(),
        }
    }

    /// Submits targets discovered on `source` (`None` for seeds).
    ///
    /// Each target runs through the admission pipeline: fragment stripping,
    /// scheme check, host filter, dedup, then the frontier send. Admitted
    /// targets record a sitemap edge under the source key; rejected ones
    /// contribute an error to the returned list and never abort the rest of
    /// the call. The list is empty iff every target was admitted.
    pub async fn enqueue<I>(&self, source: Option<&Url>, targets: I) -> Vec<EnqueueError>
    where
        I: IntoIterator<Item = Url>,
    {
        let mut rejections = Vec::new();
        for mut target in targets {
            if self.cancel.is_cancelled() || self.frontier.is_closed() {
                rejections.push(EnqueueError::Cancelled);
                continue;
            }

            target.set_fragment(None);

            if !matches!(target.scheme(), "http" | "https") {
                self.stats.record_encountered();
                rejections.push(EnqueueError::UnsupportedScheme(target));
                continue;
            }
            if !self.filter.matches(&target) {
                self.stats.record_encountered();
                rejections.push(EnqueueError::FilteredOut(target));
                continue;
            }
            if !self.frontier.admit(target.as_str()).await {
                self.stats.record_encountered();
                rejections.push(EnqueueError::AlreadyEnqueued(target));
                continue;
            }

            let key = source.map_or_else(|| ROOT_KEY.to_string(), |s| s.as_str().to_string());
            self.sitemap.add(&key, [display_target(source, &target)]);
            self.stats.record_queued();

            let visit = Visit {
                source: source.cloned(),
                target,
            };
            if self.frontier.send(visit, &self.cancel).await.is_err() {
                rejections.push(EnqueueError::Cancelled);
            }
        }
        rejections
    }

    /// Runs `n_workers` workers (clamped to at least one) until quiescence or
    /// cancellation, then joins them and closes the frontier.
    ///
    /// Worker futures are not `Send` (the HTML rewriter's handlers are not),
    /// so this must run inside a tokio [`LocalSet`](tokio::task::LocalSet).
    pub async fn run(self: Arc<Self>, n_workers: usize) {
        let mut workers = Vec::with_capacity(n_workers.max(1));
        for id in 0..n_workers.max(1) {
            let engine = Arc::clone(&self);
            workers.push(spawn_local(async move { engine.worker_loop(id).await }));
        }

        self.supervise().await;
        join_all(workers).await;
        self.frontier.close().await;
        debug!("frontier closed");
    }

    /// Snapshot of `(queued, visited, encountered)` via atomic loads.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// True once the engine has begun shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn worker_loop(&self, id: usize) {
        while let Some(visit) = self.frontier.next(&self.cancel).await {
            self.activity.touch();
            let target = &visit.target;
            let from = visit.source.as_ref().map_or(ROOT_KEY, |s| s.as_str());
            debug!(worker = id, url = %target, from, "crawl");

            let response = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self
                    .client
                    .get(target.clone())
                    .header(ACCEPT, "text/*")
                    .send() => result,
            };
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    warn!(worker = id, url = %target, error = %err, "fetch failed");
                    continue;
                }
            };

            self.stats.record_visited();

            let is_text = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.trim_start().starts_with("text/"));
            if !is_text {
                warn!(worker = id, url = %target, "skipping non-text response");
                continue;
            }

            let base = target.clone();
            let links = stream_links(response, move |href| resolve_href(&base, href)).await;
            let links = match links {
                Ok(links) => links,
                Err(err) => {
                    warn!(worker = id, url = %target, error = %err, "parse aborted");
                    continue;
                }
            };

            for rejection in self.enqueue(Some(target), links).await {
                debug!(worker = id, url = %target, reason = %rejection, "link rejected");
            }
        }
    }

    /// Cancels the run once the frontier is empty and no worker has recorded
    /// activity for more than `IDLE_FACTOR` HTTP timeouts. Closing the
    /// channel on emptiness alone would be unsound: workers are producers,
    /// and a straggler may still hold unparsed hrefs.
    async fn supervise(&self) {
        let idle_limit = self.http_timeout.mul_f64(IDLE_FACTOR);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(SUPERVISOR_TICK) => {}
            }

            if self.frontier.is_empty() && self.activity.idle() > idle_limit {
                debug!(idle = ?self.activity.idle(), "frontier quiescent, stopping workers");
                self.cancel.cancel();
                break;
            }
        }
    }
}

/// Resolves a raw href against the page it appeared on.
///
/// Absolute hrefs pass through untouched; relative ones inherit scheme, host,
/// and path context from `base`. Fragments are always dropped. Unparsable
/// hrefs are logged and skipped.
fn resolve_href(base: &Url, href: &str) -> Option<Url> {
    let parsed = match Url::parse(href) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => base.join(href),
        Err(err) => Err(err),
    };
    match parsed {
        Ok(mut url) => {
            url.set_fragment(None);
            Some(url)
        }
        Err(err) => {
            debug!(href, error = %err, "skipping unparsable href");
            None
        }
    }
}

/// Renders a target for the sitemap: scheme always stripped, host (and port)
/// stripped when the target stays on the source's site.
fn display_target(source: Option<&Url>, target: &Url) -> String {
    let same_site = source.map_or(true, |s| {
        s.host_str() == target.host_str() && s.port() == target.port()
    });

    let mut rendered = String::new();
    if !same_site {
        if let Some(host) = target.host_str() {
            rendered.push_str(host);
        }
        if let Some(port) = target.port() {
            rendered.push(':');
            rendered.push_str(&port.to_string());
        }
    }
    rendered.push_str(target.path());
    if let Some(query) = target.query() {
        rendered.push('?');
        rendered.push_str(query);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_engine(hosts: &[&str]) -> (Arc<Engine>, Arc<SiteMap>, CancellationToken) {
        let filter = Arc::new(HostFilter::new());
        for host in hosts {
            filter.add_host(host);
        }
        let sitemap = Arc::new(SiteMap::new());
        let client = Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .expect("client builds");
        let cancel = CancellationToken::new();
        let engine = Arc::new(Engine::new(
            &cancel,
            client,
            Duration::from_millis(500),
            filter,
            Arc::clone(&sitemap),
        ));
        (engine, sitemap, cancel)
    }

    fn url(raw: &str) -> Url {
        Url::parse(raw).expect("test url parses")
    }

    fn render(map: &SiteMap) -> String {
        let mut buf = Vec::new();
        map.list(&mut buf).expect("write to vec");
        String::from_utf8(buf).expect("report is utf-8")
    }

    #[tokio::test(flavor = "current_thread")]
    async fn seed_admission_records_root_edge() {
        let (engine, sitemap, _cancel) = test_engine(&["a.test"]);

        let errors = engine.enqueue(None, [url("http://a.test/")]).await;
        assert!(errors.is_empty());

        let stats = engine.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.encountered, 0);
        assert_eq!(engine.frontier.len(), 1);
        assert_eq!(render(&sitemap), "Key: <root>\n\t - /\n");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn duplicate_target_rejected_once() {
        let (engine, _sitemap, _cancel) = test_engine(&["a.test"]);

        assert!(engine.enqueue(None, [url("http://a.test/p")]).await.is_empty());
        let errors = engine.enqueue(None, [url("http://a.test/p")]).await;
        assert!(matches!(errors.as_slice(), [EnqueueError::AlreadyEnqueued(_)]));

        let stats = engine.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.encountered, 1);
        assert_eq!(engine.frontier.seen_len().await, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fragments_collapse_to_one_admission() {
        let (engine, sitemap, _cancel) = test_engine(&["a.test"]);
        let source = url("http://a.test/");

        let first = engine
            .enqueue(Some(&source), [url("http://a.test/p#alpha")])
            .await;
        assert!(first.is_empty());

        let second = engine
            .enqueue(Some(&source), [url("http://a.test/p#beta")])
            .await;
        assert!(matches!(second.as_slice(), [EnqueueError::AlreadyEnqueued(_)]));

        assert_eq!(engine.stats().queued, 1);
        assert!(!render(&sitemap).contains('#'));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scheme_and_filter_rejections_are_counted() {
        let (engine, sitemap, _cancel) = test_engine(&["a.test"]);
        let source = url("http://a.test/");

        let errors = engine
            .enqueue(
                Some(&source),
                [
                    url("mailto:user@a.test"),
                    url("javascript:void(0)"),
                    url("http://b.test/x"),
                ],
            )
            .await;

        assert!(matches!(
            errors.as_slice(),
            [
                EnqueueError::UnsupportedScheme(_),
                EnqueueError::UnsupportedScheme(_),
                EnqueueError::FilteredOut(_),
            ]
        ));
        let stats = engine.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.encountered, 3);
        assert_eq!(sitemap.key_count(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rejection_order_is_scheme_then_filter_then_dedup() {
        let (engine, _sitemap, _cancel) = test_engine(&["a.test"]);

        // Off-host and unsupported-scheme targets never reach the dedup set.
        engine.enqueue(None, [url("ftp://b.test/x")]).await;
        assert_eq!(engine.frontier.seen_len().await, 0);
        engine.enqueue(None, [url("http://b.test/x")]).await;
        assert_eq!(engine.frontier.seen_len().await, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_engine_rejects_without_side_effects() {
        let (engine, sitemap, cancel) = test_engine(&["a.test"]);
        cancel.cancel();

        let errors = engine.enqueue(None, [url("http://a.test/")]).await;
        assert!(matches!(errors.as_slice(), [EnqueueError::Cancelled]));

        let stats = engine.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.encountered, 0);
        assert_eq!(sitemap.key_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_enqueues_admit_exactly_once() {
        let (engine, _sitemap, _cancel) = test_engine(&["a.test"]);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.enqueue(None, [url("http://a.test/contended")]).await
            }));
        }

        let mut rejected = 0;
        for handle in handles {
            rejected += handle.await.expect("task joins").len();
        }
        assert_eq!(rejected, 7);

        let stats = engine.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.encountered, 7);
        assert_eq!(engine.frontier.seen_len().await, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn queued_matches_dedup_set_size() {
        let (engine, _sitemap, _cancel) = test_engine(&["a.test"]);

        engine
            .enqueue(
                None,
                [
                    url("http://a.test/"),
                    url("http://a.test/x"),
                    url("http://a.test/x"),
                    url("http://b.test/off"),
                ],
            )
            .await;

        assert_eq!(
            engine.stats().queued,
            engine.frontier.seen_len().await as u64
        );
    }

    #[test]
    fn hrefs_inherit_scheme_and_host_from_base() {
        let base = url("http://a.test/dir/page");

        let resolved = resolve_href(&base, "/p").expect("resolves");
        assert_eq!(resolved.as_str(), "http://a.test/p");

        let resolved = resolve_href(&base, "sibling").expect("resolves");
        assert_eq!(resolved.as_str(), "http://a.test/dir/sibling");

        let resolved = resolve_href(&base, "//b.test/x").expect("resolves");
        assert_eq!(resolved.as_str(), "http://b.test/x");

        let resolved = resolve_href(&base, "http://c.test/y#frag").expect("resolves");
        assert_eq!(resolved.as_str(), "http://c.test/y");

        assert!(resolve_href(&base, "http://[broken").is_none());
    }

    #[test]
    fn display_collapses_same_site_targets() {
        let source = url("http://a.test/");

        assert_eq!(display_target(None, &url("http://a.test/")), "/");
        assert_eq!(
            display_target(Some(&source), &url("http://a.test/b?q=1")),
            "/b?q=1"
        );
        assert_eq!(
            display_target(Some(&source), &url("http://b.test/x")),
            "b.test/x"
        );
        assert_eq!(
            display_target(Some(&source), &url("http://a.test:8080/x")),
            "a.test:8080/x"
        );
    }

    #[tokio::test]
    async fn run_closes_frontier_and_rejects_late_enqueues() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(b"<html></html>".to_vec(), "text/html"),
            )
            .mount(&server)
            .await;

        let seed = url(&server.uri());
        let (engine, _sitemap, _cancel) =
            test_engine(&[seed.host_str().expect("mock server has a host")]);

        assert!(engine.enqueue(None, [seed.clone()]).await.is_empty());
        let local = tokio::task::LocalSet::new();
        local.run_until(Arc::clone(&engine).run(2)).await;

        let stats = engine.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.visited, 1);
        assert_eq!(stats.encountered, 0);
        assert!(engine.frontier.is_closed());

        let errors = engine.enqueue(None, [url("http://late.test/")]).await;
        assert!(matches!(errors.as_slice(), [EnqueueError::Cancelled]));
    }
}
