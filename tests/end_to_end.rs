//! End-to-end crawl scenarios against in-memory transports.
//!
//! Every scenario runs the full pipeline: generator, both pools and the
//! orchestrator's shutdown protocol.

use crawl_engine::prelude::*;
use dashmap::DashMap;
use futures_util::stream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

const RUN_DEADLINE: Duration = Duration::from_secs(20);

fn builder() -> CrawlerBuilder {
    CrawlerBuilder::new()
        .network_workers(4)
        .parser_workers(2)
        .parser_poll_timeout(Duration::from_millis(20))
        .control_poll_interval(Duration::from_millis(10))
}

fn req(url: &str, tag: &str) -> Request {
    Request::parse(url, tag).unwrap()
}

async fn run(crawler: Crawler) -> Result<(), CrawlError> {
    tokio::time::timeout(RUN_DEADLINE, crawler.run())
        .await
        .expect("crawl did not stop in time")
}

/// Answers every request with 200, optionally failing some attempts first.
#[derive(Default)]
struct ScriptedTransport {
    attempts: DashMap<String, usize>,
    /// URL -> number of leading attempts that fail with a transient error.
    flaky: DashMap<String, usize>,
    /// URLs that always fail with a transient error.
    unreachable: DashMap<String, ()>,
    /// URLs that fail with a non-transient error.
    broken: DashMap<String, ()>,
    max_try_count_seen: AtomicU32,
    probe: Arc<()>,
}

impl ScriptedTransport {
    fn attempts(&self, url: &str) -> usize {
        self.attempts.get(url).map(|n| *n).unwrap_or(0)
    }

    fn total_attempts(&self) -> usize {
        self.attempts.iter().map(|entry| *entry.value()).sum()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let url = request.url.to_string();
        self.max_try_count_seen
            .fetch_max(request.network_try_count, Ordering::SeqCst);
        let attempt = {
            let mut entry = self.attempts.entry(url.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        // Vary completion order a little.
        tokio::time::sleep(Duration::from_millis((url.len() % 3) as u64)).await;

        if self.broken.contains_key(&url) {
            return Err(FetchError::other(anyhow::anyhow!("TLS handshake rejected")));
        }
        if self.unreachable.contains_key(&url) {
            return Err(FetchError::network(std::io::Error::from(
                std::io::ErrorKind::TimedOut,
            )));
        }
        if let Some(failures) = self.flaky.get(&url) {
            if attempt <= *failures {
                return Err(FetchError::network(std::io::Error::from(
                    std::io::ErrorKind::ConnectionReset,
                )));
            }
        }
        Ok(Response::new(request.url.clone(), 200, url))
    }
}

#[derive(Default)]
struct RecordingHooks {
    started: AtomicUsize,
    rejected: DashMap<String, u32>,
    shutdowns: AtomicUsize,
}

impl CrawlHooks for RecordingHooks {
    fn on_start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_rejected(&self, request: &Request, response: Option<&Response>, error: &FetchError) {
        assert!(response.is_none());
        assert!(error.is_transient());
        self.rejected
            .insert(request.url.to_string(), request.network_try_count);
    }

    fn on_shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_then_stop() {
    let transport = Arc::new(ScriptedTransport::default());
    let dispatched = Arc::new(AtomicUsize::new(0));
    let hooks = Arc::new(RecordingHooks::default());

    let on_a = Arc::clone(&dispatched);
    let on_b = Arc::clone(&dispatched);
    let crawler = builder()
        .transport(Arc::clone(&transport))
        .hooks(Arc::clone(&hooks))
        .start_requests(vec![req("https://site.test/", "a")])
        .handler_fn("a", move |request, _response| {
            on_a.fetch_add(1, Ordering::SeqCst);
            let base = request.url.clone();
            Ok(HandlerOutput::requests(vec![
                Request::new(base.join("/b1").unwrap(), "b"),
                Request::new(base.join("/b2").unwrap(), "b"),
            ]))
        })
        .handler_fn("b", move |_request, _response| {
            on_b.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutput::none())
        })
        .build()
        .unwrap();
    let stats = crawler.get_stats();

    run(crawler).await.unwrap();

    assert_eq!(transport.total_attempts(), 3);
    assert_eq!(dispatched.load(Ordering::SeqCst), 3);
    assert_eq!(stats.responses_parsed.load(Ordering::SeqCst), 3);
    assert_eq!(stats.requests_enqueued.load(Ordering::SeqCst), 3);
    assert_eq!(stats.requests_followed.load(Ordering::SeqCst), 2);
    assert_eq!(stats.fatal_errors.load(Ordering::SeqCst), 0);
    assert_eq!(hooks.started.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(Arc::strong_count(&transport.probe), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_reject_the_request() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.unreachable.insert("https://down.test/".to_string(), ());
    let hooks = Arc::new(RecordingHooks::default());

    let crawler = builder()
        .network_try_limit(2)
        .transport(Arc::clone(&transport))
        .hooks(Arc::clone(&hooks))
        .start_requests(vec![req("https://down.test/", "page")])
        .handler_fn("page", |_, _| panic!("rejected requests never reach a handler"))
        .build()
        .unwrap();
    let stats = crawler.get_stats();

    run(crawler).await.unwrap();

    assert_eq!(transport.attempts("https://down.test/"), 3);
    assert_eq!(hooks.rejected.len(), 1);
    assert_eq!(*hooks.rejected.get("https://down.test/").unwrap(), 2);
    assert_eq!(hooks.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(stats.requests_rejected.load(Ordering::SeqCst), 1);
    assert_eq!(stats.requests_retried.load(Ordering::SeqCst), 2);
    assert_eq!(stats.responses_parsed.load(Ordering::SeqCst), 0);

    let records = stats.records("network_try_limit");
    assert_eq!(records.len(), 1);
    assert!(records[0].starts_with("https://down.test/|"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_count_never_exceeds_limit() {
    let transport = Arc::new(ScriptedTransport::default());
    for i in 0..6 {
        transport
            .flaky
            .insert(format!("https://flaky.test/{}", i), i);
    }

    let crawler = builder()
        .network_try_limit(3)
        .transport(Arc::clone(&transport))
        .start_requests((0..6).map(|i| req(&format!("https://flaky.test/{}", i), "page")))
        .handler_fn("page", |_, _| Ok(HandlerOutput::none()))
        .build()
        .unwrap();
    let stats = crawler.get_stats();

    run(crawler).await.unwrap();

    // Up to three failures are recovered, four and five exhaust the budget.
    assert_eq!(stats.responses_parsed.load(Ordering::SeqCst), 4);
    assert_eq!(stats.requests_rejected.load(Ordering::SeqCst), 2);
    assert_eq!(transport.attempts("https://flaky.test/3"), 4);
    assert_eq!(transport.attempts("https://flaky.test/5"), 4);
    assert!(transport.max_try_count_seen.load(Ordering::SeqCst) <= 3);
}

#[derive(Debug, thiserror::Error)]
#[error("parse failure on {0}")]
struct ParseFailure(String);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_error_is_returned_after_clean_shutdown() {
    let transport = Arc::new(ScriptedTransport::default());
    let hooks = Arc::new(RecordingHooks::default());
    let handler_probe = Arc::new(());

    let held = Arc::clone(&handler_probe);
    let crawler = builder()
        .transport(Arc::clone(&transport))
        .hooks(Arc::clone(&hooks))
        .start_requests((0..8).map(|i| req(&format!("https://bad.test/{}", i), "page")))
        .handler_fn("page", move |request, _| {
            let _keep = &held;
            Err(ParseFailure(request.url.to_string()).into())
        })
        .build()
        .unwrap();

    let err = run(crawler).await.unwrap_err();
    match err {
        CrawlError::Handler { tag, source, .. } => {
            assert_eq!(tag, "page");
            assert!(source.downcast_ref::<ParseFailure>().is_some());
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(hooks.shutdowns.load(Ordering::SeqCst), 1);
    // Every worker released its handles.
    assert_eq!(Arc::strong_count(&transport.probe), 1);
    assert_eq!(Arc::strong_count(&handler_probe), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_transient_fetch_failure_is_fatal() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.broken.insert("https://tls.test/".to_string(), ());

    let crawler = builder()
        .transport(Arc::clone(&transport))
        .start_requests(vec![req("https://tls.test/", "page")])
        .handler_fn("page", |_, _| Ok(HandlerOutput::none()))
        .build()
        .unwrap();

    let err = run(crawler).await.unwrap_err();
    assert!(matches!(err, CrawlError::Fetch { ref url, .. } if url == "https://tls.test/"));
    assert_eq!(transport.attempts("https://tls.test/"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn generator_failure_is_fatal() {
    let transport = Arc::new(ScriptedTransport::default());
    let source = stream::iter(vec![
        Ok(req("https://seed.test/1", "page")),
        Err(anyhow::anyhow!("seed list corrupted")),
        Ok(req("https://seed.test/2", "page")),
    ]);

    let crawler = builder()
        .transport(Arc::clone(&transport))
        .task_source(source)
        .handler_fn("page", |_, _| Ok(HandlerOutput::none()))
        .build()
        .unwrap();

    let err = run(crawler).await.unwrap_err();
    assert!(matches!(err, CrawlError::Generator(ref e) if e.to_string() == "seed list corrupted"));
    assert_eq!(transport.attempts("https://seed.test/2"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_yield_is_fatal() {
    let crawler = builder()
        .transport(ScriptedTransport::default())
        .start_requests(vec![req("https://yield.test/", "a")])
        .handler_fn("a", |request, _| {
            let good = Request::new(request.url.join("/ok").unwrap(), "b");
            Ok(HandlerOutput::lazy(
                vec![Ok(good), Err(anyhow::anyhow!("not a request"))].into_iter(),
            ))
        })
        .handler_fn("b", |_, _| Ok(HandlerOutput::none()))
        .build()
        .unwrap();

    let err = run(crawler).await.unwrap_err();
    assert!(matches!(err, CrawlError::MalformedRequest { ref tag, .. } if tag == "a"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn yielding_unregistered_tag_is_fatal() {
    let crawler = builder()
        .transport(ScriptedTransport::default())
        .start_requests(vec![req("https://yield.test/", "a")])
        .handler_fn("a", |request, _| {
            Ok(HandlerOutput::requests(vec![Request::new(
                request.url.clone(),
                "nobody",
            )]))
        })
        .build()
        .unwrap();

    let err = run(crawler).await.unwrap_err();
    assert!(matches!(err, CrawlError::MalformedRequest { ref source, .. } if source.to_string().contains("nobody")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unregistered_seed_tag_is_fatal() {
    let crawler = builder()
        .transport(ScriptedTransport::default())
        .start_requests(vec![req("https://seed.test/", "ghost")])
        .handler_fn("page", |_, _| Ok(HandlerOutput::none()))
        .build()
        .unwrap();

    let err = run(crawler).await.unwrap_err();
    assert!(matches!(err, CrawlError::UnknownHandler { ref tag } if tag == "ghost"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_panic_is_captured() {
    let crawler = builder()
        .transport(ScriptedTransport::default())
        .start_requests(vec![req("https://panic.test/", "page")])
        .handler_fn("page", |_, _| panic!("index out of range"))
        .build()
        .unwrap();

    let err = run(crawler).await.unwrap_err();
    assert!(matches!(
        err,
        CrawlError::WorkerPanic { role: "parser", ref message } if message == "index out of range"
    ));
}

/// Three levels of fan-out with flaky pages sprinkled in. Nothing may be lost
/// and the crawl must still stop on its own.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deep_crawl_loses_nothing() {
    const FAN_OUT: usize = 3;
    const DEPTH: u64 = 3;

    let transport = Arc::new(ScriptedTransport::default());
    for i in 0..FAN_OUT {
        transport
            .flaky
            .insert(format!("https://deep.test/{}", i), 1);
    }
    let seen = Arc::new(DashMap::new());

    let recorder = Arc::clone(&seen);
    let crawler = builder()
        // Both queues feed each other; keep their capacity above the tree
        // size so parsers and fetchers never block on one another.
        .network_workers(48)
        .parser_workers(2)
        .transport(Arc::clone(&transport))
        .start_requests(vec![req("https://deep.test/", "node").with_meta("depth", 0)])
        .handler_fn("node", move |request, _| {
            recorder.insert(request.url.to_string(), ());
            let depth = request.meta("depth").and_then(|d| d.as_u64()).unwrap_or(0);
            if depth == DEPTH {
                return Ok(HandlerOutput::none());
            }
            let parent = request.url.to_string();
            let children = (0..FAN_OUT).map(move |i| {
                let url = format!("{}{}{}", parent, if parent.ends_with('/') { "" } else { "/" }, i);
                Request::parse(&url, "node")
                    .map(|r| r.with_meta("depth", depth + 1))
                    .map_err(Into::into)
            });
            Ok(HandlerOutput::lazy(children))
        })
        .build()
        .unwrap();
    let stats = crawler.get_stats();

    run(crawler).await.unwrap();

    let expected = 1 + FAN_OUT + FAN_OUT.pow(2) + FAN_OUT.pow(3);
    assert_eq!(seen.len(), expected);
    assert_eq!(stats.responses_parsed.load(Ordering::SeqCst), expected);
    assert_eq!(stats.requests_retried.load(Ordering::SeqCst), FAN_OUT);
    assert_eq!(transport.total_attempts(), expected + FAN_OUT);
    assert_eq!(stats.requests_discarded.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn config_from_json_drives_the_run() {
    let config = CrawlerConfig::from_json_str(
        r#"{
            "network_worker_count": 2,
            "parser_worker_count": 1,
            "network_try_limit": 0,
            "parser_poll_timeout": 20,
            "control_poll_interval": 10
        }"#,
    )
    .unwrap();

    let transport = Arc::new(ScriptedTransport::default());
    transport.flaky.insert("https://once.test/".to_string(), 1);

    let crawler = CrawlerBuilder::new()
        .config(config)
        .transport(Arc::clone(&transport))
        .start_requests(vec![req("https://once.test/", "page")])
        .handler_fn("page", |_, _| Ok(HandlerOutput::none()))
        .build()
        .unwrap();
    let stats = crawler.get_stats();

    run(crawler).await.unwrap();

    // A limit of zero means the first transient failure rejects.
    assert_eq!(transport.attempts("https://once.test/"), 1);
    assert_eq!(stats.requests_rejected.load(Ordering::SeqCst), 1);
}

/// Parsers time out on the result queue constantly; no pair may be lost to a
/// timeout firing while a pair is being handed over.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tiny_poll_timeout_loses_no_responses() {
    const SEEDS: usize = 3_000;

    let crawler = builder()
        .parser_poll_timeout(Duration::from_micros(2))
        .control_poll_interval(Duration::from_millis(1))
        .transport(ScriptedTransport::default())
        .start_requests((0..SEEDS).map(|i| req(&format!("https://many.test/{}", i), "page")))
        .handler_fn("page", |_, _| Ok(HandlerOutput::none()))
        .build()
        .unwrap();
    let stats = crawler.get_stats();

    run(crawler).await.unwrap();

    assert_eq!(stats.fetches_succeeded.load(Ordering::SeqCst), SEEDS);
    assert_eq!(stats.responses_parsed.load(Ordering::SeqCst), SEEDS);
}

/// One parser is busy in a slow handler while the other parks. The busy one
/// then yields more requests than the queues and the network pool can hold,
/// so the parked parser must be woken to drain results.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_handler_yielding_burst_does_not_wedge_drain() {
    const LEAVES: usize = 20;
    let transport = Arc::new(ScriptedTransport::default());

    let crawler = builder()
        .network_workers(1)
        .parser_workers(2)
        .transport(Arc::clone(&transport))
        .start_requests(vec![req("https://burst.test/", "a")])
        .handler_fn("a", |request, _| {
            std::thread::sleep(Duration::from_millis(300));
            let base = request.url.clone();
            Ok(HandlerOutput::requests(
                (0..LEAVES)
                    .map(move |i| Request::new(base.join(&format!("/leaf/{}", i)).unwrap(), "b"))
                    .collect::<Vec<_>>(),
            ))
        })
        .handler_fn("b", |_, _| Ok(HandlerOutput::none()))
        .build()
        .unwrap();
    let stats = crawler.get_stats();

    run(crawler).await.unwrap();

    assert_eq!(stats.responses_parsed.load(Ordering::SeqCst), LEAVES + 1);
    assert_eq!(transport.total_attempts(), LEAVES + 1);
}

/// A blocking handler must not hold up fetches, even on a single-threaded
/// runtime.
#[tokio::test]
async fn blocking_handler_leaves_runtime_free() {
    const PAGES: usize = 5;
    let transport = Arc::new(ScriptedTransport::default());
    let fetched_meanwhile = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let watched = Arc::clone(&transport);
    let flag = Arc::clone(&fetched_meanwhile);
    // A second parser keeps the result queue moving while the first blocks.
    let crawler = builder()
        .network_workers(1)
        .parser_workers(2)
        .transport(Arc::clone(&transport))
        .start_requests(
            std::iter::once(req("https://slow.test/", "slow"))
                .chain((0..PAGES).map(|i| req(&format!("https://fast.test/{}", i), "page"))),
        )
        .handler_fn("slow", move |_, _| {
            let deadline = std::time::Instant::now() + Duration::from_secs(3);
            while std::time::Instant::now() < deadline {
                if watched.total_attempts() == PAGES + 1 {
                    flag.store(true, Ordering::SeqCst);
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(HandlerOutput::none())
        })
        .handler_fn("page", |_, _| Ok(HandlerOutput::none()))
        .build()
        .unwrap();
    let stats = crawler.get_stats();

    run(crawler).await.unwrap();

    assert!(fetched_meanwhile.load(Ordering::SeqCst));
    assert_eq!(stats.responses_parsed.load(Ordering::SeqCst), PAGES + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn injected_requests_are_crawled() {
    let transport = Arc::new(ScriptedTransport::default());
    let crawler = builder()
        .transport(Arc::clone(&transport))
        .handler_fn("page", |_, _| Ok(HandlerOutput::none()))
        .build()
        .unwrap();
    let stats = crawler.get_stats();
    let injector = crawler.task_injector();

    injector.add_task(req("https://injected.test/1", "page")).await.unwrap();
    injector.add_task(req("https://injected.test/2", "page")).await.unwrap();
    let err = injector
        .add_task(req("https://injected.test/3", "ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, CrawlError::UnknownHandler { ref tag } if tag == "ghost"));

    run(crawler).await.unwrap();

    assert_eq!(transport.attempts("https://injected.test/1"), 1);
    assert_eq!(transport.attempts("https://injected.test/2"), 1);
    assert_eq!(stats.responses_parsed.load(Ordering::SeqCst), 2);

    assert!(!injector.is_accepting());
    let err = injector
        .add_task(req("https://injected.test/4", "page"))
        .await
        .unwrap_err();
    assert!(matches!(err, CrawlError::Stopped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requests_injected_mid_run_are_crawled() {
    let transport = Arc::new(ScriptedTransport::default());
    let crawler = builder()
        .transport(Arc::clone(&transport))
        .start_requests(vec![req("https://seed.test/", "slow")])
        .handler_fn("slow", |_, _| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(HandlerOutput::none())
        })
        .handler_fn("page", |_, _| Ok(HandlerOutput::none()))
        .build()
        .unwrap();
    let stats = crawler.get_stats();
    let injector = crawler.task_injector();

    let late = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        injector.add_task(req("https://late.test/", "page")).await
    });

    run(crawler).await.unwrap();
    late.await.unwrap().unwrap();

    assert_eq!(transport.attempts("https://late.test/"), 1);
    assert_eq!(stats.responses_parsed.load(Ordering::SeqCst), 2);
}
