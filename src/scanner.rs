use crate::config::TestConfig;
use crate::error::ScanError;
use crate::probe::Probe;
use crate::sink::{spawn_sink, ResultsSink};
use crate::store::ResultsStore;
use crate::tester;
use crate::types::{ScanSummary, Verdict};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Evaluate candidates with a pool of `threads` workers, appending each verdict
/// to `store` as soon as it completes.
///
/// - Exactly `threads` workers pull from one shared queue in input order.
/// - Candidates already recorded in `store` are skipped.
/// - Verdicts reach the store in completion order, not input order.
/// - Per-candidate failures are part of the verdict; only store failures and
///   invalid arguments end the run with an error.
pub async fn scan_candidates<I, P>(
    candidates: I,
    cfg: Arc<TestConfig>,
    probe: Arc<P>,
    store: ResultsStore,
    threads: usize,
) -> Result<ScanSummary, ScanError>
where
    I: IntoIterator<Item = Ipv4Addr>,
    I::IntoIter: Send + 'static,
    P: Probe + ?Sized + 'static,
{
    scan_candidates_internal(candidates, cfg, probe, store, threads, None, None).await
}

/// Same as [`scan_candidates`], but stops dequeuing once `cancel` fires. The
/// token is also cancelled internally when the store or a worker fails.
pub async fn scan_candidates_with_cancel<I, P>(
    candidates: I,
    cfg: Arc<TestConfig>,
    probe: Arc<P>,
    store: ResultsStore,
    threads: usize,
    cancel: CancellationToken,
) -> Result<ScanSummary, ScanError>
where
    I: IntoIterator<Item = Ipv4Addr>,
    I::IntoIter: Send + 'static,
    P: Probe + ?Sized + 'static,
{
    scan_candidates_internal(candidates, cfg, probe, store, threads, Some(cancel), None).await
}

/// Live counters a caller can poll while a scan runs.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    pub total: Arc<AtomicU64>,
    pub seen: Arc<AtomicU64>,
    pub skipped: Arc<AtomicU64>,
    pub tested: Arc<AtomicU64>,
    pub accepted: Arc<AtomicU64>,
    exhausted: Arc<AtomicBool>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self::with_total(0)
    }

    /// `total` is only used for progress reporting.
    pub fn with_total(total: u64) -> Self {
        Self {
            total: Arc::new(AtomicU64::new(total)),
            seen: Arc::new(AtomicU64::new(0)),
            skipped: Arc::new(AtomicU64::new(0)),
            tested: Arc::new(AtomicU64::new(0)),
            accepted: Arc::new(AtomicU64::new(0)),
            exhausted: Arc::new(AtomicBool::new(false)),
        }
    }

    fn record(&self, verdict: &Verdict) -> u64 {
        if verdict.accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        }
        self.tested.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn summary(&self, cancelled: bool) -> ScanSummary {
        let tested = self.tested.load(Ordering::Relaxed);
        let accepted = self.accepted.load(Ordering::Relaxed);
        ScanSummary {
            seen: self.seen.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            tested,
            accepted,
            rejected: tested - accepted,
            cancelled,
        }
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn scan_candidates_with_shared<I, P>(
    candidates: I,
    cfg: Arc<TestConfig>,
    probe: Arc<P>,
    store: ResultsStore,
    threads: usize,
    cancel: CancellationToken,
    shared: SharedProgress,
) -> Result<ScanSummary, ScanError>
where
    I: IntoIterator<Item = Ipv4Addr>,
    I::IntoIter: Send + 'static,
    P: Probe + ?Sized + 'static,
{
    scan_candidates_internal(
        candidates,
        cfg,
        probe,
        store,
        threads,
        Some(cancel),
        Some(shared),
    )
    .await
}

async fn scan_candidates_internal<I, P>(
    candidates: I,
    cfg: Arc<TestConfig>,
    probe: Arc<P>,
    store: ResultsStore,
    threads: usize,
    cancel_opt: Option<CancellationToken>,
    shared_opt: Option<SharedProgress>,
) -> Result<ScanSummary, ScanError>
where
    I: IntoIterator<Item = Ipv4Addr>,
    I::IntoIter: Send + 'static,
    P: Probe + ?Sized + 'static,
{
    if threads == 0 {
        return Err(ScanError::InvalidConfig("threads must be at least 1".into()));
    }
    if store.n_tries() != cfg.n_tries {
        return Err(ScanError::InvalidConfig(format!(
            "results store holds {} tries per candidate, configuration asks for {}",
            store.n_tries(),
            cfg.n_tries
        )));
    }

    let progress = shared_opt.unwrap_or_default();
    let cancel = cancel_opt.unwrap_or_default();
    let skip = Arc::new(store.recorded().clone());
    let (sink, writer) = spawn_sink(store, threads * 2, cancel.clone());
    let queue = Arc::new(Mutex::new(candidates.into_iter()));

    let mut set = JoinSet::new();
    for id in 0..threads {
        let worker = Worker {
            id,
            queue: queue.clone(),
            skip: skip.clone(),
            cfg: cfg.clone(),
            probe: probe.clone(),
            sink: sink.clone(),
            cancel: cancel.clone(),
            progress: progress.clone(),
        };
        set.spawn(worker.run());
    }
    // Workers hold the only remaining senders; the writer stops once they finish.
    drop(sink);

    // A dead worker leaves its candidates unevaluated, so the run cannot
    // report success.
    let mut worker_failure = None;
    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "worker task failed, stopping scan");
            cancel.cancel();
            worker_failure.get_or_insert_with(|| e.to_string());
        }
    }

    match writer.await {
        Ok(Ok(_store)) => {}
        Ok(Err(e)) => return Err(e),
        Err(e) => {
            error!(error = %e, "results writer task failed");
            return Err(ScanError::SinkClosed);
        }
    }
    if let Some(reason) = worker_failure {
        return Err(ScanError::WorkerFailed(reason));
    }

    let cancelled = cancel.is_cancelled() && !progress.exhausted.load(Ordering::Relaxed);
    Ok(progress.summary(cancelled))
}

struct Worker<I, P: ?Sized> {
    id: usize,
    queue: Arc<Mutex<I>>,
    skip: Arc<HashSet<Ipv4Addr>>,
    cfg: Arc<TestConfig>,
    probe: Arc<P>,
    sink: ResultsSink,
    cancel: CancellationToken,
    progress: SharedProgress,
}

impl<I, P> Worker<I, P>
where
    I: Iterator<Item = Ipv4Addr>,
    P: Probe + ?Sized,
{
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let next = self.queue.lock().await.next();
            let Some(ip) = next else {
                self.progress.exhausted.store(true, Ordering::Relaxed);
                break;
            };
            self.progress.seen.fetch_add(1, Ordering::Relaxed);
            if self.skip.contains(&ip) {
                self.progress.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(%ip, "already recorded, skipping");
                continue;
            }

            // Dropping the in-flight test on cancellation releases its sockets;
            // the candidate stays unrecorded and is retested on the next run.
            let verdict = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(worker = self.id, %ip, "cancelled mid-candidate");
                    break;
                }
                v = tester::test_candidate(self.probe.as_ref(), ip, &self.cfg) => v,
            };

            let done = self.progress.record(&verdict);
            let total = self.progress.total.load(Ordering::Relaxed);
            if verdict.accepted {
                info!(
                    %ip,
                    done,
                    total,
                    latency = verdict.avg_latency().unwrap_or_default(),
                    dl_speed = verdict.avg_dl_speed().unwrap_or_default(),
                    "accepted"
                );
            } else {
                info!(
                    %ip,
                    done,
                    total,
                    fail_stage = %verdict.fail_stage.map(|s| s.as_str()).unwrap_or("none"),
                    "rejected"
                );
            }

            if self.sink.submit(verdict).await.is_err() {
                break;
            }
        }
        debug!(worker = self.id, "worker finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{FrontingOutcome, ProbeError, Transfer};
    use crate::store::INTERIM_RESULTS_FILE;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Probe for Counting {
        async fn fronting(&self, _ip: Ipv4Addr, _cfg: &TestConfig) -> Result<FrontingOutcome, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(FrontingOutcome {
                ttfb: Duration::from_millis(50),
            })
        }

        async fn download(&self, _ip: Ipv4Addr, _cfg: &TestConfig) -> Result<Transfer, ProbeError> {
            Ok(Transfer {
                latency: Some(Duration::from_millis(50)),
                elapsed: Duration::from_secs(1),
                bytes: 500_000,
            })
        }

        async fn upload(&self, _ip: Ipv4Addr, _cfg: &TestConfig) -> Result<Transfer, ProbeError> {
            unreachable!("upload disabled")
        }
    }

    #[tokio::test]
    async fn store_write_failure_stops_the_scan_with_an_error() {
        let dir = std::env::temp_dir().join(format!("cfscan-rs-sinkfail-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        let mut store = ResultsStore::open(dir.join(INTERIM_RESULTS_FILE), 1).unwrap();
        store.make_read_only().unwrap();

        let probe = Arc::new(Counting::default());
        let candidates = (0..64u8).map(|i| Ipv4Addr::new(10, 20, 0, i)).collect::<Vec<_>>();
        let err = scan_candidates(candidates, Arc::new(TestConfig::default()), probe.clone(), store, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Io { .. }), "got {err:?}");
        let calls = probe.calls.load(Ordering::SeqCst);
        assert!(calls < 64, "scan kept dequeuing after the store failed ({calls} calls)");
        std::fs::remove_dir_all(&dir).ok();
    }
}
