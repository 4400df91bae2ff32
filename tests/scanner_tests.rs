use async_trait::async_trait;
use cfscan_rs::config::{ConfigOverrides, TestConfig, TestConfigBuilder};
use cfscan_rs::error::ScanError;
use cfscan_rs::probe::{FrontingOutcome, Probe, ProbeError, Transfer};
use cfscan_rs::scanner::{scan_candidates, scan_candidates_with_cancel};
use cfscan_rs::store::{load_records, ResultsStore, INTERIM_RESULTS_FILE};
use cfscan_rs::subnets::{parse_subnets_str, CandidateSet};
use cfscan_rs::tester::test_candidate;
use cfscan_rs::types::FailStage;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Deterministic stand-in for the network.
#[derive(Default)]
struct SyntheticNetwork {
    broken_fronting: HashSet<Ipv4Addr>,
    crashes_on: Option<Ipv4Addr>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: Mutex<Vec<Ipv4Addr>>,
}

impl SyntheticNetwork {
    fn healthy() -> Self {
        Self::default()
    }

    fn with_broken_fronting(ip: Ipv4Addr) -> Self {
        Self {
            broken_fronting: HashSet::from([ip]),
            ..Self::default()
        }
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Probe for SyntheticNetwork {
    async fn fronting(&self, ip: Ipv4Addr, _cfg: &TestConfig) -> Result<FrontingOutcome, ProbeError> {
        self.started.lock().unwrap().push(ip);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.crashes_on == Some(ip) {
            panic!("synthetic crash while testing {ip}");
        }

        if self.broken_fronting.contains(&ip) {
            // Edge answers, but not for the fronted host.
            return Err(ProbeError::HttpStatus(421));
        }
        Ok(FrontingOutcome {
            ttfb: Duration::from_millis(80),
        })
    }

    async fn download(&self, _ip: Ipv4Addr, _cfg: &TestConfig) -> Result<Transfer, ProbeError> {
        Ok(Transfer {
            latency: Some(Duration::from_millis(90)),
            elapsed: Duration::from_secs(1),
            bytes: 250_000,
        })
    }

    async fn upload(&self, _ip: Ipv4Addr, _cfg: &TestConfig) -> Result<Transfer, ProbeError> {
        Ok(Transfer {
            latency: Some(Duration::from_millis(70)),
            elapsed: Duration::from_secs(1),
            bytes: 120_000,
        })
    }
}

fn config(n_tries: u32) -> Arc<TestConfig> {
    let cfg = TestConfigBuilder::new()
        .overrides(ConfigOverrides {
            n_tries: Some(n_tries),
            do_upload_test: true,
            no_vpn: true,
            ..Default::default()
        })
        .build()
        .unwrap();
    Arc::new(cfg)
}

fn store_path(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("cfscan-rs-{}-{test}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(INTERIM_RESULTS_FILE)
}

fn slash_30() -> CandidateSet {
    CandidateSet::new(&parse_subnets_str("1.1.1.0/30").unwrap())
}

#[tokio::test]
async fn all_candidates_accepted_with_every_try_recorded() {
    let path = store_path("all-accepted");
    let store = ResultsStore::open(&path, 2).unwrap();
    let probe = Arc::new(SyntheticNetwork::healthy());

    let summary = scan_candidates(slash_30(), config(2), probe, store, 2)
        .await
        .unwrap();
    assert_eq!(summary.tested, 4);
    assert_eq!(summary.accepted, 4);
    assert_eq!(summary.rejected, 0);
    assert!(!summary.cancelled);

    let records = load_records(&path, 2).unwrap();
    assert_eq!(records.len(), 4);
    for rec in &records {
        assert!(rec.accepted);
        assert_eq!(rec.tries.len(), 2);
        assert!(rec.tries.iter().all(|t| t.ul_speed.is_some()));
    }
    let ips: HashSet<_> = records.iter().map(|r| r.ip).collect();
    assert_eq!(ips.len(), 4);
}

#[tokio::test]
async fn broken_fronting_rejects_only_that_candidate() {
    let bad = Ipv4Addr::new(1, 1, 1, 2);
    let path = store_path("one-broken");
    let store = ResultsStore::open(&path, 2).unwrap();
    let probe = Arc::new(SyntheticNetwork::with_broken_fronting(bad));

    let summary = scan_candidates(slash_30(), config(2), probe, store, 2)
        .await
        .unwrap();
    assert_eq!(summary.accepted, 3);
    assert_eq!(summary.rejected, 1);

    let records = load_records(&path, 2).unwrap();
    assert_eq!(records.len(), 4);
    for rec in records {
        if rec.ip == bad {
            assert!(!rec.accepted);
            assert_eq!(rec.fail_stage, Some(FailStage::Fronting));
            assert_eq!(rec.tries.len(), 2);
            assert!(rec.tries.iter().all(|t| t.dl_speed.is_none()));
        } else {
            assert!(rec.accepted);
        }
    }
}

#[tokio::test]
async fn pool_never_exceeds_thread_count() {
    let path = store_path("bounded");
    let store = ResultsStore::open(&path, 1).unwrap();
    let probe = Arc::new(SyntheticNetwork::with_delay(Duration::from_millis(20)));
    let candidates = CandidateSet::new(&parse_subnets_str("10.9.0.0/28").unwrap());

    let summary = scan_candidates(candidates, config(1), probe.clone(), store, 3)
        .await
        .unwrap();
    assert_eq!(summary.tested, 16);
    let max = probe.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 3, "observed {max} concurrent evaluations");
    assert!(max >= 2, "pool never ran in parallel");
}

#[tokio::test]
async fn single_thread_scans_in_input_order() {
    let path = store_path("sequential");
    let store = ResultsStore::open(&path, 1).unwrap();
    let probe = Arc::new(SyntheticNetwork::with_delay(Duration::from_millis(2)));
    let candidates = CandidateSet::new(&parse_subnets_str("10.9.1.0/29").unwrap());
    let expected: Vec<_> = candidates.iter().collect();

    scan_candidates(candidates, config(1), probe.clone(), store, 1)
        .await
        .unwrap();
    assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(*probe.started.lock().unwrap(), expected);
}

#[tokio::test]
async fn rerun_skips_recorded_and_try_change_rebuilds() {
    let path = store_path("resume");
    let store = ResultsStore::open(&path, 1).unwrap();
    scan_candidates(slash_30(), config(1), Arc::new(SyntheticNetwork::healthy()), store, 2)
        .await
        .unwrap();

    let reopened = ResultsStore::open(&path, 1).unwrap();
    assert_eq!(reopened.recorded().len(), 4);
    let probe = Arc::new(SyntheticNetwork::healthy());
    let summary = scan_candidates(slash_30(), config(1), probe.clone(), reopened, 2)
        .await
        .unwrap();
    assert_eq!(summary.skipped, 4);
    assert_eq!(summary.tested, 0);
    assert!(probe.started.lock().unwrap().is_empty());
    assert_eq!(load_records(&path, 1).unwrap().len(), 4);

    let rebuilt = ResultsStore::open(&path, 2).unwrap();
    assert!(rebuilt.recorded().is_empty());
    assert!(load_records(&path, 2).unwrap().is_empty());
    assert!(load_records(&path, 1).is_err());
}

#[tokio::test]
async fn cancelled_run_dequeues_nothing_more() {
    let path = store_path("cancelled");
    let store = ResultsStore::open(&path, 1).unwrap();
    let probe = Arc::new(SyntheticNetwork::healthy());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = scan_candidates_with_cancel(slash_30(), config(1), probe.clone(), store, 2, cancel)
        .await
        .unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.tested, 0);
    assert!(probe.started.lock().unwrap().is_empty());
}

#[tokio::test]
async fn zero_threads_or_mismatched_store_is_rejected() {
    let path = store_path("invalid");
    let store = ResultsStore::open(&path, 1).unwrap();
    let err = scan_candidates(slash_30(), config(1), Arc::new(SyntheticNetwork::healthy()), store, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidConfig(_)));

    let store = ResultsStore::open(&path, 1).unwrap();
    let err = scan_candidates(slash_30(), config(3), Arc::new(SyntheticNetwork::healthy()), store, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidConfig(_)));
}

#[tokio::test]
async fn crashed_worker_fails_the_run() {
    let path = store_path("crashed");
    let store = ResultsStore::open(&path, 1).unwrap();
    let probe = Arc::new(SyntheticNetwork {
        crashes_on: Some(Ipv4Addr::new(1, 1, 1, 1)),
        ..SyntheticNetwork::default()
    });

    let err = scan_candidates(slash_30(), config(1), probe, store, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::WorkerFailed(_)), "got {err:?}");
}

#[tokio::test]
async fn rescanning_reproduces_the_same_verdict() {
    let probe = SyntheticNetwork::healthy();
    let cfg = config(3);
    let ip = Ipv4Addr::new(1, 1, 1, 1);
    let first = test_candidate(&probe, ip, &cfg).await;
    let second = test_candidate(&probe, ip, &cfg).await;
    assert_eq!(first, second);
    assert!(first.accepted);
}
