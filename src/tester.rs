//! Per-candidate test protocol.
//!
//! A try runs fronting, latency, download and (optionally) upload in that
//! order and stops at the first failing stage. A candidate gets `n_tries`
//! sequential tries and is accepted only if all of them pass; every try runs
//! even after a failure so the verdict carries the full set of metrics.

use crate::config::TestConfig;
use crate::probe::{Probe, ProbeError, Transfer};
use crate::types::{FailStage, TryMetrics, Verdict};
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time;
use tracing::debug;

/// Extra room on top of a stage's own timeouts before the outer guard fires.
const GUARD_SLACK: Duration = Duration::from_millis(500);

/// Evaluate one candidate. Never fails: network problems become fail stages.
pub async fn test_candidate<P>(probe: &P, ip: Ipv4Addr, cfg: &TestConfig) -> Verdict
where
    P: Probe + ?Sized,
{
    let mut tries = Vec::with_capacity(cfg.n_tries as usize);
    for attempt in 1..=cfg.n_tries {
        let metrics = run_try(probe, ip, cfg).await;
        debug!(%ip, attempt, fail_stage = ?metrics.fail_stage, "try finished");
        tries.push(metrics);
    }
    Verdict::from_tries(ip, tries)
}

/// One pass through the staged checks.
pub async fn run_try<P>(probe: &P, ip: Ipv4Addr, cfg: &TestConfig) -> TryMetrics
where
    P: Probe + ?Sized,
{
    let mut m = TryMetrics::default();

    let fronting_guard = cfg.startup_timeout() + cfg.fronting_timeout();
    let fronting = match guarded(fronting_guard, probe.fronting(ip, cfg)).await {
        Ok(f) => f,
        Err(e) => return fail(m, ip, classify(&e, FailStage::Fronting), Some(&e)),
    };
    let latency = fronting.ttfb.as_secs_f64();
    m.latency = Some(latency);
    if latency > cfg.max_dl_latency {
        return fail(m, ip, FailStage::Latency, None);
    }

    let dl_guard = cfg.startup_timeout()
        + cfg.fronting_timeout()
        + cfg.dl_latency_timeout()
        + cfg.dl_time_budget();
    let dl = match guarded(dl_guard, probe.download(ip, cfg)).await {
        Ok(t) => t,
        Err(e) => return fail(m, ip, classify(&e, FailStage::Download), Some(&e)),
    };
    record_download(&mut m, &dl);
    if let Some(stage) = judge(&dl, cfg.max_dl_latency, cfg.min_dl_speed, FailStage::Download) {
        return fail(m, ip, stage, None);
    }

    if cfg.do_upload_test {
        let ul_guard = cfg.startup_timeout()
            + cfg.fronting_timeout()
            + cfg.ul_time_budget()
            + cfg.ul_latency_timeout();
        let ul = match guarded(ul_guard, probe.upload(ip, cfg)).await {
            Ok(t) => t,
            Err(e) => {
                // A late response still leaves the body figures worth keeping.
                if let Some(t) = e.measured() {
                    record_upload(&mut m, t);
                }
                return fail(m, ip, classify(&e, FailStage::Upload), Some(&e));
            }
        };
        record_upload(&mut m, &ul);
        if let Some(stage) = judge(&ul, cfg.max_ul_latency, cfg.min_ul_speed, FailStage::Upload) {
            return fail(m, ip, stage, None);
        }
    }

    m
}

/// Outer deadline so a stalled probe cannot hold a worker past its budget.
async fn guarded<T, F>(limit: Duration, fut: F) -> Result<T, StageError>
where
    F: Future<Output = Result<T, ProbeError>>,
{
    match time::timeout(limit + GUARD_SLACK, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(StageError::Probe(e)),
        Err(_) => Err(StageError::Stalled),
    }
}

#[derive(Debug)]
enum StageError {
    Probe(ProbeError),
    Stalled,
}

impl StageError {
    /// Transfer figures the probe had already taken when it gave up.
    fn measured(&self) -> Option<&Transfer> {
        match self {
            StageError::Probe(ProbeError::LatencyExceeded { transfer, .. }) => transfer.as_ref(),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageError::Probe(e) => e.fmt(f),
            StageError::Stalled => f.write_str("stage exceeded its time budget"),
        }
    }
}

fn classify(err: &StageError, stage: FailStage) -> FailStage {
    match err {
        StageError::Probe(e) if e.is_transport() => FailStage::TransportError,
        StageError::Probe(ProbeError::LatencyExceeded { .. }) => FailStage::Latency,
        _ => stage,
    }
}

/// Latency first, then throughput.
fn judge(t: &Transfer, max_latency: f64, min_speed: f64, stage: FailStage) -> Option<FailStage> {
    if t.latency.is_some_and(|l| l.as_secs_f64() > max_latency) {
        return Some(FailStage::Latency);
    }
    if t.speed_kbps() < min_speed {
        return Some(stage);
    }
    None
}

fn record_download(m: &mut TryMetrics, t: &Transfer) {
    m.dl_latency = t.latency.map(|l| l.as_secs_f64());
    m.dl_time = Some(t.elapsed.as_secs_f64());
    m.dl_speed = Some(t.speed_kbps());
}

fn record_upload(m: &mut TryMetrics, t: &Transfer) {
    m.ul_latency = t.latency.map(|l| l.as_secs_f64());
    m.ul_time = Some(t.elapsed.as_secs_f64());
    m.ul_speed = Some(t.speed_kbps());
}

fn fail(mut m: TryMetrics, ip: Ipv4Addr, stage: FailStage, err: Option<&StageError>) -> TryMetrics {
    match err {
        Some(e) => debug!(%ip, %stage, error = %e, "stage failed"),
        None => debug!(%ip, %stage, "threshold not met"),
    }
    m.fail_stage = Some(stage);
    m
}
