use std::fmt;
use std::net::Ipv4Addr;

/// Protocol stage at which a try first failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailStage {
    TransportError,
    Fronting,
    Latency,
    Download,
    Upload,
}

impl FailStage {
    pub fn as_str(self) -> &'static str {
        match self {
            FailStage::TransportError => "transport-error",
            FailStage::Fronting => "fronting",
            FailStage::Latency => "latency",
            FailStage::Download => "download",
            FailStage::Upload => "upload",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transport-error" => Some(FailStage::TransportError),
            "fronting" => Some(FailStage::Fronting),
            "latency" => Some(FailStage::Latency),
            "download" => Some(FailStage::Download),
            "upload" => Some(FailStage::Upload),
            _ => None,
        }
    }
}

impl fmt::Display for FailStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics measured during one try. Times and latencies are in seconds,
/// speeds in KB/s (1 KB = 1000 bytes). `None` means the stage was not reached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TryMetrics {
    pub latency: Option<f64>,
    pub dl_latency: Option<f64>,
    pub dl_speed: Option<f64>,
    pub dl_time: Option<f64>,
    pub ul_latency: Option<f64>,
    pub ul_speed: Option<f64>,
    pub ul_time: Option<f64>,
    pub fail_stage: Option<FailStage>,
}

impl TryMetrics {
    pub fn passed(&self) -> bool {
        self.fail_stage.is_none()
    }
}

/// Outcome of evaluating one candidate across all configured tries.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub ip: Ipv4Addr,
    pub tries: Vec<TryMetrics>,
    pub accepted: bool,
    /// Stage of the first failing try, if any.
    pub fail_stage: Option<FailStage>,
}

impl Verdict {
    /// Build a verdict from per-try records. Accepted only if every try passed.
    pub fn from_tries(ip: Ipv4Addr, tries: Vec<TryMetrics>) -> Self {
        let fail_stage = tries.iter().find_map(|t| t.fail_stage);
        let accepted = !tries.is_empty() && fail_stage.is_none();
        Self {
            ip,
            tries,
            accepted,
            fail_stage,
        }
    }

    pub fn avg_latency(&self) -> Option<f64> {
        average(self.tries.iter().map(|t| t.latency))
    }

    pub fn avg_dl_latency(&self) -> Option<f64> {
        average(self.tries.iter().map(|t| t.dl_latency))
    }

    pub fn avg_dl_speed(&self) -> Option<f64> {
        average(self.tries.iter().map(|t| t.dl_speed))
    }

    pub fn avg_ul_latency(&self) -> Option<f64> {
        average(self.tries.iter().map(|t| t.ul_latency))
    }

    pub fn avg_ul_speed(&self) -> Option<f64> {
        average(self.tries.iter().map(|t| t.ul_speed))
    }
}

/// Mean over the measured values only.
fn average(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, n) = values
        .flatten()
        .fold((0.0, 0u32), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / f64::from(n))
}

/// Aggregate counters for a finished (or cancelled) run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Candidates taken off the queue, skipped ones included.
    pub seen: u64,
    pub skipped: u64,
    pub tested: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub cancelled: bool,
}
