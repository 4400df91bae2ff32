use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use cfscan_rs::config::{ConfigOverrides, TestConfig, TestConfigBuilder};
use cfscan_rs::logging;
use cfscan_rs::probe::HttpsProbe;
use cfscan_rs::scanner::{self, SharedProgress};
use cfscan_rs::store::{ResultsStore, INTERIM_RESULTS_FILE};
use cfscan_rs::subnets::{self, CandidateSet};
use cfscan_rs::types::ScanSummary;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Directory reserved for VPN client configuration.
const CONFIG_DIR: &str = "config";

/// Find CloudFlare edge IPs that pass domain fronting, latency and throughput checks.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "cfscan-rs",
    version,
    about = "CloudFlare edge IP scanner: fronting, latency and throughput checks with resumable results.",
    long_about = None
)]
struct Cli {
    /// Number of concurrent workers.
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Client config file (JSON with id, host, port, serverName, path).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Test without creating VPN connections.
    #[arg(long, default_value_t = false)]
    novpn: bool,

    /// File of subnets, one `a.b.c.d/n` or `a.b.c.d` per line. If omitted, scan the built-in CloudFlare ranges.
    #[arg(long)]
    subnets: Option<PathBuf>,

    /// Run the upload throughput stage.
    #[arg(long = "upload-test", default_value_t = false)]
    upload_test: bool,

    /// Tries per IP. An IP is accepted only if every try passes.
    #[arg(long = "tries", default_value_t = 1)]
    tries: u32,

    /// Minimum acceptable download speed (KB/s).
    #[arg(long = "download-speed", default_value_t = 50.0)]
    download_speed: f64,

    /// Minimum acceptable upload speed (KB/s) [default: 50]. Setting it enables the upload stage.
    #[arg(long = "upload-speed")]
    upload_speed: Option<f64>,

    /// Maximum time spent on each download, excluding request latency (s).
    #[arg(long = "download-time", default_value_t = 2.0)]
    download_time: f64,

    /// Maximum time spent on each upload, excluding request latency (s).
    #[arg(long = "upload-time", default_value_t = 2.0)]
    upload_time: f64,

    /// Maximum wait for the fronting response (s).
    #[arg(long = "fronting-timeout", default_value_t = 1.0)]
    fronting_timeout: f64,

    /// Maximum allowed download latency (s).
    #[arg(long = "download-latency", default_value_t = 2.0)]
    download_latency: f64,

    /// Maximum allowed upload latency (s).
    #[arg(long = "upload-latency", default_value_t = 2.0)]
    upload_latency: f64,

    /// Maximum wait for connection startup (s).
    #[arg(long = "startprocess-timeout", default_value_t = 5)]
    startprocess_timeout: u64,

    /// Local port to bind outgoing connections to (0 = ephemeral).
    #[arg(long = "local-port", default_value_t = 0)]
    local_port: u16,

    /// Directory holding the interim results store.
    #[arg(long = "results-dir", default_value = "result")]
    results_dir: PathBuf,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            local_port: Some(self.local_port),
            do_upload_test: self.upload_test,
            min_dl_speed: Some(self.download_speed),
            min_ul_speed: self.upload_speed,
            max_dl_time: Some(self.download_time),
            max_ul_time: Some(self.upload_time),
            max_dl_latency: Some(self.download_latency),
            max_ul_latency: Some(self.upload_latency),
            fronting_timeout: Some(self.fronting_timeout),
            startprocess_timeout: Some(self.startprocess_timeout as f64),
            n_tries: Some(self.tries),
            no_vpn: self.novpn,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    println!(
        "cfscan-rs {} ({}/{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    if !cli.novpn {
        fs::create_dir_all(CONFIG_DIR)
            .with_context(|| format!("failed to create directory: {CONFIG_DIR}"))?;
    }
    fs::create_dir_all(&cli.results_dir)
        .with_context(|| format!("failed to create directory: {}", cli.results_dir.display()))?;

    let mut builder = TestConfigBuilder::new().overrides(cli.overrides());
    if let Some(path) = &cli.config {
        builder = builder.config_file(path);
    }
    let cfg = builder.build().context("failed to build test configuration")?;
    print_config(&cli, &cfg);

    let (candidates, store, store_path) = open_inputs(&cli, &cfg)?;

    println!("Total Threads : {}", cli.threads);
    println!("Starting to scan {} IPs.", candidates.total());
    println!("---------------------------");

    let probe = Arc::new(HttpsProbe::new().context("failed to initialize TLS")?);

    // Ctrl-C stops dequeuing; verdicts already written stay in the store.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing up");
            cancel_ctrlc.cancel();
        }
    });

    let progress = SharedProgress::with_total(candidates.total());
    let summary = scanner::scan_candidates_with_shared(
        candidates,
        Arc::new(cfg),
        probe,
        store,
        cli.threads,
        cancel,
        progress,
    )
    .await?;

    print_summary(&summary);
    println!("Results written in: {}", store_path.display());
    Ok(())
}

/// Load the candidates, then open the store. Opening may rebuild the store, so
/// it only happens once the subnet input has been read.
fn open_inputs(cli: &Cli, cfg: &TestConfig) -> Result<(CandidateSet, ResultsStore, PathBuf)> {
    let nets = match &cli.subnets {
        Some(path) => subnets::load_subnets_from_path(path)
            .with_context(|| format!("failed to load subnets from {}", path.display()))?,
        None => {
            info!("no subnet file given, using built-in CloudFlare ranges");
            subnets::cloudflare_ranges()
        }
    };
    let candidates = CandidateSet::new(&nets);

    let store_path = cli.results_dir.join(INTERIM_RESULTS_FILE);
    let store = ResultsStore::open(&store_path, cfg.n_tries)
        .context("failed to open interim results store")?;
    Ok((candidates, store, store_path))
}

fn print_config(cli: &Cli, cfg: &TestConfig) {
    println!("cfscan-rs configuration:");
    println!(
        "  subnets          : {}",
        cli.subnets
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<built-in CloudFlare ranges>".to_string())
    );
    println!("  remote           : {}:{}", cfg.sni, cfg.remote_port);
    println!("  fronting host    : {}{}", cfg.fronting_host, cfg.fronting_path);
    println!("  tries            : {}", cfg.n_tries);
    println!(
        "  download         : >= {} KB/s within {} s, latency <= {} s",
        cfg.min_dl_speed, cfg.max_dl_time, cfg.max_dl_latency
    );
    if cfg.do_upload_test {
        println!(
            "  upload           : >= {} KB/s within {} s, latency <= {} s",
            cfg.min_ul_speed, cfg.max_ul_time, cfg.max_ul_latency
        );
    } else {
        println!("  upload           : <disabled>");
    }
    println!("  fronting timeout : {} s", cfg.fronting_timeout);
    println!("  startup timeout  : {} s", cfg.startprocess_timeout);
    println!("  novpn            : {}", cfg.no_vpn);
}

fn print_summary(summary: &ScanSummary) {
    println!("---------------------------");
    if summary.cancelled {
        println!("Scan interrupted.");
    }
    println!(
        "Tested: {}  accepted: {}  rejected: {}  skipped (already recorded): {}",
        summary.tested, summary.accepted, summary.rejected, summary.skipped
    );
}
