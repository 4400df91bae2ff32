use crate::error::ScanError;
use serde::Deserialize;
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host answering the speed-test download/upload endpoints.
pub const DEFAULT_SPEED_HOST: &str = "speed.cloudflare.com";
pub const DEFAULT_REMOTE_PORT: u16 = 443;

/// Upper bound for any time or latency setting, in seconds.
const MAX_SECONDS: f64 = 3600.0;
/// Upper bound for a speed threshold, in KB/s.
const MAX_SPEED_KBPS: f64 = 10_000_000.0;

/// Immutable thresholds and endpoints shared read-only by every worker.
///
/// Times and latencies are seconds, speeds are KB/s (1 KB = 1000 bytes).
#[derive(Debug, Clone, PartialEq)]
pub struct TestConfig {
    pub local_port: u16,
    pub remote_port: u16,
    pub sni: String,
    pub fronting_host: String,
    pub fronting_path: String,
    pub speed_host: String,
    pub user_id: String,
    pub do_upload_test: bool,
    pub min_dl_speed: f64,
    pub min_ul_speed: f64,
    pub max_dl_time: f64,
    pub max_ul_time: f64,
    pub max_dl_latency: f64,
    pub max_ul_latency: f64,
    pub fronting_timeout: f64,
    pub startprocess_timeout: f64,
    pub n_tries: u32,
    pub no_vpn: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            remote_port: DEFAULT_REMOTE_PORT,
            sni: DEFAULT_SPEED_HOST.to_string(),
            fronting_host: DEFAULT_SPEED_HOST.to_string(),
            fronting_path: "/".to_string(),
            speed_host: DEFAULT_SPEED_HOST.to_string(),
            user_id: String::new(),
            do_upload_test: false,
            min_dl_speed: 50.0,
            min_ul_speed: 50.0,
            max_dl_time: 2.0,
            max_ul_time: 2.0,
            max_dl_latency: 2.0,
            max_ul_latency: 2.0,
            fronting_timeout: 1.0,
            startprocess_timeout: 5.0,
            n_tries: 1,
            no_vpn: false,
        }
    }
}

impl TestConfig {
    pub fn remote_addr(&self, ip: Ipv4Addr) -> SocketAddrV4 {
        SocketAddrV4::new(ip, self.remote_port)
    }

    /// Bytes requested by the download stage: the minimum speed sustained for the
    /// whole time budget.
    pub fn download_bytes(&self) -> u64 {
        (self.min_dl_speed * 1000.0 * self.max_dl_time).round() as u64
    }

    pub fn upload_bytes(&self) -> u64 {
        (self.min_ul_speed * 1000.0 * self.max_ul_time).round() as u64
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.startprocess_timeout)
    }

    pub fn fronting_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.fronting_timeout)
    }

    pub fn dl_latency_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.max_dl_latency)
    }

    pub fn ul_latency_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.max_ul_latency)
    }

    pub fn dl_time_budget(&self) -> Duration {
        Duration::from_secs_f64(self.max_dl_time)
    }

    pub fn ul_time_budget(&self) -> Duration {
        Duration::from_secs_f64(self.max_ul_time)
    }
}

/// Client configuration file as distributed for the VPN client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfigFile {
    pub id: String,
    pub host: String,
    pub port: PortValue,
    #[serde(rename = "serverName")]
    pub server_name: String,
    pub path: String,
}

/// The port is a string in the published config, but accept a number too.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u16),
    Text(String),
}

impl PortValue {
    fn to_port(&self) -> Option<u16> {
        match self {
            PortValue::Number(p) => Some(*p),
            PortValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl ClientConfigFile {
    pub fn parse(s: &str, path: &Path) -> Result<Self, ScanError> {
        serde_json::from_str(s).map_err(|e| ScanError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ScanError::io(path, e))?;
        Self::parse(&content, path)
    }
}

/// Values supplied explicitly by the operator. `None` keeps the lower layer.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub local_port: Option<u16>,
    pub do_upload_test: bool,
    pub min_dl_speed: Option<f64>,
    pub min_ul_speed: Option<f64>,
    pub max_dl_time: Option<f64>,
    pub max_ul_time: Option<f64>,
    pub max_dl_latency: Option<f64>,
    pub max_ul_latency: Option<f64>,
    pub fronting_timeout: Option<f64>,
    pub startprocess_timeout: Option<f64>,
    pub n_tries: Option<u32>,
    pub no_vpn: bool,
}

/// Merges defaults, an optional client config file and operator overrides.
#[derive(Debug, Clone, Default)]
pub struct TestConfigBuilder {
    config_path: Option<PathBuf>,
    file: Option<ClientConfigFile>,
    overrides: ConfigOverrides,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Use an already parsed client config instead of reading one from disk.
    pub fn client_config(mut self, file: ClientConfigFile) -> Self {
        self.file = Some(file);
        self
    }

    pub fn overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn build(self) -> Result<TestConfig, ScanError> {
        let mut cfg = TestConfig::default();

        let file = match (self.file, &self.config_path) {
            (Some(f), _) => Some(f),
            (None, Some(path)) => Some(ClientConfigFile::load(path)?),
            (None, None) => None,
        };
        if let Some(file) = file {
            cfg.user_id = file.id;
            cfg.fronting_host = file.host;
            cfg.sni = file.server_name;
            cfg.fronting_path = normalize_path(&file.path);
            cfg.remote_port = file.port.to_port().ok_or_else(|| ScanError::ConfigFile {
                path: self.config_path.clone().unwrap_or_default(),
                reason: format!("invalid port {:?}", file.port),
            })?;
        }

        let o = self.overrides;
        if let Some(v) = o.local_port {
            cfg.local_port = v;
        }
        // An explicit upload speed implies the operator wants the upload stage.
        cfg.do_upload_test = o.do_upload_test || o.min_ul_speed.is_some();
        if let Some(v) = o.min_dl_speed {
            cfg.min_dl_speed = v;
        }
        if let Some(v) = o.min_ul_speed {
            cfg.min_ul_speed = v;
        }
        if let Some(v) = o.max_dl_time {
            cfg.max_dl_time = v;
        }
        if let Some(v) = o.max_ul_time {
            cfg.max_ul_time = v;
        }
        if let Some(v) = o.max_dl_latency {
            cfg.max_dl_latency = v;
        }
        if let Some(v) = o.max_ul_latency {
            cfg.max_ul_latency = v;
        }
        if let Some(v) = o.fronting_timeout {
            cfg.fronting_timeout = v;
        }
        if let Some(v) = o.startprocess_timeout {
            cfg.startprocess_timeout = v;
        }
        if let Some(v) = o.n_tries {
            cfg.n_tries = v;
        }
        cfg.no_vpn = o.no_vpn;

        validate(&cfg)?;
        Ok(cfg)
    }
}

fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

fn validate(cfg: &TestConfig) -> Result<(), ScanError> {
    if cfg.n_tries == 0 {
        return Err(ScanError::InvalidConfig("tries must be at least 1".into()));
    }
    if cfg.remote_port == 0 {
        return Err(ScanError::InvalidConfig("remote port must be non-zero".into()));
    }
    let bounded = [
        ("download-speed", cfg.min_dl_speed, MAX_SPEED_KBPS),
        ("upload-speed", cfg.min_ul_speed, MAX_SPEED_KBPS),
        ("download-time", cfg.max_dl_time, MAX_SECONDS),
        ("upload-time", cfg.max_ul_time, MAX_SECONDS),
        ("download-latency", cfg.max_dl_latency, MAX_SECONDS),
        ("upload-latency", cfg.max_ul_latency, MAX_SECONDS),
        ("fronting-timeout", cfg.fronting_timeout, MAX_SECONDS),
        ("startprocess-timeout", cfg.startprocess_timeout, MAX_SECONDS),
    ];
    for (name, value, max) in bounded {
        if !value.is_finite() || value <= 0.0 || value > max {
            return Err(ScanError::InvalidConfig(format!(
                "{name} must be in (0, {max}], got {value}"
            )));
        }
    }
    if cfg.sni.trim().is_empty() || cfg.fronting_host.trim().is_empty() {
        return Err(ScanError::InvalidConfig("SNI and fronting host must be set".into()));
    }
    // These end up verbatim in request heads.
    let header_fields = [
        ("serverName", &cfg.sni),
        ("host", &cfg.fronting_host),
        ("path", &cfg.fronting_path),
        ("speed host", &cfg.speed_host),
    ];
    for (name, value) in header_fields {
        if value.chars().any(|c| c.is_control() || c == ' ') {
            return Err(ScanError::InvalidConfig(format!(
                "{name} contains whitespace or control characters: {value:?}"
            )));
        }
    }
    Ok(())
}
