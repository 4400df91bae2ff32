//! Network side of a try: one TCP+TLS connection per request, each step bounded
//! by its own timeout.
//!
//! [`Probe`] is the seam between the candidate tester and the network, so the
//! tester and the worker pool can run against a synthetic network in tests.

use crate::config::TestConfig;
use crate::http::{self, ResponseHead};
use async_trait::async_trait;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{self, Instant};
use tokio_native_tls::TlsStream;

const DOWNLOAD_PATH: &str = "/__down";
const UPLOAD_PATH: &str = "/__up";
const IO_CHUNK: usize = 16 * 1024;

/// Step of a request that ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Handshake,
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Connect => "connect",
            Phase::Handshake => "tls handshake",
            Phase::Response => "response",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("{0} timed out")]
    Timeout(Phase),

    #[error("tls handshake failed: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// The response head did not arrive within the stage's latency limit.
    /// Carries whatever was measured before the wait started.
    #[error("no response within {limit:?}")]
    LatencyExceeded {
        limit: Duration,
        transfer: Option<Transfer>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Failures to reach the candidate at all, as opposed to failures of the
    /// stage being measured.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProbeError::Connect(_) | ProbeError::Timeout(Phase::Connect))
    }
}

/// Result of the fronting request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrontingOutcome {
    /// Request sent to first response byte.
    pub ttfb: Duration,
}

/// Result of a download or upload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transfer {
    /// Network latency with the edge processing time removed. `None` when the
    /// transfer never got far enough to see a response.
    pub latency: Option<Duration>,
    pub elapsed: Duration,
    pub bytes: u64,
}

impl Transfer {
    /// Throughput in KB/s (1 KB = 1000 bytes).
    pub fn speed_kbps(&self) -> f64 {
        let secs = self.elapsed.max(Duration::from_millis(1)).as_secs_f64();
        self.bytes as f64 / 1000.0 / secs
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    /// TLS handshake with the configured SNI and a request carrying the
    /// fronting `Host` header and path. Non-2xx is an error.
    async fn fronting(&self, ip: Ipv4Addr, cfg: &TestConfig) -> Result<FrontingOutcome, ProbeError>;

    /// Stream `cfg.download_bytes()` from the speed-test endpoint for at most
    /// `cfg.max_dl_time` after the first byte.
    async fn download(&self, ip: Ipv4Addr, cfg: &TestConfig) -> Result<Transfer, ProbeError>;

    /// Stream `cfg.upload_bytes()` to the speed-test endpoint for at most
    /// `cfg.max_ul_time`.
    async fn upload(&self, ip: Ipv4Addr, cfg: &TestConfig) -> Result<Transfer, ProbeError>;
}

/// Real network probe over `native-tls`.
#[derive(Clone)]
pub struct HttpsProbe {
    connector: tokio_native_tls::TlsConnector,
}

impl HttpsProbe {
    pub fn new() -> Result<Self, native_tls::Error> {
        let connector = native_tls::TlsConnector::builder().build()?;
        Ok(Self {
            connector: connector.into(),
        })
    }

    async fn connect(&self, ip: Ipv4Addr, cfg: &TestConfig) -> Result<TcpStream, ProbeError> {
        let socket = TcpSocket::new_v4().map_err(ProbeError::Connect)?;
        if cfg.local_port != 0 {
            socket.set_reuseaddr(true).map_err(ProbeError::Connect)?;
            socket
                .bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.local_port)))
                .map_err(ProbeError::Connect)?;
        }
        let addr = SocketAddr::V4(cfg.remote_addr(ip));
        match time::timeout(cfg.startup_timeout(), socket.connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProbeError::Connect(e)),
            Err(_) => Err(ProbeError::Timeout(Phase::Connect)),
        }
    }

    async fn handshake(
        &self,
        stream: TcpStream,
        sni: &str,
        deadline: Instant,
    ) -> Result<TlsStream<TcpStream>, ProbeError> {
        match time::timeout_at(deadline, self.connector.connect(sni, stream)).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(ProbeError::Tls(e)),
            Err(_) => Err(ProbeError::Timeout(Phase::Handshake)),
        }
    }
}

#[async_trait]
impl Probe for HttpsProbe {
    async fn fronting(&self, ip: Ipv4Addr, cfg: &TestConfig) -> Result<FrontingOutcome, ProbeError> {
        let stream = self.connect(ip, cfg).await?;
        let deadline = Instant::now() + cfg.fronting_timeout();
        let mut tls = self.handshake(stream, &cfg.sni, deadline).await?;

        let sent = Instant::now();
        let head = time::timeout_at(
            deadline,
            get(&mut tls, &cfg.fronting_host, &cfg.fronting_path),
        )
        .await
        .map_err(|_| ProbeError::Timeout(Phase::Response))??;

        if !head.is_success() {
            return Err(ProbeError::HttpStatus(head.status));
        }
        Ok(FrontingOutcome {
            ttfb: head.first_byte.saturating_duration_since(sent),
        })
    }

    async fn download(&self, ip: Ipv4Addr, cfg: &TestConfig) -> Result<Transfer, ProbeError> {
        let n_bytes = cfg.download_bytes();
        let stream = self.connect(ip, cfg).await?;
        let deadline = Instant::now() + cfg.fronting_timeout();
        let mut tls = self.handshake(stream, &cfg.speed_host, deadline).await?;

        let path = format!("{DOWNLOAD_PATH}?bytes={n_bytes}");
        let sent = Instant::now();
        let limit = cfg.dl_latency_timeout();
        let head = time::timeout(limit, get(&mut tls, &cfg.speed_host, &path))
            .await
            .map_err(|_| ProbeError::LatencyExceeded {
                limit,
                transfer: None,
            })??;

        if !head.is_success() {
            return Err(ProbeError::HttpStatus(head.status));
        }
        let latency = edge_adjusted_latency(&head, sent);

        // Chunked framing bytes are counted as payload; the overhead is negligible.
        let body_deadline = head.first_byte + cfg.dl_time_budget();
        let bytes = read_body(&mut tls, head.body_prefix.len() as u64, n_bytes, body_deadline).await?;
        Ok(Transfer {
            latency: Some(latency),
            elapsed: Instant::now().saturating_duration_since(head.first_byte),
            bytes,
        })
    }

    async fn upload(&self, ip: Ipv4Addr, cfg: &TestConfig) -> Result<Transfer, ProbeError> {
        let n_bytes = cfg.upload_bytes();
        let stream = self.connect(ip, cfg).await?;
        let deadline = Instant::now() + cfg.fronting_timeout();
        let mut tls = self.handshake(stream, &cfg.speed_host, deadline).await?;

        let started = Instant::now();
        let mut written = 0u64;
        let outcome = time::timeout_at(
            started + cfg.ul_time_budget(),
            post(&mut tls, &cfg.speed_host, n_bytes, &mut written),
        )
        .await;
        let elapsed = started.elapsed();
        match outcome {
            Ok(result) => result?,
            Err(_) => {
                // Budget ran out mid-body: report the partial transfer so the
                // speed check rejects it on numbers.
                return Ok(Transfer {
                    latency: None,
                    elapsed,
                    bytes: written,
                });
            }
        }

        let sent = Instant::now();
        let limit = cfg.ul_latency_timeout();
        let head = time::timeout(limit, http::read_response_head(&mut tls))
            .await
            .map_err(|_| ProbeError::LatencyExceeded {
                limit,
                transfer: Some(Transfer {
                    latency: None,
                    elapsed,
                    bytes: n_bytes,
                }),
            })??;
        if !head.is_success() {
            return Err(ProbeError::HttpStatus(head.status));
        }
        Ok(Transfer {
            latency: Some(edge_adjusted_latency(&head, sent)),
            elapsed,
            bytes: n_bytes,
        })
    }
}

fn edge_adjusted_latency(head: &ResponseHead, sent: Instant) -> Duration {
    let ttfb = head.first_byte.saturating_duration_since(sent);
    match head.edge_duration() {
        Some(edge) => ttfb.saturating_sub(edge),
        None => ttfb,
    }
}

/// Read body bytes until `want` in total or the deadline passes. Returns the
/// number of body bytes seen, including `already` from the head read.
async fn read_body<R>(r: &mut R, already: u64, want: u64, deadline: Instant) -> Result<u64, ProbeError>
where
    R: AsyncRead + Unpin,
{
    let mut got = already;
    let mut buf = vec![0u8; IO_CHUNK];
    while got < want {
        match time::timeout_at(deadline, r.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => got += n as u64,
            Ok(Err(e)) => return Err(ProbeError::Io(e)),
            Err(_) => break,
        }
    }
    Ok(got.min(want))
}

async fn get<S>(s: &mut S, host: &str, path: &str) -> Result<ResponseHead, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    http::write_request_head(s, "GET", host, path, None).await?;
    http::read_response_head(s).await
}

/// Send the upload request and body; `written` tracks body progress so a caller
/// that times this out still knows how far it got.
async fn post<S>(s: &mut S, host: &str, n_bytes: u64, written: &mut u64) -> Result<(), ProbeError>
where
    S: AsyncWrite + Unpin,
{
    http::write_request_head(s, "POST", host, UPLOAD_PATH, Some(n_bytes)).await?;
    write_body(s, n_bytes, written).await
}

async fn write_body<W>(w: &mut W, n_bytes: u64, written: &mut u64) -> Result<(), ProbeError>
where
    W: AsyncWrite + Unpin,
{
    let chunk = vec![0u8; IO_CHUNK];
    while *written < n_bytes {
        let n = (n_bytes - *written).min(IO_CHUNK as u64) as usize;
        w.write_all(&chunk[..n]).await?;
        *written += n as u64;
    }
    w.flush().await?;
    Ok(())
}
