//! Just enough HTTP/1.1 to drive the fronting and speed-test requests over a
//! raw TLS stream.

use crate::probe::ProbeError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

const MAX_HEAD_BYTES: usize = 16 * 1024;
const USER_AGENT: &str = concat!("cfscan-rs/", env!("CARGO_PKG_VERSION"));

/// Status line and headers of a response, plus any body bytes that arrived with them.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body_prefix: Vec<u8>,
    /// When the first byte of the response was read.
    pub first_byte: Instant,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Time the edge spent handling the request, from
    /// `Server-Timing: cfRequestDuration;dur=<ms>`.
    pub fn edge_duration(&self) -> Option<Duration> {
        self.header("server-timing").and_then(parse_edge_duration)
    }
}

pub fn parse_edge_duration(value: &str) -> Option<Duration> {
    value
        .split(',')
        .map(str::trim)
        .find(|metric| metric.starts_with("cfRequestDuration"))
        .and_then(|metric| {
            metric
                .split(';')
                .find_map(|param| param.trim().strip_prefix("dur="))
        })
        .and_then(|ms| ms.trim().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_micros((ms * 1000.0).round() as u64))
}

/// Write a request head. The caller streams any body afterwards.
pub async fn write_request_head<W>(
    w: &mut W,
    method: &str,
    host: &str,
    path: &str,
    content_length: Option<u64>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!(
        "{method} {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {USER_AGENT}\r\nAccept: */*\r\nConnection: close\r\n"
    );
    if let Some(len) = content_length {
        head.push_str("Content-Type: application/octet-stream\r\n");
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    head.push_str("\r\n");
    w.write_all(head.as_bytes()).await?;
    w.flush().await
}

/// Read until the end of the response head.
pub async fn read_response_head<R>(r: &mut R) -> Result<ResponseHead, ProbeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    let mut first_byte = None;

    let head_end = loop {
        let n = r.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProbeError::Protocol(
                "connection closed before response head".into(),
            ));
        }
        first_byte.get_or_insert_with(Instant::now);
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProbeError::Protocol("response head too large".into()));
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]);
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(parse_status_line)
        .ok_or_else(|| ProbeError::Protocol("malformed status line".into()))?;
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok(ResponseHead {
        status,
        headers,
        body_prefix: buf[head_end + 4..].to_vec(),
        first_byte: first_byte.unwrap_or_else(Instant::now),
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
