//! Interim results store: one CSV row per candidate, appended as verdicts
//! arrive so a killed run keeps everything recorded so far.
//!
//! The per-try columns depend on `n_tries`, so a file whose header does not
//! match the current try count is rebuilt instead of reused.

use crate::error::ScanError;
use crate::types::{FailStage, TryMetrics, Verdict};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use ::time::{format_description::well_known, OffsetDateTime};
use tracing::{info, warn};

pub const INTERIM_RESULTS_FILE: &str = "interim_results.csv";

const SUMMARY_COLUMNS: &[&str] = &[
    "ip",
    "accepted",
    "fail_stage",
    "tested_at",
    "avg_latency",
    "avg_dl_latency",
    "avg_dl_speed",
    "avg_ul_latency",
    "avg_ul_speed",
];

const TRY_COLUMNS: &[&str] = &[
    "latency",
    "dl_latency",
    "dl_speed",
    "dl_time",
    "ul_latency",
    "ul_speed",
    "ul_time",
    "fail_stage",
];

/// Header line for a store holding `n_tries` tries per candidate.
pub fn header(n_tries: u32) -> String {
    let mut cols: Vec<String> = SUMMARY_COLUMNS.iter().map(|c| c.to_string()).collect();
    for i in 1..=n_tries {
        cols.extend(TRY_COLUMNS.iter().map(|c| format!("{c}_{i}")));
    }
    cols.join(",")
}

/// A row read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub ip: Ipv4Addr,
    pub accepted: bool,
    pub fail_stage: Option<FailStage>,
    pub tested_at: String,
    pub tries: Vec<TryMetrics>,
}

/// Append-only verdict store. Owned by a single writer.
#[derive(Debug)]
pub struct ResultsStore {
    path: PathBuf,
    file: File,
    n_tries: u32,
    recorded: HashSet<Ipv4Addr>,
}

impl ResultsStore {
    /// Open the store at `path` for `n_tries`, creating it if missing and
    /// rebuilding it if it was written for a different try count.
    pub fn open(path: impl AsRef<Path>, n_tries: u32) -> Result<Self, ScanError> {
        let path = path.as_ref().to_path_buf();
        let expected = header(n_tries);

        let existing = match fs::read_to_string(&path) {
            Ok(s) => Some(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ScanError::io(&path, e)),
        };

        let mut recorded = HashSet::new();
        let mut needs_newline = false;
        let reuse = match existing.as_deref() {
            Some(content) if content.lines().next() == Some(expected.as_str()) => {
                for (idx, line) in content.lines().enumerate().skip(1) {
                    match parse_row(line, n_tries) {
                        Some(rec) => {
                            recorded.insert(rec.ip);
                        }
                        None if !line.trim().is_empty() => {
                            warn!(path = %path.display(), line = idx + 1, "ignoring unreadable row");
                        }
                        None => {}
                    }
                }
                needs_newline = !content.ends_with('\n');
                true
            }
            Some(content) if !content.is_empty() => {
                warn!(
                    path = %path.display(),
                    n_tries,
                    "results store was written for a different try count, rebuilding"
                );
                false
            }
            _ => false,
        };

        let mut file = if reuse {
            OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|e| ScanError::io(&path, e))?
        } else {
            let mut f = File::create(&path).map_err(|e| ScanError::io(&path, e))?;
            writeln!(f, "{expected}").map_err(|e| ScanError::io(&path, e))?;
            f.sync_data().map_err(|e| ScanError::io(&path, e))?;
            f
        };
        // A run killed mid-write can leave a partial last line.
        if needs_newline {
            writeln!(file).map_err(|e| ScanError::io(&path, e))?;
        }

        if reuse {
            info!(path = %path.display(), recorded = recorded.len(), "resuming results store");
        }
        Ok(Self {
            path,
            file,
            n_tries,
            recorded,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn n_tries(&self) -> u32 {
        self.n_tries
    }

    /// Candidates already present in the store.
    pub fn recorded(&self) -> &HashSet<Ipv4Addr> {
        &self.recorded
    }

    pub fn is_recorded(&self, ip: &Ipv4Addr) -> bool {
        self.recorded.contains(ip)
    }

    /// Swap the handle for a read-only one so every append fails.
    #[cfg(test)]
    pub(crate) fn make_read_only(&mut self) -> Result<(), ScanError> {
        self.file = File::open(&self.path).map_err(|e| ScanError::io(&self.path, e))?;
        Ok(())
    }

    /// Append one verdict and flush it to disk before returning.
    pub fn append(&mut self, verdict: &Verdict) -> Result<(), ScanError> {
        let row = format_row(verdict, self.n_tries, &now_rfc3339());
        writeln!(self.file, "{row}").map_err(|e| ScanError::io(&self.path, e))?;
        self.file
            .sync_data()
            .map_err(|e| ScanError::io(&self.path, e))?;
        self.recorded.insert(verdict.ip);
        Ok(())
    }
}

/// Read every well-formed row of a store written for `n_tries`.
pub fn load_records(path: impl AsRef<Path>, n_tries: u32) -> Result<Vec<StoredRecord>, ScanError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| ScanError::io(path, e))?;
    let mut lines = content.lines();
    if lines.next() != Some(header(n_tries).as_str()) {
        return Err(ScanError::InvalidConfig(format!(
            "{} was not written for {n_tries} tries",
            path.display()
        )));
    }
    Ok(lines.filter_map(|l| parse_row(l, n_tries)).collect())
}

/// Render a verdict as a store row. Tries beyond `n_tries` are dropped and
/// missing ones left empty, so the row always matches the header.
pub fn format_row(v: &Verdict, n_tries: u32, tested_at: &str) -> String {
    let mut cells = vec![
        v.ip.to_string(),
        v.accepted.to_string(),
        stage_cell(v.fail_stage),
        tested_at.to_string(),
        num_cell(v.avg_latency()),
        num_cell(v.avg_dl_latency()),
        num_cell(v.avg_dl_speed()),
        num_cell(v.avg_ul_latency()),
        num_cell(v.avg_ul_speed()),
    ];
    let empty = TryMetrics::default();
    for i in 0..n_tries as usize {
        let t = v.tries.get(i).unwrap_or(&empty);
        cells.extend([
            num_cell(t.latency),
            num_cell(t.dl_latency),
            num_cell(t.dl_speed),
            num_cell(t.dl_time),
            num_cell(t.ul_latency),
            num_cell(t.ul_speed),
            num_cell(t.ul_time),
            stage_cell(t.fail_stage),
        ]);
    }
    cells.join(",")
}

fn parse_row(line: &str, n_tries: u32) -> Option<StoredRecord> {
    let cells: Vec<&str> = line.split(',').collect();
    if cells.len() != SUMMARY_COLUMNS.len() + TRY_COLUMNS.len() * n_tries as usize {
        return None;
    }
    let ip = cells[0].parse().ok()?;
    let accepted = cells[1].parse().ok()?;
    let fail_stage = parse_stage(cells[2])?;
    let tries = cells[SUMMARY_COLUMNS.len()..]
        .chunks(TRY_COLUMNS.len())
        .map(|c| {
            Some(TryMetrics {
                latency: parse_num(c[0])?,
                dl_latency: parse_num(c[1])?,
                dl_speed: parse_num(c[2])?,
                dl_time: parse_num(c[3])?,
                ul_latency: parse_num(c[4])?,
                ul_speed: parse_num(c[5])?,
                ul_time: parse_num(c[6])?,
                fail_stage: parse_stage(c[7])?,
            })
        })
        .collect::<Option<Vec<_>>>()?;
    Some(StoredRecord {
        ip,
        accepted,
        fail_stage,
        tested_at: cells[3].to_string(),
        tries,
    })
}

fn num_cell(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.4}")).unwrap_or_default()
}

fn stage_cell(s: Option<FailStage>) -> String {
    s.map(|s| s.as_str().to_string()).unwrap_or_default()
}

/// `None` on a malformed cell, `Some(None)` on an empty one.
fn parse_num(cell: &str) -> Option<Option<f64>> {
    if cell.is_empty() {
        Some(None)
    } else {
        cell.parse().ok().map(Some)
    }
}

fn parse_stage(cell: &str) -> Option<Option<FailStage>> {
    if cell.is_empty() {
        Some(None)
    } else {
        FailStage::parse(cell).map(Some)
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
