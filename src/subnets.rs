use crate::error::ScanError;
use ipnet::Ipv4Net;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// Parse subnet file content into IPv4 networks.
///
/// Supported formats per line:
/// - bare address: `104.16.0.1` (treated as a /32)
/// - CIDR block: `104.16.0.0/13` (host bits are masked off)
/// - comments: everything after `#` is ignored
/// - whitespace and blank lines are ignored
///
/// The first entry that is neither an address nor a CIDR block fails the whole
/// parse, so a bad file never yields a partial candidate set.
pub fn parse_subnets_str(s: &str) -> Result<Vec<Ipv4Net>, ScanError> {
    let mut out = Vec::new();
    for (idx, raw_line) in s.lines().enumerate() {
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        let net = parse_spec(line).ok_or_else(|| ScanError::MalformedSpecification {
            line: idx + 1,
            spec: line.to_string(),
        })?;
        out.push(net);
    }
    Ok(out)
}

/// Parse a single bare IPv4 address or IPv4 CIDR block.
pub fn parse_spec(spec: &str) -> Option<Ipv4Net> {
    let spec = spec.trim();
    if spec.contains('/') {
        spec.parse::<Ipv4Net>().ok().map(|n| n.trunc())
    } else {
        let ip = spec.parse::<Ipv4Addr>().ok()?;
        Ipv4Net::new(ip, 32).ok()
    }
}

/// Load subnet specifications from a file. Errors if the file cannot be read or parsed.
pub fn load_subnets_from_path(path: impl AsRef<Path>) -> Result<Vec<Ipv4Net>, ScanError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| ScanError::io(path, e))?;
    parse_subnets_str(&content)
}

/// Published CloudFlare IPv4 ranges, used when no subnet file is given.
pub fn cloudflare_ranges() -> Vec<Ipv4Net> {
    const RANGES: &[&str] = &[
        "173.245.48.0/20",
        "103.21.244.0/22",
        "103.22.200.0/22",
        "103.31.4.0/22",
        "141.101.64.0/18",
        "108.162.192.0/18",
        "190.93.240.0/20",
        "188.114.96.0/20",
        "197.234.240.0/22",
        "198.41.128.0/17",
        "162.158.0.0/15",
        "104.16.0.0/13",
        "104.24.0.0/14",
        "172.64.0.0/13",
        "131.0.72.0/22",
    ];
    RANGES.iter().filter_map(|r| parse_spec(r)).collect()
}

/// Number of addresses in a network, network and broadcast included.
pub fn network_size(net: &Ipv4Net) -> u64 {
    1u64 << (32 - u32::from(net.prefix_len()))
}

/// Deduplicated candidate address space.
///
/// Overlapping and adjacent networks are merged, so every address is produced
/// exactly once, in ascending order. Every address of each block is a
/// candidate, including the network and broadcast addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSet {
    nets: Vec<Ipv4Net>,
    total: u64,
}

impl CandidateSet {
    pub fn new(nets: &[Ipv4Net]) -> Self {
        let nets = Ipv4Net::aggregate(&nets.to_vec());
        let total = nets.iter().map(network_size).sum();
        Self { nets, total }
    }

    /// Total candidate count, known before scanning starts.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn contains(&self, ip: &Ipv4Addr) -> bool {
        self.nets.iter().any(|n| n.contains(ip))
    }

    /// Lazily walk every candidate address.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.nets.iter().copied().flat_map(addresses)
    }
}

/// Owned candidate stream, suitable for handing to the worker pool.
pub type CandidateIter = Box<dyn Iterator<Item = Ipv4Addr> + Send>;

impl IntoIterator for CandidateSet {
    type Item = Ipv4Addr;
    type IntoIter = CandidateIter;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.nets.into_iter().flat_map(addresses))
    }
}

/// Every address of `net`, network and broadcast included.
fn addresses(net: Ipv4Net) -> impl Iterator<Item = Ipv4Addr> {
    (u32::from(net.network())..=u32::from(net.broadcast())).map(Ipv4Addr::from)
}
