use cfscan_rs::error::ScanError;
use cfscan_rs::subnets::{load_subnets_from_path, parse_subnets_str, CandidateSet};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

#[test]
fn cidr_count_includes_network_and_broadcast() {
    for prefix in [22u8, 24, 28, 30, 31, 32] {
        let net: Ipv4Net = format!("104.16.8.0/{prefix}").parse().unwrap();
        let set = CandidateSet::new(&[net]);
        assert_eq!(set.total(), 1u64 << (32 - prefix));
        assert_eq!(set.iter().count() as u64, set.total());
        assert!(set.iter().all(|ip| net.contains(&ip)));
    }
}

#[test]
fn slash_30_yields_all_four_addresses_in_order() {
    let nets = parse_subnets_str("1.1.1.0/30\n").unwrap();
    let ips: Vec<Ipv4Addr> = CandidateSet::new(&nets).into_iter().collect();
    assert_eq!(
        ips,
        vec![
            Ipv4Addr::new(1, 1, 1, 0),
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(1, 1, 1, 2),
            Ipv4Addr::new(1, 1, 1, 3),
        ]
    );
}

#[test]
fn overlapping_entries_are_deduplicated() {
    let input = r#"
        # edge ranges
        10.0.0.0/30
        10.0.0.2        # already covered
        10.0.0.0/31
        10.0.0.4/31     # adjacent, merged

    "#;
    let nets = parse_subnets_str(input).unwrap();
    assert_eq!(nets.len(), 4);
    let set = CandidateSet::new(&nets);
    assert_eq!(set.total(), 6);
    let ips: Vec<_> = set.iter().collect();
    let mut unique = ips.clone();
    unique.dedup();
    assert_eq!(ips, unique);
    assert!(set.contains(&Ipv4Addr::new(10, 0, 0, 5)));
    assert!(!set.contains(&Ipv4Addr::new(10, 0, 0, 6)));
}

#[test]
fn empty_input_gives_empty_set() {
    let nets = parse_subnets_str("\n   \n# nothing here\n").unwrap();
    assert!(nets.is_empty());
    assert!(CandidateSet::new(&nets).is_empty());
}

#[test]
fn malformed_file_aborts_before_scanning() {
    let dir = std::env::temp_dir().join(format!("cfscan-rs-subnets-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("subnets.txt");
    std::fs::write(&path, "1.1.1.0/30\n1.1.1.300/32\n").unwrap();

    let err = load_subnets_from_path(&path).unwrap_err();
    assert!(matches!(
        err,
        ScanError::MalformedSpecification { line: 2, .. }
    ));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn missing_file_is_an_io_error() {
    let err = load_subnets_from_path("/definitely/not/here/subnets.txt").unwrap_err();
    assert!(matches!(err, ScanError::Io { .. }));
}
