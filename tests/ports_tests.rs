use std::collections::BTreeSet;

use lan_watch_rs::ports::{format_port_list, parse_port_list, ports_for_scan};
use lan_watch_rs::types::PortScanType;

#[test]
fn persisted_form_survives_a_reload() {
    let ports: BTreeSet<u16> = [443, 22, 80].into_iter().collect();
    let text = format_port_list(&ports);
    assert_eq!(text, "22,80,443");
    assert_eq!(parse_port_list(&text), ports);
}

#[test]
fn legacy_rows_with_junk_entries_still_load() {
    let ports = parse_port_list("22,unknown, 80 ,99999");
    assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![22, 80]);
}

#[test]
fn range_scan_rejects_inverted_bounds() {
    assert!(ports_for_scan(PortScanType::Range, Some(100), Some(10)).is_err());
}
