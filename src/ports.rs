use std::collections::BTreeSet;

use crate::error::{LanWatchError, Result};
use crate::types::PortScanType;

/// Ports probed by an on-demand "popular" scan.
pub fn popular_ports() -> Vec<u16> {
    const POPULAR: &[u16] = &[
        21, 22, 23, 25, 53, 80, 110, 135, 139, 143, 443, 445, 993, 995, 3389, 8000, 8080, 8443,
        9000, 9001, 9443,
    ];
    POPULAR.to_vec()
}

/// Inclusive port range. Errors on 0, values above 65535, or `start > end`.
pub fn port_range(start: u32, end: u32) -> Result<Vec<u16>> {
    let start = checked_port(start)?;
    let end = checked_port(end)?;
    if start > end {
        return Err(LanWatchError::Validation(format!(
            "invalid range {start}-{end} (start > end)"
        )));
    }
    Ok((start..=end).collect())
}

/// Resolve the port list for an on-demand scan.
pub fn ports_for_scan(
    scan_type: PortScanType,
    start: Option<u32>,
    end: Option<u32>,
) -> Result<Vec<u16>> {
    match scan_type {
        PortScanType::Popular => Ok(popular_ports()),
        PortScanType::All => port_range(1, 65535),
        PortScanType::Range => match (start, end) {
            (Some(s), Some(e)) => port_range(s, e),
            _ => Err(LanWatchError::Validation(
                "start_port and end_port required for range scan".into(),
            )),
        },
    }
}

/// Canonical persisted form: ascending, comma-separated, no spaces (`"22,80"`).
pub fn format_port_list(ports: &BTreeSet<u16>) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a persisted port list. Entries that are not valid port numbers are
/// skipped rather than failing the whole record.
pub fn parse_port_list(s: &str) -> BTreeSet<u16> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.parse::<u16>().ok())
        .filter(|&p| p != 0)
        .collect()
}

fn checked_port(val: u32) -> Result<u16> {
    if val == 0 || val > 65535 {
        return Err(LanWatchError::Validation(format!("port out of range: {val}")));
    }
    Ok(val as u16)
}
