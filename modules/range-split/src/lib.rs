//! Range-list parsing and IPv6 subdivision ahead of scan scheduling.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::iter;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::IpNet;
use log::warn;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid range format: {0:?}")]
    InvalidRangeFormat(String),
}

/// Parse one range token: a CIDR (`203.0.113.0/24`, `2001:db8::/32`) or a
/// bare address, which is treated as a single-host range.
pub fn parse_range(token: &str) -> Result<IpNet, RangeError> {
    if let Ok(net) = token.parse::<IpNet>() {
        return Ok(net);
    }
    if let Ok(addr) = token.parse::<IpAddr>() {
        return Ok(IpNet::from(addr));
    }
    Err(RangeError::InvalidRangeFormat(token.to_string()))
}

/// Ranges read from an input file plus the count of lines that were skipped
/// as malformed.
#[derive(Debug)]
pub struct RangeList {
    pub ranges: Vec<IpNet>,
    pub skipped: usize,
}

/// Read a ranges file: one token per line, blanks and `#` comments ignored.
/// Malformed tokens are warned about and counted, never fatal.
pub fn read_ranges_file(path: &Path) -> Result<RangeList> {
    let file =
        File::open(path).with_context(|| format!("open ranges file {}", path.display()))?;
    let mut ranges = Vec::new();
    let mut skipped = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let token = line.trim();
        if token.is_empty() || token.starts_with('#') {
            continue;
        }
        match parse_range(token) {
            Ok(net) => ranges.push(net),
            Err(e) => {
                warn!("{e}, skipping line");
                skipped += 1;
            }
        }
    }
    Ok(RangeList { ranges, skipped })
}

/// Host bits left open by a range's prefix.
pub fn host_bits(net: &IpNet) -> u8 {
    net.max_prefix_len() - net.prefix_len()
}

/// Split a range into scan-ready chunks. IPv4 ranges and IPv6 ranges already
/// within `max_host_bits` pass through unchanged; wider IPv6 ranges are
/// subdivided into equal children at prefix `128 - max_host_bits`. The
/// children exactly partition the parent, and the sequence is lazy: a /16
/// split to /96 children is enumerable without materializing 2^80 entries.
pub fn split_range(net: IpNet, max_host_bits: u8) -> Box<dyn Iterator<Item = IpNet>> {
    let v6 = match net {
        IpNet::V4(_) => return Box::new(iter::once(net)),
        IpNet::V6(v6) => v6,
    };
    if host_bits(&net) <= max_host_bits {
        return Box::new(iter::once(net));
    }
    let child_prefix = 128 - max_host_bits;
    match v6.subnets(child_prefix) {
        Ok(children) => Box::new(children.map(IpNet::V6)),
        // Unreachable for valid prefixes; fall back to the range as given.
        Err(_) => Box::new(iter::once(net)),
    }
}
