//! Parses raw scanner list output into normalized, deduplicated port
//! records and writes the per-range and aggregate summaries.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;

/// One open-port observation, from a list-format line like
/// `open tcp 80 203.0.113.5 1700000000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    pub addr: IpAddr,
    pub port: u16,
    pub proto: String,
    pub discovered_at: u64,
}

/// Line counts for one parse pass. Malformed lines warn, they never fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParseStats {
    pub records: usize,
    pub duplicates: usize,
    pub malformed: usize,
}

impl ParseStats {
    pub fn absorb(&mut self, other: ParseStats) {
        self.records += other.records;
        self.duplicates += other.duplicates;
        self.malformed += other.malformed;
    }
}

/// Port records deduplicated on `(address, port)` across any number of raw
/// files. First sighting wins, so reparsing a file never double-counts.
#[derive(Debug, Default)]
pub struct RecordSet {
    records: Vec<PortRecord>,
    seen: HashSet<(IpAddr, u16)>,
}

impl RecordSet {
    pub fn new() -> Self {
        RecordSet::default()
    }

    pub fn records(&self) -> &[PortRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert unless `(addr, port)` is already known.
    pub fn push(&mut self, record: PortRecord) -> bool {
        if self.seen.insert((record.addr, record.port)) {
            self.records.push(record);
            true
        } else {
            false
        }
    }

    /// Fold another set's records in, returning how many were new.
    pub fn merge(&mut self, records: &[PortRecord]) -> usize {
        records
            .iter()
            .filter(|r| self.push((*r).clone()))
            .count()
    }

    /// Records grouped by address (address-ordered), within each address
    /// ordered by discovery time then port.
    pub fn grouped(&self) -> Vec<(IpAddr, Vec<&PortRecord>)> {
        let mut by_addr: BTreeMap<IpAddr, Vec<&PortRecord>> = BTreeMap::new();
        for record in &self.records {
            by_addr.entry(record.addr).or_default().push(record);
        }
        let mut grouped: Vec<_> = by_addr.into_iter().collect();
        for (_, records) in &mut grouped {
            records.sort_by_key(|r| (r.discovered_at, r.port));
        }
        grouped
    }
}

/// Parse one raw output file into `set`. Comment and non-record lines are
/// skipped silently; `open` lines with unparseable fields are counted and
/// warned about.
pub fn parse_file(path: &Path, set: &mut RecordSet) -> Result<ParseStats> {
    let file =
        File::open(path).with_context(|| format!("open scan output {}", path.display()))?;
    let mut stats = ParseStats::default();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut fields = trimmed.split_whitespace();
        if fields.next() != Some("open") {
            continue;
        }
        match parse_fields(fields) {
            Some(record) => {
                if set.push(record) {
                    stats.records += 1;
                } else {
                    stats.duplicates += 1;
                }
            }
            None => {
                stats.malformed += 1;
                warn!(
                    "malformed scan output line in {}: {trimmed:?}",
                    path.display()
                );
            }
        }
    }
    Ok(stats)
}

fn parse_fields<'a>(mut fields: impl Iterator<Item = &'a str>) -> Option<PortRecord> {
    let proto = fields.next()?.to_string();
    let port = fields.next()?.parse().ok()?;
    let addr = fields.next()?.parse().ok()?;
    let discovered_at = fields.next()?.parse().ok()?;
    Some(PortRecord {
        addr,
        port,
        proto,
        discovered_at,
    })
}

/// Per-range summary: the records one job's output parsed to.
pub fn write_summary(path: &Path, title: &str, records: &[PortRecord]) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("create summary {}", path.display()))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "# {title}")?;
    writeln!(w, "# open ports: {}", records.len())?;
    for r in records {
        writeln!(w, "{} {} {} {}", r.addr, r.port, r.proto, r.discovered_at)?;
    }
    w.flush()?;
    Ok(())
}

/// Aggregate summary over every range, grouped by address.
pub fn write_aggregate_summary(path: &Path, set: &RecordSet) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("create summary {}", path.display()))?;
    let mut w = BufWriter::new(file);
    let grouped = set.grouped();
    writeln!(w, "# aggregate summary")?;
    writeln!(w, "# hosts: {}", grouped.len())?;
    writeln!(w, "# open ports: {}", set.len())?;
    for (addr, records) in grouped {
        writeln!(w, "{addr}")?;
        for r in records {
            writeln!(w, "  {} {} {}", r.port, r.proto, r.discovered_at)?;
        }
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn raw_file(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_the_list_format() {
        let f = raw_file("open tcp 80 203.0.113.5 1700000000\n");
        let mut set = RecordSet::new();
        let stats = parse_file(f.path(), &mut set).unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(
            set.records(),
            &[PortRecord {
                addr: "203.0.113.5".parse().unwrap(),
                port: 80,
                proto: "tcp".into(),
                discovered_at: 1_700_000_000,
            }]
        );
    }

    #[test]
    fn skips_headers_and_counts_malformed() {
        let f = raw_file(
            "#masscan\n\
             \n\
             open tcp 80 203.0.113.5 1700000000\n\
             banner tcp 22 203.0.113.5 1700000001 ssh\n\
             open tcp not-a-port 203.0.113.5 1700000002\n\
             open tcp 443 203.0.113.5\n\
             # end\n",
        );
        let mut set = RecordSet::new();
        let stats = parse_file(f.path(), &mut set).unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.malformed, 2);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn reparsing_is_idempotent() {
        let f = raw_file("open tcp 80 203.0.113.5 1700000000\nopen udp 53 203.0.113.6 1700000001\n");
        let mut set = RecordSet::new();
        let first = parse_file(f.path(), &mut set).unwrap();
        let second = parse_file(f.path(), &mut set).unwrap();
        assert_eq!(first.records, 2);
        assert_eq!(second.records, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn dedup_spans_files() {
        let a = raw_file("open tcp 80 203.0.113.5 1700000000\n");
        let b = raw_file("open tcp 80 203.0.113.5 1700000500\nopen tcp 443 203.0.113.5 1700000501\n");
        let mut set = RecordSet::new();
        parse_file(a.path(), &mut set).unwrap();
        parse_file(b.path(), &mut set).unwrap();
        assert_eq!(set.len(), 2);
        // First sighting wins.
        assert_eq!(set.records()[0].discovered_at, 1_700_000_000);
    }

    #[test]
    fn grouped_orders_by_address_then_discovery() {
        let mut set = RecordSet::new();
        for (addr, port, ts) in [
            ("203.0.113.6", 443u16, 30u64),
            ("203.0.113.5", 8080, 20),
            ("203.0.113.5", 80, 10),
        ] {
            set.push(PortRecord {
                addr: addr.parse().unwrap(),
                port,
                proto: "tcp".into(),
                discovered_at: ts,
            });
        }
        let grouped = set.grouped();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, "203.0.113.5".parse::<IpAddr>().unwrap());
        assert_eq!(
            grouped[0].1.iter().map(|r| r.port).collect::<Vec<_>>(),
            vec![80, 8080]
        );
    }

    #[test]
    fn summaries_round_out_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = RecordSet::new();
        let f = raw_file("open tcp 80 203.0.113.5 1700000000\n");
        parse_file(f.path(), &mut set).unwrap();

        let per_range = dir.path().join("203_0_113_0_30_summary.txt");
        write_summary(&per_range, "203.0.113.0/30", set.records()).unwrap();
        let text = std::fs::read_to_string(&per_range).unwrap();
        assert!(text.contains("# 203.0.113.0/30"));
        assert!(text.contains("# open ports: 1"));
        assert!(text.contains("203.0.113.5 80 tcp 1700000000"));

        let aggregate = dir.path().join("aggregate_summary.txt");
        write_aggregate_summary(&aggregate, &set).unwrap();
        let text = std::fs::read_to_string(&aggregate).unwrap();
        assert!(text.contains("# hosts: 1"));
        assert!(text.contains("203.0.113.5"));
        assert!(text.contains("  80 tcp 1700000000"));
    }

    #[test]
    fn empty_input_yields_an_empty_but_valid_summary() {
        let dir = tempfile::tempdir().unwrap();
        let set = RecordSet::new();
        let path = dir.path().join("aggregate_summary.txt");
        write_aggregate_summary(&path, &set).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("# open ports: 0"));
    }
}
