//! Append-only sinks for the run's scan transcript and per-target error
//! journal. Shared across worker pools behind `Arc`; the mutex keeps
//! concurrent tasks from interleaving partial lines.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::new())
}

pub struct RunLogs {
    scan: Mutex<BufWriter<File>>,
    errors: Mutex<BufWriter<File>>,
}

impl RunLogs {
    pub fn open(scan_log: &Path, errors_log: &Path) -> std::io::Result<Self> {
        let open = |p: &Path| -> std::io::Result<Mutex<BufWriter<File>>> {
            let f = OpenOptions::new().create(true).append(true).open(p)?;
            Ok(Mutex::new(BufWriter::new(f)))
        };
        Ok(RunLogs {
            scan: open(scan_log)?,
            errors: open(errors_log)?,
        })
    }

    /// Raw scanner output and job lifecycle events.
    pub fn scan_line(&self, line: &str) {
        Self::append(&self.scan, line);
    }

    /// Per-target fetch/capture failures and other recovered errors.
    pub fn error_line(&self, line: &str) {
        Self::append(&self.errors, line);
    }

    fn append(sink: &Mutex<BufWriter<File>>, line: &str) {
        if let Ok(mut w) = sink.lock() {
            let _ = writeln!(w, "[{}] {}", now_rfc3339(), line);
            let _ = w.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_land_in_the_right_file() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("scan.log");
        let errors = dir.path().join("errors.log");
        let logs = RunLogs::open(&scan, &errors).unwrap();
        logs.scan_line("job 10.0.0.0/24 started");
        logs.error_line("fetch http://203.0.113.5:80/: connection refused");

        let scan_text = std::fs::read_to_string(&scan).unwrap();
        let err_text = std::fs::read_to_string(&errors).unwrap();
        assert!(scan_text.contains("job 10.0.0.0/24 started"));
        assert!(!scan_text.contains("connection refused"));
        assert!(err_text.contains("connection refused"));
    }

    #[test]
    fn appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("scan.log");
        let errors = dir.path().join("errors.log");
        {
            let logs = RunLogs::open(&scan, &errors).unwrap();
            logs.scan_line("first");
        }
        {
            let logs = RunLogs::open(&scan, &errors).unwrap();
            logs.scan_line("second");
        }
        let text = std::fs::read_to_string(&scan).unwrap();
        assert!(text.contains("first") && text.contains("second"));
    }
}
