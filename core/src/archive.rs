//! Timestamped archive root and path construction for every artifact class.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::ArchiveError;

const STAMP: &[FormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]");

/// `YYYYMMDD_HHMMSS` stamp used for the archive root and artifact names.
/// Local time when the offset is known, UTC otherwise.
pub fn stamp_now() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(STAMP).unwrap_or_else(|_| String::from("00000000_000000"))
}

/// File-name tag for a range token (`2001:db8::/32` -> `2001_db8___32`).
pub fn range_tag(token: &str) -> String {
    token
        .chars()
        .map(|c| if c == '/' || c == ':' || c == '.' { '_' } else { c })
        .collect()
}

/// The run's output tree:
///
/// ```text
/// <prefix>_YYYYMMDD_HHMMSS/
///   logs/    scan.log, errors.log
///   output/  *.lst, *_summary.txt
///   html/    <address>/<address>_page_<port>_<ts>.html
///            <address>/<address>_screenshot_<port>_<ts>.png
/// ```
///
/// Created exactly once per run; all other components only look paths up.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    root: PathBuf,
    logs: PathBuf,
    output: PathBuf,
    html: PathBuf,
}

impl ArchiveLayout {
    /// Create `<prefix>_<stamp>/{logs,output,html}` under `base`.
    pub fn create(base: &Path, prefix: &str) -> Result<Self, ArchiveError> {
        let root = base.join(format!("{prefix}_{}", stamp_now()));
        fs::create_dir_all(&root).map_err(|e| ArchiveError::Root {
            path: root.clone(),
            source: e,
        })?;
        let layout = ArchiveLayout {
            logs: root.join("logs"),
            output: root.join("output"),
            html: root.join("html"),
            root,
        };
        for dir in [&layout.logs, &layout.output, &layout.html] {
            fs::create_dir_all(dir).map_err(|e| ArchiveError::Subdir {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scan_log(&self) -> PathBuf {
        self.logs.join("scan.log")
    }

    pub fn errors_log(&self) -> PathBuf {
        self.logs.join("errors.log")
    }

    /// Raw scanner output for one range.
    pub fn list_path(&self, tag: &str) -> PathBuf {
        self.output.join(format!("{tag}.lst"))
    }

    /// One-line range descriptor handed to the scanner; removed after the
    /// owning job completes.
    pub fn descriptor_path(&self, tag: &str) -> PathBuf {
        self.output.join(format!("{tag}.ranges"))
    }

    pub fn summary_path(&self, tag: &str) -> PathBuf {
        self.output.join(format!("{tag}_summary.txt"))
    }

    pub fn aggregate_summary_path(&self) -> PathBuf {
        self.output.join("aggregate_summary.txt")
    }

    /// Per-address artifact directory. Callers create it lazily on the
    /// first artifact for that address.
    pub fn host_dir(&self, addr: &IpAddr) -> PathBuf {
        self.html.join(addr.to_string())
    }

    pub fn page_path(&self, addr: &IpAddr, port: u16, stamp: &str) -> PathBuf {
        self.host_dir(addr)
            .join(format!("{addr}_page_{port}_{stamp}.html"))
    }

    pub fn screenshot_path(&self, addr: &IpAddr, port: u16, stamp: &str) -> PathBuf {
        self.host_dir(addr)
            .join(format!("{addr}_screenshot_{port}_{stamp}.png"))
    }
}
