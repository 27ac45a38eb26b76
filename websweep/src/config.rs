use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ScanSection {
    pub ports: Option<String>,
    pub rate: Option<u32>,
    pub concurrency: Option<usize>,
    pub job_timeout_secs: Option<u64>,
    pub max_host_bits: Option<u8>,
    pub scanner_bin: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct FetchSection {
    pub timeout_secs: Option<u64>,
    pub concurrency: Option<usize>,
    pub browser_bin: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub prefix: Option<String>,
    pub out_dir: Option<PathBuf>,
    pub scan: Option<ScanSection>,
    pub fetch: Option<FetchSection>,
}

pub fn load_config(path: Option<&Path>) -> Option<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("websweep.yaml");
            if p.exists() { p.to_path_buf() } else { return None; }
        }
    };
    let s = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_partial_sections() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "prefix: sweep").unwrap();
        writeln!(f, "scan:").unwrap();
        writeln!(f, "  rate: 250").unwrap();
        let cfg = load_config(Some(f.path())).unwrap();
        assert_eq!(cfg.prefix.as_deref(), Some("sweep"));
        assert_eq!(cfg.scan.unwrap().rate, Some(250));
        assert!(cfg.fetch.is_none());
    }

    #[test]
    fn missing_file_is_none() {
        assert!(load_config(Some(Path::new("/nonexistent/websweep.yaml"))).is_none());
    }
}
