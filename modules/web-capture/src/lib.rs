//! Per-target HTML fetch and screenshot capture over a bounded worker pool.
//! The two operations are independent; a failure of either is journaled and
//! confined to that capture type.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::redirect::Policy;
use reqwest::Client;
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use url::Url;

use websweep_core::archive::{self, ArchiveLayout};
use websweep_core::logs::RunLogs;

/// One (address, port) pair scheduled for capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub addr: IpAddr,
    pub port: u16,
}

/// Fetches raw page HTML. Mocked in tests.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url, op_timeout: Duration) -> Result<String>;
}

/// Captures a rendered screenshot. Mocked in tests.
#[async_trait]
pub trait Screenshotter: Send + Sync {
    async fn capture(&self, url: &Url, op_timeout: Duration) -> Result<Vec<u8>>;
}

/// HTTP collaborator on reqwest. Certificates are not verified: the point
/// is evidence collection from whatever answers, not trust.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::limited(3))
            .user_agent(user_agent)
            .danger_accept_invalid_certs(true)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .context("build http client")?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, op_timeout: Duration) -> Result<String> {
        let resp = self
            .client
            .get(url.clone())
            .timeout(op_timeout)
            .send()
            .await?;
        debug!("fetched {url}: {}", resp.status());
        Ok(resp.text().await?)
    }
}

/// Screenshot collaborator backed by a headless Chromium-compatible binary.
pub struct HeadlessBrowser {
    pub binary: String,
}

static SHOT_SEQ: AtomicU64 = AtomicU64::new(0);

#[async_trait]
impl Screenshotter for HeadlessBrowser {
    async fn capture(&self, url: &Url, op_timeout: Duration) -> Result<Vec<u8>> {
        let scratch = std::env::temp_dir().join(format!(
            "websweep_shot_{}_{}.png",
            std::process::id(),
            SHOT_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--headless")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--window-size=1280,1024")
            .arg(format!("--screenshot={}", scratch.display()))
            .arg(url.as_str())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let status = timeout(op_timeout, cmd.status())
            .await
            .map_err(|_| anyhow!("render timed out after {op_timeout:?}"))?
            .with_context(|| format!("spawn {}", self.binary))?;
        if !status.success() {
            let _ = std::fs::remove_file(&scratch);
            bail!("browser exited with {status}");
        }
        let bytes = std::fs::read(&scratch)
            .with_context(|| format!("read screenshot {}", scratch.display()))?;
        let _ = std::fs::remove_file(&scratch);
        Ok(bytes)
    }
}

/// Outcome of one capture operation: the artifact path, or the journaled
/// error text.
pub type OpOutcome = Result<PathBuf, String>;

#[derive(Debug)]
pub struct CaptureReport {
    pub target: Target,
    pub page: OpOutcome,
    pub screenshot: OpOutcome,
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub concurrency: usize,
    pub op_timeout: Duration,
}

/// URL for a target: https on the conventional TLS ports, http otherwise.
pub fn target_url(target: &Target) -> Result<Url> {
    let scheme = match target.port {
        443 | 8443 | 9443 => "https",
        _ => "http",
    };
    let host = match target.addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    };
    Url::parse(&format!("{scheme}://{host}:{}/", target.port))
        .map_err(|e| anyhow!("target url for {host}:{}: {e}", target.port))
}

/// Capture every target under the pool bound. The browser collaborator is
/// far heavier than the fetch, so the pool stays small; one stuck target
/// only ever holds its own slot.
pub async fn capture_targets(
    targets: Vec<Target>,
    opts: &CaptureOptions,
    fetcher: Arc<dyn PageFetcher>,
    browser: Arc<dyn Screenshotter>,
    layout: &ArchiveLayout,
    logs: Arc<RunLogs>,
) -> Vec<CaptureReport> {
    let expected = targets.len();
    let sem = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let (tx, mut rx) = mpsc::channel::<CaptureReport>(expected.max(1));
    let op_timeout = opts.op_timeout;

    for target in targets {
        let permit = sem.clone().acquire_owned().await.unwrap();
        let tx = tx.clone();
        let fetcher = fetcher.clone();
        let browser = browser.clone();
        let layout = layout.clone();
        let logs = logs.clone();
        tokio::spawn(async move {
            let report =
                capture_one(target, op_timeout, &*fetcher, &*browser, &layout, &logs).await;
            let _ = tx.send(report).await;
            drop(permit);
        });
    }
    drop(tx);

    let mut reports = Vec::with_capacity(expected);
    while let Some(report) = rx.recv().await {
        reports.push(report);
    }
    reports
}

async fn capture_one(
    target: Target,
    op_timeout: Duration,
    fetcher: &dyn PageFetcher,
    browser: &dyn Screenshotter,
    layout: &ArchiveLayout,
    logs: &RunLogs,
) -> CaptureReport {
    let url = match target_url(&target) {
        Ok(url) => url,
        Err(e) => {
            let msg = e.to_string();
            logs.error_line(&msg);
            return CaptureReport {
                target,
                page: Err(msg.clone()),
                screenshot: Err(msg),
            };
        }
    };
    let stamp = archive::stamp_now();

    let page_path = layout.page_path(&target.addr, target.port, &stamp);
    let shot_path = layout.screenshot_path(&target.addr, target.port, &stamp);
    let (page, screenshot) = tokio::join!(
        async {
            match fetcher.fetch(&url, op_timeout).await {
                Ok(body) => save_artifact(&page_path, body.as_bytes()),
                Err(e) => Err(format!("fetch {url}: {e}")),
            }
        },
        async {
            match browser.capture(&url, op_timeout).await {
                Ok(bytes) => save_artifact(&shot_path, &bytes),
                Err(e) => Err(format!("screenshot {url}: {e}")),
            }
        },
    );
    if let Err(msg) = &page {
        logs.error_line(msg);
    }
    if let Err(msg) = &screenshot {
        logs.error_line(msg);
    }
    CaptureReport {
        target,
        page,
        screenshot,
    }
}

// The per-address directory appears with the first artifact that actually
// materializes, not before.
fn save_artifact(path: &Path, bytes: &[u8]) -> OpOutcome {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)
    };
    match write() {
        Ok(()) => Ok(path.to_path_buf()),
        Err(e) => Err(format!("write {}: {e}", path.display())),
    }
}
