//! Runs one external scanner process per range under a bounded pool and a
//! shared rate budget. Failures and timeouts stay confined to their job;
//! siblings always run to completion.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use log::warn;
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

use websweep_core::archive::{self, ArchiveLayout};
use websweep_core::logs::RunLogs;
use websweep_core::ratebudget::RateBudget;

/// Validate a port list destined for the scanner's `--ports` flag and
/// normalize it to canonical `p,p,lo-hi` text. Ranges are checked but kept
/// as ranges; the scanner does its own expansion, so `1-65535` stays three
/// tokens long instead of becoming sixty-five thousand.
pub fn normalize_ports(spec: &str) -> Result<String> {
    fn port(token: &str) -> Result<u16> {
        let p: u16 = token
            .trim()
            .parse()
            .map_err(|_| anyhow!("bad port {token:?}"))?;
        if p == 0 {
            return Err(anyhow!("port 0 is not scannable"));
        }
        Ok(p)
    }

    let mut out: Vec<String> = Vec::new();
    for piece in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let token = match piece.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (port(lo)?, port(hi)?);
                if lo > hi {
                    return Err(anyhow!("backwards port range {piece:?}"));
                }
                if lo == hi {
                    lo.to_string()
                } else {
                    format!("{lo}-{hi}")
                }
            }
            None => port(piece)?.to_string(),
        };
        if !out.contains(&token) {
            out.push(token);
        }
    }
    if out.is_empty() {
        return Err(anyhow!("empty port list"));
    }
    Ok(out.join(","))
}

/// One scanner invocation, bound to a single range.
#[derive(Debug, Clone)]
pub struct ScanJob {
    pub range: IpNet,
    /// Canonical comma-separated port list handed to the scanner.
    pub ports: String,
    /// This job's share of the aggregate rate, in packets per second.
    pub rate: u32,
    /// One-line range descriptor passed to the scanner via `-iL`; removed
    /// best-effort once the job reaches a terminal state.
    pub descriptor: PathBuf,
    /// Raw list-format output destination (`-oL`).
    pub output: PathBuf,
    pub timeout: Duration,
}

/// Terminal state of a scan job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Succeeded,
    Failed(String),
    TimedOut,
}

impl JobState {
    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Succeeded)
    }
}

#[derive(Debug)]
pub struct JobOutcome {
    pub range: IpNet,
    pub output: PathBuf,
    pub state: JobState,
}

/// How a scan job turns into a running scanner. The production
/// implementation shells out; tests substitute a mock.
#[async_trait]
pub trait ScanInvoker: Send + Sync {
    /// Run the job to completion, honoring `job.timeout`, streaming process
    /// output to the scan log. Never interprets the scanner's output file.
    async fn invoke(&self, job: &ScanJob, logs: &RunLogs) -> JobState;
}

/// Invokes a masscan-compatible scanner binary once per job.
pub struct ProcessInvoker {
    pub binary: String,
}

#[async_trait]
impl ScanInvoker for ProcessInvoker {
    async fn invoke(&self, job: &ScanJob, logs: &RunLogs) -> JobState {
        if let Err(e) = std::fs::write(&job.descriptor, format!("{}\n", job.range)) {
            return JobState::Failed(format!(
                "write range descriptor {}: {e}",
                job.descriptor.display()
            ));
        }
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-iL")
            .arg(&job.descriptor)
            .arg("--ports")
            .arg(&job.ports)
            .arg("--rate")
            .arg(job.rate.to_string())
            .arg("-oL")
            .arg(&job.output)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return JobState::Failed(format!("spawn {}: {e}", self.binary)),
        };
        // Dropping the wait future on timeout kills the process (kill_on_drop).
        match timeout(job.timeout, child.wait_with_output()).await {
            Err(_) => JobState::TimedOut,
            Ok(Err(e)) => JobState::Failed(format!("wait for {}: {e}", self.binary)),
            Ok(Ok(out)) => {
                for line in String::from_utf8_lossy(&out.stdout).lines() {
                    logs.scan_line(line);
                }
                for line in String::from_utf8_lossy(&out.stderr).lines() {
                    logs.scan_line(line);
                }
                if out.status.success() {
                    JobState::Succeeded
                } else {
                    JobState::Failed(format!("scanner exited with {}", out.status))
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub concurrency: usize,
    /// Skip process invocation entirely; every job reports a synthetic
    /// empty success so the rest of the pipeline can be exercised.
    pub dry_run: bool,
}

/// Build the job list for one run, allocating each job its rate share up
/// front. The share assumes the pool saturates, which is the instantaneous
/// worst case for the aggregate bound.
pub fn plan_jobs(
    ranges: &[IpNet],
    ports: &str,
    budget: &RateBudget,
    slots: usize,
    job_timeout: Duration,
    layout: &ArchiveLayout,
) -> Vec<ScanJob> {
    let rate = budget.share(ranges.len(), slots);
    ranges
        .iter()
        .map(|&range| {
            let tag = archive::range_tag(&range.to_string());
            ScanJob {
                range,
                ports: ports.to_string(),
                rate,
                descriptor: layout.descriptor_path(&tag),
                output: layout.list_path(&tag),
                timeout: job_timeout,
            }
        })
        .collect()
}

/// Run every job under the pool bound and collect per-job outcomes. Order
/// of the result follows completion, not submission; callers key off the
/// range. The run as a whole is only a failure when no job succeeded,
/// which is the caller's call to make.
pub async fn run_jobs(
    jobs: Vec<ScanJob>,
    opts: &SchedulerOptions,
    invoker: Arc<dyn ScanInvoker>,
    logs: Arc<RunLogs>,
) -> Vec<JobOutcome> {
    let expected = jobs.len();
    let sem = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let (tx, mut rx) = mpsc::channel::<JobOutcome>(expected.max(1));
    let dry_run = opts.dry_run;

    for job in jobs {
        let permit = sem.clone().acquire_owned().await.unwrap();
        let tx = tx.clone();
        let invoker = invoker.clone();
        let logs = logs.clone();
        tokio::spawn(async move {
            logs.scan_line(&format!(
                "job {} ports {} rate {} -> {}",
                job.range,
                job.ports,
                job.rate,
                job.output.display()
            ));
            let state = if dry_run {
                synthetic_success(&job)
            } else {
                invoker.invoke(&job, &logs).await
            };
            remove_descriptor(&job);
            match &state {
                JobState::Succeeded => logs.scan_line(&format!("job {} completed", job.range)),
                JobState::Failed(reason) => {
                    logs.error_line(&format!("scan job {}: {reason}", job.range));
                }
                JobState::TimedOut => {
                    logs.error_line(&format!(
                        "scan job {}: timed out after {:?}",
                        job.range, job.timeout
                    ));
                }
            }
            let _ = tx
                .send(JobOutcome {
                    range: job.range,
                    output: job.output,
                    state,
                })
                .await;
            drop(permit);
        });
    }
    drop(tx);

    let mut outcomes = Vec::with_capacity(expected);
    while let Some(outcome) = rx.recv().await {
        outcomes.push(outcome);
    }
    outcomes
}

fn synthetic_success(job: &ScanJob) -> JobState {
    match std::fs::File::create(&job.output) {
        Ok(_) => JobState::Succeeded,
        Err(e) => JobState::Failed(format!("create {}: {e}", job.output.display())),
    }
}

// Split descriptors are scratch state; losing one is worth a warning, never
// a failed job.
fn remove_descriptor(job: &ScanJob) {
    if !job.descriptor.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_file(&job.descriptor) {
        warn!(
            "could not remove split descriptor {}: {e}",
            job.descriptor.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockInvoker {
        calls: AtomicUsize,
        fail_range: Option<IpNet>,
        timeout_range: Option<IpNet>,
    }

    impl MockInvoker {
        fn new() -> Self {
            MockInvoker {
                calls: AtomicUsize::new(0),
                fail_range: None,
                timeout_range: None,
            }
        }
    }

    #[async_trait]
    impl ScanInvoker for MockInvoker {
        async fn invoke(&self, job: &ScanJob, _logs: &RunLogs) -> JobState {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.timeout_range == Some(job.range) {
                return JobState::TimedOut;
            }
            if self.fail_range == Some(job.range) {
                return JobState::Failed("scanner exited with exit status: 1".into());
            }
            std::fs::write(&job.output, "open tcp 80 203.0.113.5 1700000000\n").unwrap();
            JobState::Succeeded
        }
    }

    fn fixture() -> (tempfile::TempDir, ArchiveLayout, Arc<RunLogs>) {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArchiveLayout::create(dir.path(), "webscan").unwrap();
        let logs = Arc::new(RunLogs::open(&layout.scan_log(), &layout.errors_log()).unwrap());
        (dir, layout, logs)
    }

    fn plan(layout: &ArchiveLayout, ranges: &[&str]) -> Vec<ScanJob> {
        let nets: Vec<IpNet> = ranges.iter().map(|r| r.parse().unwrap()).collect();
        let budget = RateBudget::new(1000);
        plan_jobs(
            &nets,
            "80,443",
            &budget,
            budget.pool_slots(4),
            Duration::from_secs(5),
            layout,
        )
    }

    #[test]
    fn port_specs_stay_in_range_form() {
        assert_eq!(normalize_ports("80,443").unwrap(), "80,443");
        assert_eq!(normalize_ports(" 8000-8100 ,443").unwrap(), "8000-8100,443");
        assert_eq!(normalize_ports("1-65535").unwrap(), "1-65535");
        // Degenerate ranges and repeats collapse.
        assert_eq!(normalize_ports("80-80,80,443,443").unwrap(), "80,443");
    }

    #[test]
    fn port_specs_are_validated() {
        assert!(normalize_ports("0").is_err());
        assert!(normalize_ports("10-5").is_err());
        assert!(normalize_ports("80,http").is_err());
        assert!(normalize_ports("70000").is_err());
        assert!(normalize_ports("").is_err());
        assert!(normalize_ports(",,").is_err());
    }

    #[test]
    fn planned_rates_respect_the_budget() {
        let (_dir, layout, _logs) = fixture();
        let jobs = plan(&layout, &["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24"]);
        assert_eq!(jobs.len(), 3);
        for job in &jobs {
            assert_eq!(job.rate, 333);
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_siblings() {
        let (_dir, layout, logs) = fixture();
        let jobs = plan(&layout, &["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24"]);
        let invoker = Arc::new(MockInvoker {
            fail_range: Some("10.0.1.0/24".parse().unwrap()),
            ..MockInvoker::new()
        });
        let opts = SchedulerOptions {
            concurrency: 2,
            dry_run: false,
        };
        let outcomes = run_jobs(jobs, &opts, invoker.clone(), logs).await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes.iter().filter(|o| o.state.is_success()).count(), 2);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_is_isolated_too() {
        let (_dir, layout, logs) = fixture();
        let jobs = plan(&layout, &["10.0.0.0/24", "10.0.1.0/24"]);
        let invoker = Arc::new(MockInvoker {
            timeout_range: Some("10.0.0.0/24".parse().unwrap()),
            ..MockInvoker::new()
        });
        let opts = SchedulerOptions {
            concurrency: 1,
            dry_run: false,
        };
        let outcomes = run_jobs(jobs, &opts, invoker, logs).await;
        let timed_out = outcomes
            .iter()
            .find(|o| o.range == "10.0.0.0/24".parse::<IpNet>().unwrap())
            .unwrap();
        assert_eq!(timed_out.state, JobState::TimedOut);
        assert!(outcomes.iter().any(|o| o.state.is_success()));
    }

    #[tokio::test]
    async fn dry_run_never_invokes_and_leaves_empty_output() {
        let (_dir, layout, logs) = fixture();
        let jobs = plan(&layout, &["10.0.0.0/24", "2001:db8::/120"]);
        let outputs: Vec<PathBuf> = jobs.iter().map(|j| j.output.clone()).collect();
        let invoker = Arc::new(MockInvoker::new());
        let opts = SchedulerOptions {
            concurrency: 4,
            dry_run: true,
        };
        let outcomes = run_jobs(jobs, &opts, invoker.clone(), logs).await;
        assert!(outcomes.iter().all(|o| o.state.is_success()));
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
        for path in outputs {
            assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        }
    }

    #[tokio::test]
    async fn descriptors_are_cleaned_up() {
        let (_dir, layout, logs) = fixture();
        let jobs = plan(&layout, &["10.0.0.0/24"]);
        let descriptor = jobs[0].descriptor.clone();
        std::fs::write(&descriptor, "10.0.0.0/24\n").unwrap();
        let opts = SchedulerOptions {
            concurrency: 1,
            dry_run: false,
        };
        run_jobs(jobs, &opts, Arc::new(MockInvoker::new()), logs).await;
        assert!(!descriptor.exists());
    }
}
