use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ipnet::IpNet;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use scan_parse::{ParseStats, RecordSet};
use scan_runner::{JobState, ProcessInvoker, SchedulerOptions};
use web_capture::{CaptureOptions, HeadlessBrowser, HttpFetcher, Target};
use websweep_core::archive::{self, ArchiveLayout};
use websweep_core::logs::RunLogs;
use websweep_core::ratebudget::RateBudget;

mod config;

#[derive(Debug, Parser)]
#[command(
    name = "websweep",
    version,
    about = "Sweeps IP ranges with an external scanner and archives HTML + screenshots of everything that answers"
)]
struct Opts {
    /// File with one CIDR or address per line (# comments and blanks ignored)
    #[arg(long, value_name = "FILE")]
    ranges: PathBuf,
    /// Ports handed to the scanner: comma/range list (e.g., 80,443 or 8000-8100)
    #[arg(long, default_value = "80,443")]
    ports: String,
    /// Per-operation fetch/screenshot timeout in seconds
    #[arg(long, default_value_t = 2)]
    timeout_secs: u64,
    /// Aggregate scan rate in packets per second, shared by all jobs
    #[arg(long, default_value_t = 1000)]
    rate: u32,
    /// Maximum IPv6 host bits before a range is split into subnets
    #[arg(long, default_value_t = 32)]
    max_host_bits: u8,
    /// Validate orchestration without invoking the scanner or the browser
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Max concurrent scanner processes
    #[arg(long, default_value_t = 4)]
    scan_concurrency: usize,
    /// Max concurrent fetch/capture workers (the browser is expensive)
    #[arg(long, default_value_t = 4)]
    fetch_concurrency: usize,
    /// Per-scan-job timeout in seconds
    #[arg(long, default_value_t = 600)]
    scan_timeout_secs: u64,
    /// Archive root prefix
    #[arg(long, default_value = "webscan")]
    prefix: String,
    /// Directory the archive root is created in
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
    /// Scanner binary (masscan-compatible flags)
    #[arg(long, default_value = "masscan")]
    scanner_bin: String,
    /// Headless browser binary used for screenshots
    #[arg(long, default_value = "chromium")]
    browser_bin: String,
    /// Optional config file (YAML). If omitted, loads ./websweep.yaml if present.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Opts {
    fn merge(&mut self, cfg: &config::Config) {
        if let Some(p) = &cfg.prefix {
            self.prefix = p.clone();
        }
        if let Some(d) = &cfg.out_dir {
            self.out_dir = d.clone();
        }
        if let Some(s) = &cfg.scan {
            if let Some(v) = &s.ports {
                self.ports = v.clone();
            }
            if let Some(v) = s.rate {
                self.rate = v;
            }
            if let Some(v) = s.concurrency {
                self.scan_concurrency = v;
            }
            if let Some(v) = s.job_timeout_secs {
                self.scan_timeout_secs = v;
            }
            if let Some(v) = s.max_host_bits {
                self.max_host_bits = v;
            }
            if let Some(v) = &s.scanner_bin {
                self.scanner_bin = v.clone();
            }
        }
        if let Some(f) = &cfg.fetch {
            if let Some(v) = f.timeout_secs {
                self.timeout_secs = v;
            }
            if let Some(v) = f.concurrency {
                self.fetch_concurrency = v;
            }
            if let Some(v) = &f.browser_bin {
                self.browser_bin = v.clone();
            }
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let mut opts = Opts::parse();
    if let Some(cfg) = config::load_config(opts.config.as_deref()) {
        opts.merge(&cfg);
    }
    run(&opts)
}

fn run(opts: &Opts) -> Result<()> {
    let started = Instant::now();

    let ports_arg = scan_runner::normalize_ports(&opts.ports)?;

    let list = range_split::read_ranges_file(&opts.ranges)?;
    if list.ranges.is_empty() {
        return Err(anyhow!("no usable ranges in {}", opts.ranges.display()));
    }
    let sub_ranges: Vec<IpNet> = list
        .ranges
        .iter()
        .flat_map(|&r| range_split::split_range(r, opts.max_host_bits))
        .collect();
    info!(
        "{} input ranges -> {} scan ranges ({} lines skipped)",
        list.ranges.len(),
        sub_ranges.len(),
        list.skipped
    );

    // The one fatal condition besides an all-failed scan round.
    let layout = ArchiveLayout::create(&opts.out_dir, &opts.prefix)?;
    let logs = Arc::new(
        RunLogs::open(&layout.scan_log(), &layout.errors_log()).context("open run logs")?,
    );
    println!("archive root: {}", layout.root().display());

    let budget = RateBudget::new(opts.rate);
    let slots = budget.pool_slots(opts.scan_concurrency);
    let jobs = scan_runner::plan_jobs(
        &sub_ranges,
        &ports_arg,
        &budget,
        slots,
        Duration::from_secs(opts.scan_timeout_secs),
        &layout,
    );

    let rt = tokio::runtime::Runtime::new()?;

    let sched = SchedulerOptions {
        concurrency: slots,
        dry_run: opts.dry_run,
    };
    let invoker = Arc::new(ProcessInvoker {
        binary: opts.scanner_bin.clone(),
    });
    let outcomes = rt.block_on(scan_runner::run_jobs(jobs, &sched, invoker, logs.clone()));

    let jobs_total = outcomes.len();
    let jobs_ok = outcomes.iter().filter(|o| o.state.is_success()).count();
    let jobs_failed = outcomes
        .iter()
        .filter(|o| matches!(o.state, JobState::Failed(_)))
        .count();
    let jobs_timed_out = outcomes
        .iter()
        .filter(|o| o.state == JobState::TimedOut)
        .count();
    if jobs_ok == 0 {
        eprintln!(
            "all {jobs_total} scan jobs failed ({jobs_failed} failed, {jobs_timed_out} timed out); see {}",
            layout.errors_log().display()
        );
        return Err(anyhow!("no scan job succeeded"));
    }

    let mut aggregate = RecordSet::new();
    let mut stats = ParseStats::default();
    let mut cross_range_dups = 0;
    for outcome in &outcomes {
        if !outcome.state.is_success() {
            continue;
        }
        let mut per_range = RecordSet::new();
        match scan_parse::parse_file(&outcome.output, &mut per_range) {
            Ok(s) => stats.absorb(s),
            Err(e) => {
                warn!("skipping output of {}: {e:#}", outcome.range);
                logs.error_line(&format!("parse {}: {e:#}", outcome.output.display()));
                continue;
            }
        }
        let tag = archive::range_tag(&outcome.range.to_string());
        scan_parse::write_summary(
            &layout.summary_path(&tag),
            &outcome.range.to_string(),
            per_range.records(),
        )?;
        let added = aggregate.merge(per_range.records());
        cross_range_dups += per_range.len() - added;
    }
    scan_parse::write_aggregate_summary(&layout.aggregate_summary_path(), &aggregate)?;
    let hosts = aggregate.grouped().len();

    if aggregate.is_empty() {
        info!("no open ports discovered");
    }
    let targets: Vec<Target> = aggregate
        .records()
        .iter()
        .map(|r| Target {
            addr: r.addr,
            port: r.port,
        })
        .collect();
    let fetcher = Arc::new(HttpFetcher::new(&format!(
        "websweep/{}",
        websweep_core::version()
    ))?);
    let browser = Arc::new(HeadlessBrowser {
        binary: opts.browser_bin.clone(),
    });
    let capture = CaptureOptions {
        concurrency: opts.fetch_concurrency,
        op_timeout: Duration::from_secs(opts.timeout_secs),
    };
    let reports = rt.block_on(web_capture::capture_targets(
        targets,
        &capture,
        fetcher,
        browser,
        &layout,
        logs.clone(),
    ));

    let pages_ok = reports.iter().filter(|r| r.page.is_ok()).count();
    let shots_ok = reports.iter().filter(|r| r.screenshot.is_ok()).count();
    let duration_ms = started.elapsed().as_millis();

    println!(
        "scan jobs: {jobs_ok}/{jobs_total} succeeded ({jobs_failed} failed, {jobs_timed_out} timed out)"
    );
    println!(
        "open ports: {} across {hosts} hosts ({} duplicate sightings, {} malformed lines)",
        aggregate.len(),
        stats.duplicates + cross_range_dups,
        stats.malformed
    );
    println!(
        "captures: {pages_ok}/{} pages, {shots_ok}/{} screenshots",
        reports.len(),
        reports.len()
    );
    let summary = serde_json::json!({
        "archive": layout.root(),
        "ranges": list.ranges.len(),
        "scan_ranges": sub_ranges.len(),
        "jobs": { "total": jobs_total, "succeeded": jobs_ok, "failed": jobs_failed, "timed_out": jobs_timed_out },
        "open_ports": aggregate.len(),
        "hosts": hosts,
        "malformed_lines": stats.malformed,
        "pages_saved": pages_ok,
        "screenshots_saved": shots_ok,
        "capture_failures": (reports.len() - pages_ok) + (reports.len() - shots_ok),
        "dry_run": opts.dry_run,
        "duration_ms": duration_ms,
    });
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}
