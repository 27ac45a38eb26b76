//! Shared run state for the websweep pipeline: the archive layout, the
//! scan/error log sinks and the scan-rate budget.

pub mod archive;
pub mod error;
pub mod logs;
pub mod ratebudget;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
