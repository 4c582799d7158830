//! Test support shared by the workspace crates.

mod capture;
mod log;

pub use capture::{CapturedEvent, LogCapture};
pub use log::{TestGuard, init_test_logging};
