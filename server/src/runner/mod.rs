//! Running built programs: process start, stdio bridging and port discovery.

pub mod probe;
pub mod process;

pub use probe::{platform_scanner, PortScanner, PortSet};
pub use process::{start_process, RunOptions};
