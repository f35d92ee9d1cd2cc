//! macOS host: `system_profiler`/`diskutil` enumeration and bulk-only
//! transport version queries.

pub mod candidate;
pub mod diskutil;
pub mod profiler;

#[cfg(target_os = "macos")]
mod transport;

pub use profiler::{ProfilerMediaSource, ProfilerUsbSource};
#[cfg(target_os = "macos")]
pub use transport::BulkOnlyPassThrough;

use usbtool_core::{ScanConfig, Scanner, SortHint};

pub fn scanner(config: ScanConfig) -> Scanner {
    let scanner = Scanner::new(config.clone())
        .adapter(Box::new(ProfilerUsbSource::new(config.clone())))
        .adapter(Box::new(ProfilerMediaSource::new(config)))
        .sort_hint(SortHint::Serial);
    #[cfg(target_os = "macos")]
    let scanner = scanner.pass_through(Box::new(BulkOnlyPassThrough::new()));
    scanner
}
