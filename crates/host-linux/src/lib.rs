//! Linux host: sysfs enumeration and `SG_IO` version queries.

mod sysfs;

#[cfg(target_os = "linux")]
mod sg;

#[cfg(target_os = "linux")]
pub use sg::SgIoPassThrough;
pub use sysfs::{parse_usb_version, BlockDeviceSource, Sysfs, UsbDeviceSource};

use usbtool_core::{ScanConfig, Scanner, SortHint};

pub fn scanner(config: ScanConfig) -> Scanner {
    scanner_at(Sysfs::system(), config)
}

pub fn scanner_at(sysfs: Sysfs, config: ScanConfig) -> Scanner {
    let scanner = Scanner::new(config.clone())
        .adapter(Box::new(UsbDeviceSource::new(sysfs.clone(), config.clone())))
        .adapter(Box::new(BlockDeviceSource::new(sysfs, config)))
        .sort_hint(SortHint::BlockPath);
    #[cfg(target_os = "linux")]
    let scanner = scanner.pass_through(Box::new(SgIoPassThrough::new()));
    scanner
}
