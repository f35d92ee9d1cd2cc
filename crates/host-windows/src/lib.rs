//! Windows host: CIM and libusb enumeration, SCSI pass-through version
//! queries on physical drives.

pub mod cim;
mod sources;

#[cfg(windows)]
mod bus;
#[cfg(windows)]
mod sptd;

#[cfg(windows)]
pub use bus::LibusbSource;
pub use sources::{ControllerLinkSource, DiskDriveSource, PnpEntitySource};
#[cfg(windows)]
pub use sptd::SptdPassThrough;

use usbtool_core::{ScanConfig, Scanner, SortHint};

pub fn scanner(config: ScanConfig) -> Scanner {
    let scanner = Scanner::new(config.clone())
        .adapter(Box::new(PnpEntitySource::new(config.clone())))
        .adapter(Box::new(DiskDriveSource::new(config.clone())));
    #[cfg(windows)]
    let scanner = scanner
        .adapter(Box::new(LibusbSource::new(config.clone())))
        .pass_through(Box::new(SptdPassThrough::new()));
    scanner
        .adapter(Box::new(ControllerLinkSource::new(config)))
        .sort_hint(SortHint::PhysicalDrive)
}
