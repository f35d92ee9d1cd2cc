use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod bot;
pub mod catalog;
pub mod config;
pub mod correlate;
pub mod decode;
pub mod error;
pub mod record;
pub mod scan;
pub mod scsi;

pub use catalog::{Capacity, SizeCatalog};
pub use config::ScanConfig;
pub use decode::{decode_payload, FirmwareTriple, VersionInfo};
pub use error::{QueryError, ScanError, SourceError};
pub use record::{FieldValue, RawEnumerationRecord, SourceTag};
pub use scan::{Diagnostic, EnumerationAdapter, ScanReport, Scanner, SortHint};
pub use scsi::{PassThrough, QueryTarget, VersionQuery};

/// Sentinel rendered for every field the device or the host did not report.
pub const UNKNOWN: &str = "N/A";

/// Vendor id of the devices this tool looks for.
pub const DEFAULT_VENDOR_ID: u16 = 0x0984;

/// Where the raw block device for a unit can be reached.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Locator {
    /// `\\.\PhysicalDriveN` on Windows.
    PhysicalDrive(u32),
    /// `/dev/sdX` on Linux, `/dev/diskN` on macOS.
    BlockPath(PathBuf),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaKind {
    BasicDisk,
    RemovableMedia,
    #[default]
    Unknown,
}

impl MediaKind {
    pub fn from_removable(removable: bool) -> Self {
        if removable {
            MediaKind::RemovableMedia
        } else {
            MediaKind::BasicDisk
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::BasicDisk => "Basic Disk",
            MediaKind::RemovableMedia => "Removable Media",
            MediaKind::Unknown => "Unknown",
        }
    }
}

/// One physical unit after all enumeration sources have been fused.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UnifiedDevice {
    pub vendor_id: String,   // lowercase hex, "0984"
    pub product_id: String,
    pub bcd_device: String,
    pub usb_version: String, // "3.2", "2.0"
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
    pub uas: bool,
    pub media: MediaKind,
    pub capacity: Capacity,
    pub locator: Option<Locator>,
    pub usb_controller: Option<String>,
    pub bus_number: Option<u8>,
    pub device_address: Option<u8>,
    pub drive_letter: Option<String>,
    pub read_only: Option<bool>,
    pub version: Option<VersionInfo>,
}

impl UnifiedDevice {
    pub fn has_serial(&self) -> bool {
        !self.serial.is_empty() && self.serial != UNKNOWN
    }

    pub fn physical_drive(&self) -> Option<u32> {
        match &self.locator {
            Some(Locator::PhysicalDrive(index)) => Some(*index),
            _ => None,
        }
    }

    pub fn block_path(&self) -> Option<&PathBuf> {
        match &self.locator {
            Some(Locator::BlockPath(path)) => Some(path),
            _ => None,
        }
    }

    /// Whether the decoded version fields may be shown for this device.
    ///
    /// They are shown as a group only when a part number was decoded and, if
    /// both are known, the bridge firmware code agrees with the bcdDevice the
    /// USB descriptor reported.
    pub fn version_fields_visible(&self) -> bool {
        let Some(version) = &self.version else {
            return false;
        };
        if version.part_number == UNKNOWN {
            return false;
        }
        if version.bridge_firmware == UNKNOWN || self.bcd_device == UNKNOWN {
            return true;
        }
        normalize_revision_code(&version.bridge_firmware)
            == normalize_revision_code(&self.bcd_device)
    }
}

/// Canonical form of a revision code for comparison: "0x0502", "0502" and
/// "502" are all "502".
pub fn normalize_revision_code(value: &str) -> String {
    let lower = value.trim().to_ascii_lowercase();
    let digits = lower.strip_prefix("0x").unwrap_or(&lower);
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Converts a bcdUSB descriptor value into "major.minor[subminor]".
pub fn format_usb_version(bcd: u16) -> String {
    let major = (bcd & 0xFF00) >> 8;
    let minor = (bcd & 0x00F0) >> 4;
    let subminor = bcd & 0x000F;
    if subminor != 0 {
        format!("{}.{}{}", major, minor, subminor)
    } else {
        format!("{}.{}", major, minor)
    }
}
