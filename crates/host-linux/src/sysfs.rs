use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use usbtool_core::record::field;
use usbtool_core::{EnumerationAdapter, RawEnumerationRecord, ScanConfig, SourceError, SourceTag};

/// A sysfs mount. Tests point this at a temporary tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn system() -> Self {
        Self::new("/sys")
    }

    fn usb_devices(&self) -> PathBuf {
        self.root.join("bus/usb/devices")
    }

    fn block(&self) -> PathBuf {
        self.root.join("block")
    }
}

/// USB device directories: the PnP source.
pub struct UsbDeviceSource {
    sysfs: Sysfs,
    config: ScanConfig,
}

impl UsbDeviceSource {
    pub fn new(sysfs: Sysfs, config: ScanConfig) -> Self {
        Self { sysfs, config }
    }

    fn collect(&self) -> Result<Vec<RawEnumerationRecord>> {
        let mut records = Vec::new();
        for dir in sorted_entries(&self.sysfs.usb_devices())? {
            let name = file_name(&dir);
            // Interfaces are "2-1:1.0"; only whole devices carry descriptors.
            if name.contains(':') {
                continue;
            }
            let Some((vendor_id, product_id)) = usb_ids(&dir) else {
                continue;
            };
            if !self.config.accepts(&vendor_id, &product_id) {
                continue;
            }
            let record = RawEnumerationRecord::new(SourceTag::PnP, records.len())
                .with(field::VENDOR_ID, vendor_id)
                .with(field::PRODUCT_ID, product_id)
                .with_opt(field::BCD_DEVICE, read_string(dir.join("bcdDevice")))
                .with_opt(
                    field::BCD_USB,
                    read_string(dir.join("version")).and_then(|v| parse_usb_version(&v)),
                )
                .with_opt(field::MANUFACTURER, read_string(dir.join("manufacturer")))
                .with_opt(field::PRODUCT, read_string(dir.join("product")))
                .with_opt(field::SERIAL, read_string(dir.join("serial")))
                .with_opt(field::BUS_NUMBER, read_u64(dir.join("busnum")))
                .with_opt(field::DEVICE_ADDRESS, read_u64(dir.join("devnum")))
                .with(field::UAS, bound_to_uas(&dir));
            debug!(device = %name, "usb device matched");
            records.push(record);
        }
        Ok(records)
    }
}

impl EnumerationAdapter for UsbDeviceSource {
    fn source(&self) -> SourceTag {
        SourceTag::PnP
    }

    fn scan(&self) -> std::result::Result<Vec<RawEnumerationRecord>, SourceError> {
        self.collect().map_err(|err| source_error(SourceTag::PnP, err))
    }
}

/// Whole-disk block devices backed by a matching USB device: the DiskDrive source.
pub struct BlockDeviceSource {
    sysfs: Sysfs,
    config: ScanConfig,
}

impl BlockDeviceSource {
    pub fn new(sysfs: Sysfs, config: ScanConfig) -> Self {
        Self { sysfs, config }
    }

    fn collect(&self) -> Result<Vec<RawEnumerationRecord>> {
        let mut records = Vec::new();
        for dir in sorted_entries(&self.sysfs.block())? {
            let name = file_name(&dir);
            if is_virtual_disk(&name, &dir) {
                continue;
            }
            let Some(usb_dir) = usb_ancestor(&dir) else {
                continue;
            };
            let Some((vendor_id, product_id)) = usb_ids(&usb_dir) else {
                continue;
            };
            if !self.config.accepts(&vendor_id, &product_id) {
                continue;
            }
            let size_bytes = read_u64(dir.join("size")).map(|sectors| sectors.saturating_mul(512));
            let record = RawEnumerationRecord::new(SourceTag::DiskDrive, records.len())
                .with(field::VENDOR_ID, vendor_id)
                .with(field::PRODUCT_ID, product_id)
                .with_opt(field::SERIAL, read_string(usb_dir.join("serial")))
                .with_opt(field::DESCRIPTION, read_string(dir.join("device/model")))
                .with_opt(field::SIZE_BYTES, size_bytes)
                .with(field::REMOVABLE, read_u64(dir.join("removable")) == Some(1))
                .with(field::BLOCK_PATH, format!("/dev/{}", name))
                .with(field::UAS, bound_to_uas(&usb_dir));
            debug!(disk = %name, usb = %usb_dir.display(), "block device matched");
            records.push(record);
        }
        Ok(records)
    }
}

impl EnumerationAdapter for BlockDeviceSource {
    fn source(&self) -> SourceTag {
        SourceTag::DiskDrive
    }

    fn scan(&self) -> std::result::Result<Vec<RawEnumerationRecord>, SourceError> {
        self.collect().map_err(|err| source_error(SourceTag::DiskDrive, err))
    }
}

fn source_error(tag: SourceTag, err: anyhow::Error) -> SourceError {
    let denied = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| io.kind() == std::io::ErrorKind::PermissionDenied);
    if denied {
        SourceError::permission_denied(tag, format!("{:#}", err))
    } else {
        SourceError::unavailable(tag, format!("{:#}", err))
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn usb_ids(dir: &Path) -> Option<(String, String)> {
    let vendor = read_string(dir.join("idVendor"))?;
    let product = read_string(dir.join("idProduct"))?;
    Some((vendor.to_ascii_lowercase(), product.to_ascii_lowercase()))
}

/// Nearest directory above the block device that describes a USB device.
fn usb_ancestor(block_dir: &Path) -> Option<PathBuf> {
    let device = fs::canonicalize(block_dir.join("device")).ok()?;
    device
        .ancestors()
        .find(|dir| dir.join("idVendor").is_file())
        .map(Path::to_path_buf)
}

/// Any interface of the device bound to the `uas` driver.
fn bound_to_uas(usb_dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(usb_dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        entry.file_name().to_string_lossy().contains(':')
            && fs::read_link(entry.path().join("driver"))
                .ok()
                .and_then(|target| target.file_name().map(|name| name == "uas"))
                .unwrap_or(false)
    })
}

/// sysfs `version` is the bcdUSB as text: " 3.20" is 0x0320.
pub fn parse_usb_version(text: &str) -> Option<u16> {
    let (major, minor) = text.trim().split_once('.')?;
    let major: u16 = major.parse().ok()?;
    let mut digits = minor.chars().map(|c| c.to_digit(10));
    let minor = digits.next().flatten().unwrap_or(0) as u16;
    let subminor = digits.next().flatten().unwrap_or(0) as u16;
    if major > 0xFF || minor > 9 || subminor > 9 {
        return None;
    }
    Some((major << 8) | (minor << 4) | subminor)
}

fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64(path: impl AsRef<Path>) -> Option<u64> {
    read_string(path).and_then(|value| value.parse::<u64>().ok())
}

fn is_virtual_disk(name: &str, path: &Path) -> bool {
    if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
        return true;
    }
    if let Ok(target) = fs::canonicalize(path.join("device")) {
        if target.to_string_lossy().contains("/virtual/") {
            return true;
        }
    }
    false
}
