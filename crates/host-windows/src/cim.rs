//! CIM queries through PowerShell and parsing of their `ConvertTo-Json`
//! output.

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::process::Command;
use usbtool_core::record::field;
use usbtool_core::{RawEnumerationRecord, ScanConfig, SourceTag};

type Row = Map<String, Value>;

const VENDOR_NAME: &str = "Apricorn";
const UAS_SERIAL_PREFIX: &str = "MSFT30";
const SKIPPED_BRIDGES: [&str; 2] = ["SATAWIRE", "FLASH_DISK"];

pub const PNP_QUERY: &str = "Get-CimInstance -ClassName Win32_PnPEntity -Filter \"DeviceID LIKE 'USB%'\" \
     | Select-Object DeviceID, Description | ConvertTo-Json -Compress";
pub const DISK_QUERY: &str = "Get-CimInstance -ClassName Win32_DiskDrive \
     | Select-Object DeviceID, PNPDeviceID, Caption, Size, MediaType, InterfaceType, Index \
     | ConvertTo-Json -Compress";
pub const DRIVE_LETTER_QUERY: &str = "Get-CimInstance -ClassName Win32_DiskDrive \
     | ForEach-Object { $index = $_.Index; Get-CimAssociatedInstance -InputObject $_ -ResultClassName Win32_DiskPartition \
     | Get-CimAssociatedInstance -ResultClassName Win32_LogicalDisk \
     | ForEach-Object { [pscustomobject]@{ Index = $index; Letter = $_.DeviceID } } } \
     | ConvertTo-Json -Compress";
pub const READ_ONLY_QUERY: &str = "Get-CimInstance -Namespace root/Microsoft/Windows/Storage -ClassName MSFT_Disk \
     | Select-Object Number, IsReadOnly, BusType | ConvertTo-Json -Compress";
pub const CONTROLLER_QUERY: &str = "Get-CimInstance -ClassName Win32_USBController \
     | Select-Object DeviceID, Name | ConvertTo-Json -Compress";
pub const CONTROLLER_LINK_QUERY: &str = "Get-CimInstance -ClassName Win32_USBControllerDevice \
     | ForEach-Object { [pscustomobject]@{ Controller = $_.Antecedent.DeviceID; Device = $_.Dependent.DeviceID } } \
     | ConvertTo-Json -Compress";

pub fn run_query(script: &str) -> Result<Value> {
    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", script])
        .output()
        .context("run powershell")?;
    if !output.status.success() {
        bail!(
            "powershell exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(stdout.trim()).context("parse ConvertTo-Json output")
}

/// `ConvertTo-Json` emits a bare object for a single row and nothing at all
/// for none.
pub fn rows(value: &Value) -> Vec<&Row> {
    match value {
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        Value::Object(row) => vec![row],
        _ => Vec::new(),
    }
}

fn text<'a>(row: &'a Row, key: &str) -> Option<&'a str> {
    row.get(key).and_then(Value::as_str).filter(|value| !value.trim().is_empty())
}

fn number(row: &Row, key: &str) -> Option<u64> {
    match row.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn hex_after(device_id: &str, marker: &str) -> Option<String> {
    let upper = device_id.to_ascii_uppercase();
    let start = upper.find(marker)? + marker.len();
    let digits = upper.get(start..start + 4)?;
    digits
        .chars()
        .all(|c| c.is_ascii_hexdigit())
        .then(|| digits.to_ascii_lowercase())
}

/// `USB\VID_0984&PID_1407\...` is `("0984", "1407")`.
pub fn vid_pid(device_id: &str) -> Option<(String, String)> {
    Some((hex_after(device_id, "VID_")?, hex_after(device_id, "PID_")?))
}

/// Last `\` segment of a device or PnP id.
pub fn instance_id(device_id: &str) -> &str {
    device_id.rsplit('\\').next().unwrap_or(device_id)
}

/// Ids Windows generates for devices without a serial string contain `&`.
fn reported_serial(device_id: &str) -> Option<&str> {
    let instance = instance_id(device_id);
    (instance != device_id && !instance.contains('&')).then_some(instance)
}

/// Interface children of composite devices repeat the parent's ids.
fn is_interface(device_id: &str) -> bool {
    device_id.to_ascii_uppercase().contains("&MI_")
}

pub fn pnp_records(value: &Value, config: &ScanConfig) -> Vec<RawEnumerationRecord> {
    let mut records = Vec::new();
    for row in rows(value) {
        let Some(device_id) = text(row, "DeviceID") else {
            continue;
        };
        let Some((vendor, product)) = vid_pid(device_id) else {
            continue;
        };
        if !config.accepts(&vendor, &product) || is_interface(device_id) {
            continue;
        }
        let serial = reported_serial(device_id);
        let device_serial = serial.and_then(|serial| serial.strip_prefix(UAS_SERIAL_PREFIX));
        records.push(
            RawEnumerationRecord::new(SourceTag::PnP, records.len())
                .with(field::VENDOR_ID, vendor)
                .with(field::PRODUCT_ID, product)
                .with(field::MANUFACTURER, VENDOR_NAME)
                .with_opt(field::DESCRIPTION, text(row, "Description"))
                .with_opt(field::SERIAL, serial)
                .with_opt(field::DEVICE_SERIAL, device_serial)
                .with(field::UAS, device_serial.is_some()),
        );
    }
    records
}

fn title_case(words: &str) -> String {
    words
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Product string carried in the `PROD_` segment of a disk's PnP id.
pub fn product_from_pnp(pnp: &str) -> Option<String> {
    let (_, rest) = pnp.split_once("PROD_")?;
    if pnp.starts_with("USBSTOR") {
        let (product, _) = rest.split_once("&REV")?;
        return Some(title_case(&product.replace('_', " ")));
    }
    let product = rest.split('\\').next().unwrap_or(rest).replace('_', " ");
    if product.contains("NVX") {
        (product == "PADLOCK NVX").then(|| "Padlock NVX".to_string())
    } else if product.contains("PORTABLE") {
        (product.trim() == "AEGIS PORTABLE").then(|| "Aegis Portable".to_string())
    } else {
        Some(product)
    }
}

const NOT_FORMATTED: &str = "Not Formatted";
const BUS_TYPE_USB: u64 = 7;

/// Volume letters per physical drive index, in association order.
pub fn drive_letters(value: &Value) -> HashMap<u64, String> {
    let mut letters: HashMap<u64, Vec<&str>> = HashMap::new();
    for row in rows(value) {
        if let (Some(index), Some(letter)) = (number(row, "Index"), text(row, "Letter")) {
            letters.entry(index).or_default().push(letter);
        }
    }
    letters
        .into_iter()
        .map(|(index, letters)| (index, letters.join(", ")))
        .collect()
}

/// `IsReadOnly` of USB disks by disk number.
pub fn read_only_map(value: &Value) -> HashMap<u64, bool> {
    rows(value)
        .into_iter()
        .filter(|row| number(row, "BusType") == Some(BUS_TYPE_USB))
        .filter_map(|row| {
            let read_only = row.get("IsReadOnly").and_then(Value::as_bool).unwrap_or(false);
            Some((number(row, "Number")?, read_only))
        })
        .collect()
}

/// Volume state merged into disk records.
#[derive(Debug, Default, Clone)]
pub struct DiskVolumes {
    /// `None` when letters were not looked up.
    pub letters: Option<HashMap<u64, String>>,
    pub read_only: HashMap<u64, bool>,
}

impl DiskVolumes {
    fn letter_of(&self, index: u64, size: u64) -> Option<String> {
        let letters = self.letters.as_ref()?;
        if size == 0 {
            return Some(NOT_FORMATTED.to_string());
        }
        Some(letters.get(&index).cloned().unwrap_or_else(|| NOT_FORMATTED.to_string()))
    }
}

/// Disks carry no vendor id; the caption names the vendor.
pub fn disk_records(value: &Value, volumes: &DiskVolumes) -> Vec<RawEnumerationRecord> {
    let mut records = Vec::new();
    for row in rows(value) {
        if text(row, "InterfaceType") != Some("USB") {
            continue;
        }
        if !text(row, "Caption").map(|caption| caption.contains(VENDOR_NAME)).unwrap_or(false) {
            continue;
        }
        let Some(size) = number(row, "Size") else {
            continue;
        };
        let Some(pnp) = text(row, "PNPDeviceID") else {
            continue;
        };
        if SKIPPED_BRIDGES.iter().any(|bridge| pnp.contains(bridge)) {
            continue;
        }
        // Only USBSTOR instance ids embed the device serial.
        let serial = pnp.starts_with("USBSTOR").then(|| instance_id(pnp));
        let removable = !text(row, "MediaType")
            .map(|media| media.contains("External hard disk"))
            .unwrap_or(false);
        let index = number(row, "Index");
        let drive_letter = index.and_then(|index| volumes.letter_of(index, size));
        let read_only = index.map(|index| volumes.read_only.get(&index).copied().unwrap_or(false));
        records.push(
            RawEnumerationRecord::new(SourceTag::DiskDrive, records.len())
                .with_opt(field::SERIAL, serial)
                .with_opt(field::DESCRIPTION, text(row, "Caption"))
                .with_opt(field::PRODUCT, product_from_pnp(pnp))
                .with(field::SIZE_BYTES, size)
                .with(field::REMOVABLE, removable)
                .with_opt(field::PHYSICAL_DRIVE, index)
                .with_opt(field::DRIVE_LETTER, drive_letter)
                .with_opt(field::READ_ONLY, read_only),
        );
    }
    records
}

/// "Intel(R) USB 3.0 eXtensible Host Controller" is "Intel"; anything else
/// is reported as the ASMedia controller.
pub fn controller_label(name: &str) -> String {
    if name.starts_with("Intel") {
        name.chars().take(5).collect()
    } else {
        "ASMedia".to_string()
    }
}

pub fn controller_records(
    controllers: &Value,
    links: &Value,
    config: &ScanConfig,
) -> Vec<RawEnumerationRecord> {
    let names: HashMap<String, &str> = rows(controllers)
        .into_iter()
        .filter_map(|row| Some((text(row, "DeviceID")?.to_ascii_uppercase(), text(row, "Name")?)))
        .collect();

    let mut records = Vec::new();
    for link in rows(links) {
        let (Some(controller), Some(device_id)) = (text(link, "Controller"), text(link, "Device")) else {
            continue;
        };
        let Some((vendor, product)) = vid_pid(device_id) else {
            continue;
        };
        if !config.accepts(&vendor, &product) || is_interface(device_id) {
            continue;
        }
        let Some(name) = names.get(&controller.to_ascii_uppercase()) else {
            continue;
        };
        let device_id = device_id.to_ascii_uppercase();
        records.push(
            RawEnumerationRecord::new(SourceTag::ControllerLink, records.len())
                .with(field::VENDOR_ID, vendor)
                .with(field::PRODUCT_ID, product)
                .with_opt(field::SERIAL, reported_serial(&device_id))
                .with(field::CONTROLLER, controller_label(name)),
        );
    }
    records
}
