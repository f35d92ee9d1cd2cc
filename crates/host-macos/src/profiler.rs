//! `system_profiler SPUSBDataType -json` parsing.

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::process::Command;
use usbtool_core::record::field;
use usbtool_core::{EnumerationAdapter, RawEnumerationRecord, ScanConfig, SourceError, SourceTag};

use crate::diskutil::{DiskTool, Diskutil};

type Entry = Map<String, Value>;

const VENDOR_NAME: &str = "Apricorn";

pub fn run_system_profiler() -> Result<Value> {
    let output = Command::new("system_profiler")
        .args(["SPUSBDataType", "-json"])
        .output()
        .context("run system_profiler")?;
    if !output.status.success() {
        bail!("system_profiler exited with {}", output.status);
    }
    serde_json::from_slice(&output.stdout).context("parse system_profiler output")
}

/// Every dictionary below `SPUSBDataType` that belongs to the vendor, in
/// document order.
pub fn matching_entries<'a>(root: &'a Value, config: &ScanConfig) -> Vec<&'a Entry> {
    let mut matches = Vec::new();
    if let Some(items) = root.get("SPUSBDataType") {
        collect(items, config, &mut matches);
    }
    matches
}

fn collect<'a>(value: &'a Value, config: &ScanConfig, matches: &mut Vec<&'a Entry>) {
    match value {
        Value::Object(entry) => {
            let vendor_matches = text(entry, "vendor_id")
                .map(|vendor| config.is_vendor(&hex_id(vendor)))
                .unwrap_or(false);
            let named = text(entry, "manufacturer")
                .map(|name| name.contains(VENDOR_NAME))
                .unwrap_or(false);
            if vendor_matches || named {
                matches.push(entry);
            }
            for child in entry.values() {
                collect(child, config, matches);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, config, matches);
            }
        }
        _ => {}
    }
}

fn text<'a>(entry: &'a Entry, key: &str) -> Option<&'a str> {
    entry.get(key).and_then(Value::as_str)
}

fn number(entry: &Entry, key: &str) -> Option<u64> {
    match entry.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// "0x0984  (Apricorn Inc.)" is "0984".
pub fn hex_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("0x")
        .chars()
        .take(4)
        .collect::<String>()
        .to_ascii_lowercase()
}

/// "5.02" is "0502".
pub fn bcd_code(raw: &str) -> String {
    format!("{:0>4}", raw.trim().replace('.', ""))
}

fn ids(entry: &Entry, config: &ScanConfig) -> Option<(String, String)> {
    let vendor = text(entry, "vendor_id").map(hex_id)?;
    let product = text(entry, "product_id").map(hex_id)?;
    if config.accepts(&vendor, &product) {
        Some((vendor, product))
    } else {
        None
    }
}

fn first_media(entry: &Entry) -> Option<&Entry> {
    entry.get("Media")?.as_array()?.first()?.as_object()
}

pub fn usb_records(root: &Value, config: &ScanConfig) -> Vec<RawEnumerationRecord> {
    let mut records = Vec::new();
    for entry in matching_entries(root, config) {
        let Some(name) = text(entry, "_name") else {
            continue;
        };
        let Some((vendor, product)) = ids(entry, config) else {
            continue;
        };
        // Only bus power hints at the link speed here.
        let bcd_usb: u16 = if number(entry, "bus_power").unwrap_or(0) > 500 {
            0x0300
        } else {
            0x0200
        };
        records.push(
            RawEnumerationRecord::new(SourceTag::PnP, records.len())
                .with(field::VENDOR_ID, vendor)
                .with(field::PRODUCT_ID, product)
                .with_opt(field::BCD_DEVICE, text(entry, "bcd_device").map(bcd_code))
                .with(field::BCD_USB, bcd_usb)
                .with(field::MANUFACTURER, text(entry, "manufacturer").unwrap_or(VENDOR_NAME))
                .with(field::PRODUCT, name)
                .with_opt(field::SERIAL, text(entry, "serial_num")),
        );
    }
    records
}

pub fn media_records(
    root: &Value,
    config: &ScanConfig,
    uas_check: impl Fn(&str) -> bool,
) -> Vec<RawEnumerationRecord> {
    let mut records = Vec::new();
    for entry in matching_entries(root, config) {
        let Some(media) = first_media(entry) else {
            continue;
        };
        let Some((vendor, product)) = ids(entry, config) else {
            continue;
        };
        let bsd = text(media, "bsd_name");
        records.push(
            RawEnumerationRecord::new(SourceTag::DiskDrive, records.len())
                .with(field::VENDOR_ID, vendor)
                .with(field::PRODUCT_ID, product)
                .with_opt(field::SERIAL, text(entry, "serial_num"))
                .with_opt(field::DESCRIPTION, text(media, "_name"))
                .with_opt(field::SIZE_BYTES, number(media, "size_in_bytes"))
                .with(field::REMOVABLE, text(media, "removable_media") == Some("yes"))
                .with_opt(field::BLOCK_PATH, bsd.map(|bsd| format!("/dev/{}", bsd)))
                .with(field::UAS, bsd.map(&uas_check).unwrap_or(false)),
        );
    }
    records
}

fn source_error(tag: SourceTag, err: anyhow::Error) -> SourceError {
    SourceError::unavailable(tag, format!("{:#}", err))
}

pub struct ProfilerUsbSource {
    config: ScanConfig,
}

impl ProfilerUsbSource {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }
}

impl EnumerationAdapter for ProfilerUsbSource {
    fn source(&self) -> SourceTag {
        SourceTag::PnP
    }

    fn scan(&self) -> std::result::Result<Vec<RawEnumerationRecord>, SourceError> {
        let root = run_system_profiler().map_err(|err| source_error(SourceTag::PnP, err))?;
        Ok(usb_records(&root, &self.config))
    }
}

pub struct ProfilerMediaSource {
    config: ScanConfig,
    tool: Diskutil,
}

impl ProfilerMediaSource {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            tool: Diskutil,
        }
    }
}

impl EnumerationAdapter for ProfilerMediaSource {
    fn source(&self) -> SourceTag {
        SourceTag::DiskDrive
    }

    fn scan(&self) -> std::result::Result<Vec<RawEnumerationRecord>, SourceError> {
        let root = run_system_profiler().map_err(|err| source_error(SourceTag::DiskDrive, err))?;
        Ok(media_records(&root, &self.config, |bsd| self.tool.is_uas(bsd)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "SPUSBDataType": [{
                "_name": "USB31Bus",
                "_items": [{
                    "_name": "USB3.1 Hub",
                    "vendor_id": "0x2109",
                    "_items": [{
                        "_name": "Secure Key 3.0",
                        "vendor_id": "0x0984  (Apricorn)",
                        "product_id": "0x1407",
                        "bcd_device": "5.02",
                        "bus_power": "900",
                        "manufacturer": "Apricorn",
                        "serial_num": "160050000012",
                        "Media": [{
                            "_name": "Secure Key 3.0",
                            "bsd_name": "disk4",
                            "removable_media": "yes",
                            "size_in_bytes": 15_698_000_000u64
                        }]
                    }, {
                        "_name": "Aegis Portable",
                        "vendor_id": "0x0984",
                        "product_id": "0x0351",
                        "bcd_device": "1.00",
                        "bus_power": "500",
                        "serial_num": "AEG0001"
                    }]
                }]
            }]
        })
    }

    #[test]
    fn finds_nested_vendor_entries() {
        let root = sample();
        let entries = matching_entries(&root, &ScanConfig::default());
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn builds_pnp_records() {
        let records = usb_records(&sample(), &ScanConfig::default());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text(field::PRODUCT_ID), Some("1407"));
        assert_eq!(records[0].text(field::BCD_DEVICE), Some("0502"));
        assert_eq!(records[0].int(field::BCD_USB), Some(0x0300));
        assert_eq!(records[1].int(field::BCD_USB), Some(0x0200));
        assert_eq!(records[1].text(field::MANUFACTURER), Some("Apricorn"));
    }

    #[test]
    fn builds_media_records_from_first_media() {
        let records = media_records(&sample(), &ScanConfig::default(), |bsd| bsd == "disk4");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.text(field::BLOCK_PATH), Some("/dev/disk4"));
        assert_eq!(record.int(field::SIZE_BYTES), Some(15_698_000_000));
        assert_eq!(record.flag(field::REMOVABLE), Some(true));
        assert_eq!(record.flag(field::UAS), Some(true));
        assert_eq!(record.text(field::SERIAL), Some("160050000012"));
    }

    #[test]
    fn formats_identifiers() {
        assert_eq!(hex_id("0x0984  (Apricorn)"), "0984");
        assert_eq!(bcd_code("5.02"), "0502");
        assert_eq!(bcd_code("10.00"), "1000");
    }
}
