//! Raw records produced by one enumeration source during one scan pass.

use std::collections::BTreeMap;
use std::fmt;

/// Field names shared by every adapter. Adapters only set what their source
/// actually reports.
pub mod field {
    pub const VENDOR_ID: &str = "vendor_id";
    pub const PRODUCT_ID: &str = "product_id";
    /// Serial fragment used for correlation. May carry source decoration
    /// such as a `&0` instance suffix or a transport prefix.
    pub const SERIAL: &str = "serial";
    /// Serial as the device itself reports it, when it differs from `SERIAL`.
    pub const DEVICE_SERIAL: &str = "device_serial";
    pub const DESCRIPTION: &str = "description";
    pub const MANUFACTURER: &str = "manufacturer";
    pub const PRODUCT: &str = "product";
    pub const BCD_DEVICE: &str = "bcd_device";
    pub const BCD_USB: &str = "bcd_usb";
    pub const SIZE_BYTES: &str = "size_bytes";
    pub const REMOVABLE: &str = "removable";
    pub const UAS: &str = "uas";
    pub const BLOCK_PATH: &str = "block_path";
    pub const PHYSICAL_DRIVE: &str = "physical_drive";
    pub const CONTROLLER: &str = "controller";
    pub const BUS_NUMBER: &str = "bus_number";
    pub const DEVICE_ADDRESS: &str = "device_address";
    /// Comma-separated volume letters, or "Not Formatted".
    pub const DRIVE_LETTER: &str = "drive_letter";
    pub const READ_ONLY: &str = "read_only";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceTag {
    PnP,
    DiskDrive,
    BusDevice,
    ControllerLink,
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceTag::PnP => "pnp",
            SourceTag::DiskDrive => "disk-drive",
            SourceTag::BusDevice => "bus-device",
            SourceTag::ControllerLink => "controller-link",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Int(u64),
    Flag(bool),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Int(u64::from(value))
    }
}

impl From<u16> for FieldValue {
    fn from(value: u16) -> Self {
        FieldValue::Int(u64::from(value))
    }
}

impl From<u8> for FieldValue {
    fn from(value: u8) -> Self {
        FieldValue::Int(u64::from(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Flag(value)
    }
}

/// Immutable once built. `ordinal` is the record's position in its source's
/// list and is only meaningful within that source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEnumerationRecord {
    source: SourceTag,
    ordinal: Option<usize>,
    fields: BTreeMap<String, FieldValue>,
}

impl RawEnumerationRecord {
    pub fn new(source: SourceTag, ordinal: usize) -> Self {
        Self {
            source,
            ordinal: Some(ordinal),
            fields: BTreeMap::new(),
        }
    }

    /// Stand-in for a source that had nothing to offer an anchor. Every
    /// field reads as absent.
    pub fn placeholder(source: SourceTag) -> Self {
        Self {
            source,
            ordinal: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Like `with`, but skips empty text and `None`.
    pub fn with_opt(self, name: &str, value: Option<impl Into<FieldValue>>) -> Self {
        match value.map(Into::into) {
            Some(FieldValue::Text(text)) if text.trim().is_empty() => self,
            Some(value) => self.with(name, value),
            None => self,
        }
    }

    pub fn source(&self) -> SourceTag {
        self.source
    }

    pub fn ordinal(&self) -> Option<usize> {
        self.ordinal
    }

    pub fn is_placeholder(&self) -> bool {
        self.ordinal.is_none()
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Text(value)) if !value.trim().is_empty() => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<u64> {
        match self.fields.get(name) {
            Some(FieldValue::Int(value)) => Some(*value),
            Some(FieldValue::Text(value)) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.fields.get(name) {
            Some(FieldValue::Flag(value)) => Some(*value),
            Some(FieldValue::Int(value)) => Some(*value != 0),
            _ => None,
        }
    }

    /// All text fields joined, uppercased. Used for marker lookups.
    pub fn descriptive_text(&self) -> String {
        self.fields
            .values()
            .filter_map(|value| match value {
                FieldValue::Text(text) => Some(text.to_ascii_uppercase()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
