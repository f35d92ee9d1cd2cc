//! Best-effort decoding of the READ BUFFER response.
//!
//! Two fields are extracted independently of each other:
//! the bridge firmware code from bytes 2..4, and the part number / model /
//! hardware revision / MCU firmware from the first `NN-NNNNNNNNNNN` run of
//! ASCII digits anywhere in the payload. Either can be present without the
//! other. Decoding never fails.

use crate::UNKNOWN;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Two digits, `-`, eleven digits; ASCII only since the payload is raw bytes.
const PART_PATTERN: &str = r"(?-u)(\d{2})-(\d{11})";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareTriple {
    pub major: Option<u8>,
    pub minor: Option<u8>,
    pub sub_minor: Option<u8>,
}

impl FirmwareTriple {
    pub fn is_complete(&self) -> bool {
        self.major.is_some() && self.minor.is_some() && self.sub_minor.is_some()
    }
}

impl fmt::Display for FirmwareTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.major, self.minor, self.sub_minor) {
            (Some(major), Some(minor), Some(sub)) => write!(f, "{}.{}.{}", major, minor, sub),
            _ => f.write_str(UNKNOWN),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub part_number: String,
    pub hardware_revision: String,
    pub model_id: String,
    pub mcu_firmware: FirmwareTriple,
    pub bridge_firmware: String,
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl VersionInfo {
    pub fn unknown() -> Self {
        Self {
            part_number: UNKNOWN.to_string(),
            hardware_revision: UNKNOWN.to_string(),
            model_id: UNKNOWN.to_string(),
            mcu_firmware: FirmwareTriple::default(),
            bridge_firmware: UNKNOWN.to_string(),
            raw: Vec::new(),
        }
    }

    /// Payload came back but carried no part-number pattern.
    pub fn is_ambiguous(&self) -> bool {
        !self.raw.is_empty() && self.part_number == UNKNOWN
    }
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self::unknown()
    }
}

pub fn decode_payload(data: &[u8]) -> VersionInfo {
    let mut info = VersionInfo::unknown();
    info.raw = data.to_vec();

    if data.len() >= 4 {
        info.bridge_firmware = format!("{:02X}{:02X}", data[2], data[3]);
    }

    if let Some(captures) = part_pattern().and_then(|pattern| pattern.captures(data)) {
        let prefix = ascii(&captures[1]);
        let body = &captures[2];
        info.part_number = format!("{}-{}", prefix, ascii(&body[0..4]));
        info.model_id = ascii(&body[4..6]);
        info.hardware_revision = ascii(&body[6..8]);
        info.mcu_firmware = FirmwareTriple {
            major: Some(digit(body[10])),
            minor: Some(digit(body[9])),
            sub_minor: Some(digit(body[8])),
        };
    } else if !data.is_empty() {
        tracing::debug!(len = data.len(), "version payload carries no part-number pattern");
    }

    info
}

fn part_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| match Regex::new(PART_PATTERN) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                tracing::error!(error = %err, "part-number pattern failed to compile");
                None
            }
        })
        .as_ref()
}

fn ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn digit(byte: u8) -> u8 {
    byte - b'0'
}
