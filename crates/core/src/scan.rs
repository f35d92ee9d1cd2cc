//! One scan invocation: enumerate every source, correlate, assemble,
//! query versions, sort.

use crate::catalog::{bytes_to_gb, SizeCatalog};
use crate::config::ScanConfig;
use crate::correlate::{correlate, CorrelatedGroup, SourceRecords};
use crate::decode::{decode_payload, VersionInfo};
use crate::error::{QueryError, ScanError, SourceError};
use crate::record::{field, RawEnumerationRecord, SourceTag};
use crate::scsi::{self, PassThrough, QueryTarget, VersionQuery};
use crate::{format_usb_version, Locator, MediaKind, UnifiedDevice, UNKNOWN};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One OS enumeration source. `scan` must be idempotent and free of side
/// effects beyond querying the OS.
pub trait EnumerationAdapter {
    fn source(&self) -> SourceTag;
    fn scan(&self) -> Result<Vec<RawEnumerationRecord>, SourceError>;
}

/// Final ordering of devices, applied only after correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortHint {
    /// Lexical block path. Devices without a `/dev/` path go last.
    BlockPath,
    /// Physical drive index, unknown last.
    PhysicalDrive,
    /// Serial, unknown last.
    Serial,
}

impl SortHint {
    pub fn apply(&self, devices: &mut [UnifiedDevice]) {
        match self {
            SortHint::BlockPath => devices.sort_by_key(|device| {
                let path = device.block_path().map(|path| path.to_string_lossy().into_owned());
                match path {
                    Some(path) if path.starts_with("/dev/") => (false, path),
                    Some(path) => (true, path),
                    None => (true, String::new()),
                }
            }),
            SortHint::PhysicalDrive => devices.sort_by_key(|device| match device.physical_drive() {
                Some(index) => (false, index),
                None => (true, 0),
            }),
            SortHint::Serial => devices.sort_by(|a, b| {
                (!a.has_serial(), &a.serial).cmp(&(!b.has_serial(), &b.serial))
            }),
        }
    }
}

/// Something the caller should know about that did not stop the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    SourceUnavailable { tag: SourceTag, reason: String },
    SourcePermissionDenied { tag: SourceTag, reason: String },
    QueryFailed { serial: String, error: QueryError },
    DuplicateSerial { serial: String },
}

impl From<SourceError> for Diagnostic {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable { tag, reason } => Diagnostic::SourceUnavailable { tag, reason },
            SourceError::PermissionDenied { tag, reason } => {
                Diagnostic::SourcePermissionDenied { tag, reason }
            }
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::SourceUnavailable { tag, reason } => {
                write!(f, "{} source unavailable: {}", tag, reason)
            }
            Diagnostic::SourcePermissionDenied { tag, reason } => {
                write!(f, "{} source requires elevated privileges: {}", tag, reason)
            }
            Diagnostic::QueryFailed { serial, error } => {
                write!(f, "version query for {} failed: {}", serial, error)
            }
            Diagnostic::DuplicateSerial { serial } => {
                write!(f, "duplicate device with serial {} dropped", serial)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub devices: Vec<UnifiedDevice>,
    pub diagnostics: Vec<Diagnostic>,
    /// 1, or 2 when the bounded retry ran.
    pub passes: u32,
}

impl ScanReport {
    pub fn permission_denied(&self) -> bool {
        self.diagnostics.iter().any(|diagnostic| {
            matches!(
                diagnostic,
                Diagnostic::SourcePermissionDenied { .. }
                    | Diagnostic::QueryFailed {
                        error: QueryError::PermissionDenied(_),
                        ..
                    }
            )
        })
    }
}

struct Pass {
    sources: Vec<SourceRecords>,
    failures: Vec<SourceError>,
}

impl Pass {
    fn counts(&self) -> Vec<usize> {
        self.sources.iter().map(|source| source.records.len()).collect()
    }

    /// Counts disagree and at least one source saw something.
    fn is_inconsistent(&self) -> bool {
        let counts = self.counts();
        let any_nonzero = counts.iter().any(|count| *count > 0);
        let all_equal = counts.windows(2).all(|pair| pair[0] == pair[1]);
        any_nonzero && !all_equal
    }

    fn reached(&self) -> usize {
        self.sources.len() - self.failures.len()
    }
}

pub struct Scanner {
    config: ScanConfig,
    adapters: Vec<Box<dyn EnumerationAdapter>>,
    pass_through: Option<Box<dyn PassThrough>>,
    sort_hint: Option<SortHint>,
    catalog: SizeCatalog,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            adapters: Vec::new(),
            pass_through: None,
            sort_hint: None,
            catalog: SizeCatalog::builtin().clone(),
        }
    }

    /// Sources are consulted in registration order when assembling fields.
    pub fn adapter(mut self, adapter: Box<dyn EnumerationAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn pass_through(mut self, pass_through: Box<dyn PassThrough>) -> Self {
        self.pass_through = Some(pass_through);
        self
    }

    pub fn sort_hint(mut self, hint: SortHint) -> Self {
        self.sort_hint = Some(hint);
        self
    }

    pub fn catalog(mut self, catalog: SizeCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn scan(&self) -> Result<ScanReport, ScanError> {
        let mut pass = self.enumerate();
        let mut passes = 1;
        if pass.is_inconsistent() {
            info!(counts = ?pass.counts(), "source counts disagree, rescanning once");
            std::thread::sleep(self.config.retry_delay);
            pass = self.enumerate();
            passes = 2;
        }

        if pass.reached() == 0 {
            return Err(ScanError::NoSourcesReachable {
                failures: pass.failures,
            });
        }

        let mut diagnostics: Vec<Diagnostic> =
            pass.failures.into_iter().map(Diagnostic::from).collect();

        let groups = correlate(&pass.sources);
        let mut devices = Vec::with_capacity(groups.len());
        let mut seen = BTreeSet::new();
        for group in &groups {
            let device = assemble(group, &self.catalog);
            if device.has_serial() && !seen.insert(device.serial.clone()) {
                warn!(serial = %device.serial, "duplicate serial, keeping the first device");
                diagnostics.push(Diagnostic::DuplicateSerial {
                    serial: device.serial.clone(),
                });
                continue;
            }
            devices.push(device);
        }

        if self.config.query_versions {
            if let Some(pass_through) = &self.pass_through {
                for device in devices.iter_mut().filter(|device| device.has_serial()) {
                    let version =
                        self.query_version(pass_through.as_ref(), device, &mut diagnostics);
                    device.version = Some(version);
                }
            }
        }

        if let Some(hint) = self.sort_hint {
            hint.apply(&mut devices);
        }

        info!(devices = devices.len(), passes, "scan complete");
        Ok(ScanReport {
            devices,
            diagnostics,
            passes,
        })
    }

    /// Non-destructive read of the first block.
    pub fn poke(&self, device: &UnifiedDevice, timeout: Duration) -> Result<(), QueryError> {
        let pass_through = self
            .pass_through
            .as_ref()
            .ok_or_else(|| QueryError::NotFound("no pass-through on this host".to_string()))?;
        scsi::poke(pass_through.as_ref(), &QueryTarget::from_device(device), timeout)
    }

    fn enumerate(&self) -> Pass {
        let mut sources = Vec::new();
        let mut failures = Vec::new();
        for adapter in &self.adapters {
            let tag = adapter.source();
            if self.config.minimal && tag == SourceTag::ControllerLink {
                debug!(source = %tag, "skipped in minimal mode");
                continue;
            }
            match adapter.scan() {
                Ok(records) => {
                    debug!(source = %tag, count = records.len(), "source enumerated");
                    sources.push(SourceRecords::new(tag, records));
                }
                Err(err) => {
                    warn!(source = %tag, error = %err, "source failed, treating as empty");
                    sources.push(SourceRecords::new(tag, Vec::new()));
                    failures.push(err);
                }
            }
        }
        Pass { sources, failures }
    }

    fn query_version(
        &self,
        pass_through: &dyn PassThrough,
        device: &UnifiedDevice,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> VersionInfo {
        let target = QueryTarget::from_device(device);
        match pass_through.query(&target, self.config.query_timeout) {
            Ok(payload) => decode_payload(&payload),
            Err(error) => {
                if matches!(error, QueryError::PermissionDenied(_)) {
                    warn!(serial = %device.serial, %error, "version query needs elevated privileges");
                } else {
                    debug!(serial = %device.serial, %error, "version query failed");
                }
                diagnostics.push(Diagnostic::QueryFailed {
                    serial: device.serial.clone(),
                    error,
                });
                VersionInfo::unknown()
            }
        }
    }
}

fn first_text<'a>(records: &'a [RawEnumerationRecord], name: &str) -> Option<&'a str> {
    records.iter().find_map(|record| record.text(name))
}

fn first_int(records: &[RawEnumerationRecord], name: &str) -> Option<u64> {
    records.iter().find_map(|record| record.int(name))
}

fn first_flag(records: &[RawEnumerationRecord], name: &str) -> Option<bool> {
    records.iter().find_map(|record| record.flag(name))
}

fn hex_or_unknown(value: Option<&str>) -> String {
    match value {
        Some(value) => {
            let lower = value.trim().to_ascii_lowercase();
            lower.strip_prefix("0x").unwrap_or(&lower).to_string()
        }
        None => UNKNOWN.to_string(),
    }
}

/// Builds one device from a correlated group. The first record that
/// carries a field supplies it; placeholders carry nothing.
pub fn assemble(group: &CorrelatedGroup, catalog: &SizeCatalog) -> UnifiedDevice {
    let records = group.records.as_slice();
    let vendor_id = hex_or_unknown(first_text(records, field::VENDOR_ID));
    let product_id = hex_or_unknown(first_text(records, field::PRODUCT_ID));
    let bcd_device = hex_or_unknown(first_text(records, field::BCD_DEVICE));

    let serial = first_text(records, field::DEVICE_SERIAL)
        .or_else(|| first_text(records, field::SERIAL))
        .map(|serial| serial.trim().to_string())
        .unwrap_or_else(|| UNKNOWN.to_string());

    let product = first_text(records, field::PRODUCT)
        .map(str::to_string)
        .or_else(|| catalog.entry(&product_id).map(|entry| entry.name.clone()))
        .unwrap_or_else(|| UNKNOWN.to_string());

    let capacity = catalog.normalize(
        first_int(records, field::SIZE_BYTES).map(bytes_to_gb),
        &product_id,
        &bcd_device,
    );

    let locator = match first_int(records, field::PHYSICAL_DRIVE) {
        Some(index) => u32::try_from(index).ok().map(Locator::PhysicalDrive),
        None => first_text(records, field::BLOCK_PATH).map(|path| Locator::BlockPath(PathBuf::from(path))),
    };

    UnifiedDevice {
        vendor_id,
        product_id,
        bcd_device,
        usb_version: first_int(records, field::BCD_USB)
            .and_then(|bcd| u16::try_from(bcd).ok())
            .map(format_usb_version)
            .unwrap_or_else(|| UNKNOWN.to_string()),
        manufacturer: first_text(records, field::MANUFACTURER)
            .map(str::to_string)
            .unwrap_or_else(|| UNKNOWN.to_string()),
        product,
        serial,
        uas: records.iter().any(|record| record.flag(field::UAS) == Some(true)),
        media: first_flag(records, field::REMOVABLE)
            .map(MediaKind::from_removable)
            .unwrap_or_default(),
        capacity,
        locator,
        usb_controller: first_text(records, field::CONTROLLER).map(str::to_string),
        bus_number: first_int(records, field::BUS_NUMBER).and_then(|n| u8::try_from(n).ok()),
        device_address: first_int(records, field::DEVICE_ADDRESS).and_then(|n| u8::try_from(n).ok()),
        drive_letter: first_text(records, field::DRIVE_LETTER).map(str::to_string),
        read_only: first_flag(records, field::READ_ONLY),
        version: None,
    }
}
