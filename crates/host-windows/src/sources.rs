//! Enumeration adapters backed by CIM queries.

use tracing::debug;
use usbtool_core::{EnumerationAdapter, RawEnumerationRecord, ScanConfig, SourceError, SourceTag};

use crate::cim;

fn query(tag: SourceTag, script: &str) -> Result<serde_json::Value, SourceError> {
    cim::run_query(script).map_err(|err| {
        let reason = format!("{:#}", err);
        if reason.contains("Access denied") || reason.contains("Access is denied") {
            SourceError::permission_denied(tag, reason)
        } else {
            SourceError::unavailable(tag, reason)
        }
    })
}

pub struct PnpEntitySource {
    config: ScanConfig,
}

impl PnpEntitySource {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }
}

impl EnumerationAdapter for PnpEntitySource {
    fn source(&self) -> SourceTag {
        SourceTag::PnP
    }

    fn scan(&self) -> Result<Vec<RawEnumerationRecord>, SourceError> {
        let value = query(SourceTag::PnP, cim::PNP_QUERY)?;
        Ok(cim::pnp_records(&value, &self.config))
    }
}

/// Lookups that only decorate disks; a failure leaves them out.
fn optional_query(script: &str) -> Option<serde_json::Value> {
    match cim::run_query(script) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(error = %err, "volume query failed");
            None
        }
    }
}

pub struct DiskDriveSource {
    config: ScanConfig,
}

impl DiskDriveSource {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    fn volumes(&self) -> cim::DiskVolumes {
        // Walking the partition associations is the slow part of a scan.
        let letters = if self.config.minimal {
            None
        } else {
            Some(
                optional_query(cim::DRIVE_LETTER_QUERY)
                    .map(|value| cim::drive_letters(&value))
                    .unwrap_or_default(),
            )
        };
        let read_only = optional_query(cim::READ_ONLY_QUERY)
            .map(|value| cim::read_only_map(&value))
            .unwrap_or_default();
        cim::DiskVolumes { letters, read_only }
    }
}

impl EnumerationAdapter for DiskDriveSource {
    fn source(&self) -> SourceTag {
        SourceTag::DiskDrive
    }

    fn scan(&self) -> Result<Vec<RawEnumerationRecord>, SourceError> {
        let value = query(SourceTag::DiskDrive, cim::DISK_QUERY)?;
        Ok(cim::disk_records(&value, &self.volumes()))
    }
}

pub struct ControllerLinkSource {
    config: ScanConfig,
}

impl ControllerLinkSource {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }
}

impl EnumerationAdapter for ControllerLinkSource {
    fn source(&self) -> SourceTag {
        SourceTag::ControllerLink
    }

    fn scan(&self) -> Result<Vec<RawEnumerationRecord>, SourceError> {
        let controllers = query(SourceTag::ControllerLink, cim::CONTROLLER_QUERY)?;
        let links = query(SourceTag::ControllerLink, cim::CONTROLLER_LINK_QUERY)?;
        Ok(cim::controller_records(&controllers, &links, &self.config))
    }
}
