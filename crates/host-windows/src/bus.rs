//! Bus-level descriptors through libusb.

use rusb::{DeviceHandle, GlobalContext, Version};
use tracing::debug;
use usbtool_core::record::field;
use usbtool_core::{EnumerationAdapter, RawEnumerationRecord, ScanConfig, SourceError, SourceTag};

/// Packs a decoded descriptor version back into its BCD form.
fn to_bcd(version: Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor() & 0x0f) << 4)
        | u16::from(version.sub_minor() & 0x0f)
}

fn serial(handle: &DeviceHandle<GlobalContext>, descriptor: &rusb::DeviceDescriptor) -> Option<String> {
    handle
        .read_serial_number_string_ascii(descriptor)
        .ok()
        .map(|serial| serial.trim().to_string())
}

pub struct LibusbSource {
    config: ScanConfig,
}

impl LibusbSource {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }
}

impl EnumerationAdapter for LibusbSource {
    fn source(&self) -> SourceTag {
        SourceTag::BusDevice
    }

    fn scan(&self) -> Result<Vec<RawEnumerationRecord>, SourceError> {
        let devices = rusb::devices().map_err(|err| match err {
            rusb::Error::Access => SourceError::permission_denied(SourceTag::BusDevice, err),
            other => SourceError::unavailable(SourceTag::BusDevice, other),
        })?;

        let mut records = Vec::new();
        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            let vendor = format!("{:04x}", descriptor.vendor_id());
            let product = format!("{:04x}", descriptor.product_id());
            if !self.config.accepts(&vendor, &product) {
                continue;
            }
            // Mass-storage drivers usually refuse the open; the serial is optional.
            let serial = match device.open() {
                Ok(handle) => serial(&handle, &descriptor),
                Err(err) => {
                    debug!(bus = device.bus_number(), address = device.address(), error = %err, "open failed");
                    None
                }
            };
            records.push(
                RawEnumerationRecord::new(SourceTag::BusDevice, records.len())
                    .with(field::VENDOR_ID, vendor)
                    .with(field::PRODUCT_ID, product)
                    .with(field::BCD_DEVICE, format!("{:04x}", to_bcd(descriptor.device_version())))
                    .with(field::BCD_USB, to_bcd(descriptor.usb_version()))
                    .with(field::BUS_NUMBER, device.bus_number())
                    .with(field::DEVICE_ADDRESS, device.address())
                    .with_opt(field::SERIAL, serial),
            );
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repacks_descriptor_versions() {
        assert_eq!(to_bcd(Version(3, 2, 0)), 0x0320);
        assert_eq!(to_bcd(Version(5, 0, 2)), 0x0502);
        assert_eq!(to_bcd(Version(10, 1, 0)), 0x1010);
    }
}
