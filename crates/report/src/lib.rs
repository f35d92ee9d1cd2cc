use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use usbtool_core::{UnifiedDevice, UNKNOWN};

/// Presentation of one device. Key order is output order.
#[derive(Debug, Serialize, PartialEq)]
pub struct DeviceView {
    #[serde(rename = "bcdUSB")]
    pub bcd_usb: String,
    #[serde(rename = "idVendor")]
    pub id_vendor: String,
    #[serde(rename = "idProduct")]
    pub id_product: String,
    #[serde(rename = "bcdDevice")]
    pub bcd_device: String,
    #[serde(rename = "iManufacturer")]
    pub manufacturer: String,
    #[serde(rename = "iProduct")]
    pub product: String,
    #[serde(rename = "iSerial")]
    pub serial: String,
    #[serde(rename = "SCSIDevice")]
    pub uas: bool,
    #[serde(rename = "driveSizeGB")]
    pub drive_size_gb: String,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    #[serde(rename = "usbController", skip_serializing_if = "Option::is_none")]
    pub usb_controller: Option<String>,
    #[serde(rename = "busNumber", skip_serializing_if = "Option::is_none")]
    pub bus_number: Option<u8>,
    #[serde(rename = "deviceAddress", skip_serializing_if = "Option::is_none")]
    pub device_address: Option<u8>,
    #[serde(rename = "physicalDriveNum", skip_serializing_if = "Option::is_none")]
    pub physical_drive: Option<u32>,
    #[serde(rename = "driveLetter", skip_serializing_if = "Option::is_none")]
    pub drive_letter: Option<String>,
    #[serde(rename = "readOnly", skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(rename = "blockDevice", skip_serializing_if = "Option::is_none")]
    pub block_device: Option<String>,
    #[serde(flatten)]
    pub version: Option<VersionView>,
}

/// Shown as a whole or not at all. Bridge firmware is never printed.
#[derive(Debug, Serialize, PartialEq)]
pub struct VersionView {
    #[serde(rename = "scbPartNumber")]
    pub part_number: String,
    #[serde(rename = "hardwareVersion")]
    pub hardware_version: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
    #[serde(rename = "mcuFW")]
    pub mcu_firmware: String,
}

impl From<&UnifiedDevice> for DeviceView {
    fn from(device: &UnifiedDevice) -> Self {
        let version = device
            .version
            .as_ref()
            .filter(|_| device.version_fields_visible())
            .map(|version| VersionView {
                part_number: version.part_number.clone(),
                hardware_version: version.hardware_revision.clone(),
                model_id: version.model_id.clone(),
                mcu_firmware: version.mcu_firmware.to_string(),
            });
        Self {
            bcd_usb: device.usb_version.clone(),
            id_vendor: device.vendor_id.clone(),
            id_product: device.product_id.clone(),
            bcd_device: device.bcd_device.clone(),
            manufacturer: device.manufacturer.clone(),
            product: device.product.clone(),
            serial: device.serial.clone(),
            uas: device.uas,
            drive_size_gb: device.capacity.to_string(),
            media_type: device.media.as_str().to_string(),
            usb_controller: device.usb_controller.clone(),
            bus_number: device.bus_number,
            device_address: device.device_address,
            physical_drive: device.physical_drive(),
            drive_letter: device.drive_letter.clone(),
            read_only: device.read_only,
            block_device: device.block_path().map(|path| path.display().to_string()),
            version,
        }
    }
}

/// `{"devices": [{"1": {...}, "2": {...}}]}`, or `{"devices": []}` when empty.
pub fn devices_payload(devices: &[UnifiedDevice]) -> Result<Value> {
    let mut indexed = Map::new();
    for (index, device) in devices.iter().enumerate() {
        indexed.insert((index + 1).to_string(), serde_json::to_value(DeviceView::from(device))?);
    }
    let list = if indexed.is_empty() {
        Vec::new()
    } else {
        vec![Value::Object(indexed)]
    };
    let mut payload = Map::new();
    payload.insert("devices".to_string(), Value::Array(list));
    Ok(Value::Object(payload))
}

pub fn render_json(devices: &[UnifiedDevice]) -> Result<String> {
    Ok(serde_json::to_string_pretty(&devices_payload(devices)?)?)
}

/// Key/value pairs of one device in output order.
pub fn device_fields(device: &UnifiedDevice) -> Result<Vec<(String, String)>> {
    let value = serde_json::to_value(DeviceView::from(device))?;
    let Value::Object(map) = value else {
        return Ok(Vec::new());
    };
    Ok(map
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(text) => text,
                Value::Null => UNKNOWN.to_string(),
                other => other.to_string(),
            };
            (key, text)
        })
        .collect())
}

pub fn render_text(devices: &[UnifiedDevice]) -> Result<String> {
    if devices.is_empty() {
        return Ok("\nNo Apricorn devices found.\n".to_string());
    }
    let mut out = format!("\nFound {} Apricorn device(s):\n", devices.len());
    for (index, device) in devices.iter().enumerate() {
        out.push_str(&format!("\n=== Apricorn Device #{} ===\n", index + 1));
        let fields = device_fields(device)?;
        let width = fields.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
        for (key, value) in fields {
            out.push_str(&format!("  {:<width$} : {}\n", key, value, width = width));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use usbtool_core::{Capacity, Locator, MediaKind, VersionInfo};

    fn device() -> UnifiedDevice {
        UnifiedDevice {
            vendor_id: "0984".to_string(),
            product_id: "1407".to_string(),
            bcd_device: "0502".to_string(),
            usb_version: "3.2".to_string(),
            manufacturer: "Apricorn".to_string(),
            product: "Secure Key 3.0".to_string(),
            serial: "160050000012".to_string(),
            uas: false,
            media: MediaKind::RemovableMedia,
            capacity: Capacity::Nominal(16),
            locator: Some(Locator::BlockPath(PathBuf::from("/dev/sdb"))),
            usb_controller: None,
            bus_number: Some(2),
            device_address: Some(5),
            drive_letter: None,
            read_only: None,
            version: None,
        }
    }

    fn with_version(bridge: &str) -> UnifiedDevice {
        let mut version = VersionInfo::unknown();
        version.part_number = "12-3456".to_string();
        version.model_id = "78".to_string();
        version.hardware_revision = "90".to_string();
        version.bridge_firmware = bridge.to_string();
        let mut device = device();
        device.version = Some(version);
        device
    }

    #[test]
    fn empty_payload_has_empty_list() {
        assert_eq!(render_json(&[]).unwrap(), "{\n  \"devices\": []\n}");
    }

    #[test]
    fn payload_indexes_devices_from_one() {
        let payload = devices_payload(&[device(), device()]).unwrap();
        let list = payload["devices"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["1"]["iSerial"], "160050000012");
        assert_eq!(list[0]["2"]["blockDevice"], "/dev/sdb");
        assert_eq!(list[0]["1"]["driveSizeGB"], "16");
        assert!(list[0]["1"].get("physicalDriveNum").is_none());
    }

    #[test]
    fn keys_follow_declaration_order() {
        let keys: Vec<String> = device_fields(&device()).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(&keys[..3], ["bcdUSB", "idVendor", "idProduct"]);
        assert_eq!(keys.last().map(String::as_str), Some("blockDevice"));
    }

    #[test]
    fn version_fields_shown_as_group() {
        let fields = device_fields(&with_version("0502")).unwrap();
        let keys: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"scbPartNumber"));
        assert!(keys.contains(&"mcuFW"));
        assert!(!keys.contains(&"bridgeFW"));
    }

    #[test]
    fn version_fields_hidden_on_bridge_mismatch() {
        let payload = devices_payload(&[with_version("0503")]).unwrap();
        let entry = &payload["devices"][0]["1"];
        for key in ["scbPartNumber", "hardwareVersion", "modelID", "mcuFW"] {
            assert!(entry.get(key).is_none(), "{} should be hidden", key);
        }
    }

    #[test]
    fn text_listing_aligns_keys() {
        let text = render_text(&[device()]).unwrap();
        assert!(text.contains("Found 1 Apricorn device(s):"));
        assert!(text.contains("=== Apricorn Device #1 ==="));
        assert!(text.contains("  bcdUSB        : 3.2\n"));
        assert!(text.contains("  SCSIDevice    : false\n"));
    }

    #[test]
    fn drive_letter_and_read_only_follow_physical_drive() {
        let mut device = device();
        device.locator = Some(Locator::PhysicalDrive(3));
        device.drive_letter = Some("Not Formatted".to_string());
        device.read_only = Some(true);
        let payload = devices_payload(&[device.clone()]).unwrap();
        assert_eq!(payload["devices"][0]["1"]["driveLetter"], "Not Formatted");
        assert_eq!(payload["devices"][0]["1"]["readOnly"], true);

        let fields = device_fields(&device).unwrap();
        let keys: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        let at = keys.iter().position(|k| *k == "physicalDriveNum").unwrap();
        assert_eq!(&keys[at + 1..at + 3], ["driveLetter", "readOnly"]);
        assert!(fields.contains(&("readOnly".to_string(), "true".to_string())));
    }

    #[test]
    fn drive_letter_absent_when_unknown() {
        let payload = devices_payload(&[device()]).unwrap();
        assert!(payload["devices"][0]["1"].get("driveLetter").is_none());
        assert!(payload["devices"][0]["1"].get("readOnly").is_none());
    }

    #[test]
    fn text_listing_when_empty() {
        assert!(render_text(&[]).unwrap().contains("No Apricorn devices found."));
    }

    #[test]
    fn out_of_band_capacity_is_rendered() {
        let mut device = device();
        device.capacity = Capacity::OutOfBand;
        let fields = device_fields(&device).unwrap();
        assert!(fields.contains(&("driveSizeGB".to_string(), "N/A (OOB Mode)".to_string())));
    }
}
