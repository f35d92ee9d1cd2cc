//! Bulk-only transport over libusb. macOS offers no block-level SCSI
//! pass-through to unprivileged callers, so the disk is unmounted, the
//! mass-storage interface is claimed and the command goes out as a CBW.

use rusb::{Device, DeviceDescriptor, DeviceHandle, Direction, GlobalContext, TransferType};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;
use usbtool_core::bot::{self, BulkPipe};
use usbtool_core::scsi::{Cdb, ScsiResponse};
use usbtool_core::{Locator, PassThrough, QueryError, QueryTarget};

use crate::candidate;
use crate::diskutil::{Diskutil, MountGuard};

const MASS_STORAGE_CLASS: u8 = 0x08;
const BULK_ONLY_PROTOCOL: u8 = 0x50;

const MIN_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_TAG: AtomicU32 = AtomicU32::new(1);

fn usb_error(context: &str, err: rusb::Error) -> QueryError {
    match err {
        rusb::Error::NotFound | rusb::Error::NoDevice => QueryError::NotFound(context.to_string()),
        rusb::Error::Access => QueryError::PermissionDenied(context.to_string()),
        rusb::Error::Timeout => QueryError::Transport(format!("{}: timed out", context)),
        other => QueryError::Transport(format!("{}: {}", context, other)),
    }
}

/// A claimed interface; released on drop.
struct ClaimedPipe {
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
    endpoint_in: u8,
    endpoint_out: u8,
}

impl ClaimedPipe {
    fn claim(device: &Device<GlobalContext>, mut handle: DeviceHandle<GlobalContext>) -> Result<Self, QueryError> {
        let config = device
            .active_config_descriptor()
            .map_err(|err| usb_error("read configuration", err))?;

        let mut found = None;
        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                if alt.class_code() != MASS_STORAGE_CLASS || alt.protocol_code() != BULK_ONLY_PROTOCOL {
                    continue;
                }
                let bulk = |direction: Direction| {
                    alt.endpoint_descriptors()
                        .find(|ep| ep.transfer_type() == TransferType::Bulk && ep.direction() == direction)
                        .map(|ep| ep.address())
                };
                if let (Some(endpoint_in), Some(endpoint_out)) = (bulk(Direction::In), bulk(Direction::Out)) {
                    found = Some((alt.interface_number(), endpoint_in, endpoint_out));
                    break;
                }
            }
            if found.is_some() {
                break;
            }
        }
        let (interface, endpoint_in, endpoint_out) = found.ok_or_else(|| {
            QueryError::NotFound("no bulk-only mass-storage interface".to_string())
        })?;

        // Not every platform build of libusb supports detaching.
        if let Err(err) = handle.set_auto_detach_kernel_driver(true) {
            debug!(error = %err, "auto-detach unavailable");
        }
        handle
            .claim_interface(interface)
            .map_err(|err| usb_error("claim mass-storage interface", err))?;
        Ok(Self {
            handle,
            interface,
            endpoint_in,
            endpoint_out,
        })
    }
}

impl BulkPipe for ClaimedPipe {
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<usize, QueryError> {
        self.handle
            .write_bulk(self.endpoint_out, data, timeout)
            .map_err(|err| usb_error("bulk out", err))
    }

    fn bulk_in(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, QueryError> {
        self.handle
            .read_bulk(self.endpoint_in, buf, timeout)
            .map_err(|err| usb_error("bulk in", err))
    }

    fn clear_halt(&mut self) -> Result<(), QueryError> {
        self.handle
            .clear_halt(self.endpoint_in)
            .map_err(|err| usb_error("clear halt", err))
    }
}

impl Drop for ClaimedPipe {
    fn drop(&mut self) {
        if let Err(err) = self.handle.release_interface(self.interface) {
            debug!(error = %err, "release interface failed");
        }
    }
}

/// Matches on vendor, product and serial. A unit whose serial cannot be
/// read is used only when it is the sole vendor/product match.
fn open(target: &QueryTarget) -> Result<(Device<GlobalContext>, DeviceHandle<GlobalContext>), QueryError> {
    let devices = rusb::devices().map_err(|err| usb_error("list usb devices", err))?;
    let mut candidates = Vec::new();
    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() != target.vendor_id || descriptor.product_id() != target.product_id {
            continue;
        }
        let handle = match device.open() {
            Ok(handle) => handle,
            Err(err) => {
                // Still counted, so a busy twin blocks the lone-unit fallback.
                debug!(error = %err, "open failed");
                candidates.push((None, None));
                continue;
            }
        };
        let serial = serial_of(&handle, &descriptor);
        candidates.push((Some((device, handle)), serial));
    }
    candidate::select(candidates, &target.serial)
        .flatten()
        .ok_or_else(|| QueryError::NotFound(target.describe()))
}

fn serial_of(handle: &DeviceHandle<GlobalContext>, descriptor: &DeviceDescriptor) -> Option<String> {
    handle
        .read_serial_number_string_ascii(descriptor)
        .ok()
        .map(|serial| serial.trim().to_string())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BulkOnlyPassThrough {
    tool: Diskutil,
}

impl BulkOnlyPassThrough {
    pub fn new() -> Self {
        Self { tool: Diskutil }
    }
}

impl PassThrough for BulkOnlyPassThrough {
    fn execute(
        &self,
        target: &QueryTarget,
        cdb: &Cdb,
        transfer_len: usize,
        timeout: Duration,
    ) -> Result<ScsiResponse, QueryError> {
        // Detaching the kernel driver needs root; fail before touching mounts.
        if unsafe { libc::geteuid() } != 0 {
            return Err(QueryError::PermissionDenied(format!(
                "{}: raw USB access requires root",
                target.describe()
            )));
        }
        let disk = match &target.locator {
            Some(Locator::BlockPath(path)) => path.file_name().map(|name| name.to_string_lossy().into_owned()),
            _ => None,
        };
        // Declared first so it drops last: remount after the interface is released.
        let _mount = disk.as_deref().map(|disk| MountGuard::unmount(&self.tool, disk));

        // libusb treats a zero timeout as no timeout at all.
        let timeout = timeout.max(MIN_TIMEOUT);
        let (device, handle) = open(target)?;
        let mut pipe = ClaimedPipe::claim(&device, handle)?;
        let tag = NEXT_TAG.fetch_add(2, Ordering::Relaxed);
        bot::transact(&mut pipe, tag, 0, cdb, transfer_len, timeout)
    }
}
