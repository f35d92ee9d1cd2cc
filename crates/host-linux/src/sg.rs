//! Generic SCSI (`SG_IO`) pass-through on a `/dev/sdX` node.

use libc::{c_int, c_uchar, c_uint, c_ushort, c_void};
use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use usbtool_core::scsi::{Cdb, ScsiResponse};
use usbtool_core::{Locator, PassThrough, QueryError, QueryTarget};

const SG_IO: c_uint = 0x2285;
const SG_INTERFACE_ID: c_int = b'S' as c_int;
const SG_DXFER_FROM_DEV: c_int = -3;
const SENSE_BUFFER_LEN: usize = 32;

/// A zero `timeout` in the header selects the kernel default instead.
const MIN_TIMEOUT_MS: c_uint = 1000;

const DID_TIME_OUT: c_ushort = 0x03;
/// Low bits of `driver_status`; the high `DRIVER_SENSE` bit only says sense is present.
const DRIVER_STATUS_MASK: c_ushort = 0x07;

#[repr(C)]
pub struct SgIoHdr {
    interface_id: c_int,
    dxfer_direction: c_int,
    cmd_len: c_uchar,
    mx_sb_len: c_uchar,
    iovec_count: c_ushort,
    dxfer_len: c_uint,
    dxferp: *mut c_void,
    cmdp: *mut c_uchar,
    sbp: *mut c_uchar,
    timeout: c_uint,
    flags: c_uint,
    pack_id: c_int,
    usr_ptr: *mut c_void,
    status: c_uchar,
    masked_status: c_uchar,
    msg_status: c_uchar,
    sb_len_wr: c_uchar,
    host_status: c_ushort,
    driver_status: c_ushort,
    resid: c_int,
    duration: c_uint,
    info: c_uint,
}

nix::ioctl_readwrite_bad!(sg_io, SG_IO, SgIoHdr);

#[derive(Debug, Default, Clone, Copy)]
pub struct SgIoPassThrough;

impl SgIoPassThrough {
    pub fn new() -> Self {
        SgIoPassThrough
    }

    fn open(path: &Path) -> Result<File, QueryError> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|err| QueryError::from_io(&path.display().to_string(), &err))
    }
}

fn timeout_ms(timeout: Duration) -> c_uint {
    timeout
        .as_millis()
        .clamp(u128::from(MIN_TIMEOUT_MS), u128::from(c_uint::MAX)) as c_uint
}

impl PassThrough for SgIoPassThrough {
    fn execute(
        &self,
        target: &QueryTarget,
        cdb: &Cdb,
        transfer_len: usize,
        timeout: Duration,
    ) -> Result<ScsiResponse, QueryError> {
        let path = match &target.locator {
            Some(Locator::BlockPath(path)) => path,
            _ => {
                return Err(QueryError::NotFound(format!(
                    "no block device for {}",
                    target.describe()
                )))
            }
        };
        // Closed when dropped, on every path out of this call.
        let file = Self::open(path)?;

        let mut command = cdb.as_bytes().to_vec();
        let mut data = vec![0u8; transfer_len];
        let mut sense = [0u8; SENSE_BUFFER_LEN];
        let mut hdr = SgIoHdr {
            interface_id: SG_INTERFACE_ID,
            dxfer_direction: SG_DXFER_FROM_DEV,
            cmd_len: command.len() as c_uchar,
            mx_sb_len: SENSE_BUFFER_LEN as c_uchar,
            iovec_count: 0,
            dxfer_len: transfer_len as c_uint,
            dxferp: data.as_mut_ptr() as *mut c_void,
            cmdp: command.as_mut_ptr(),
            sbp: sense.as_mut_ptr(),
            timeout: timeout_ms(timeout),
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };

        // SAFETY: every pointer in `hdr` refers to a buffer that outlives the call
        // and whose length matches the length field next to it.
        let result = unsafe { sg_io(file.as_raw_fd(), &mut hdr) };
        let context = path.display().to_string();
        match result {
            Ok(_) => {}
            Err(Errno::EPERM) | Err(Errno::EACCES) => {
                return Err(QueryError::PermissionDenied(context))
            }
            Err(Errno::ENODEV) | Err(Errno::ENXIO) => return Err(QueryError::NotFound(context)),
            Err(errno) => return Err(QueryError::Transport(format!("{}: SG_IO {}", context, errno))),
        }

        if hdr.host_status == DID_TIME_OUT {
            return Err(QueryError::Transport(format!("{}: timed out", context)));
        }
        if hdr.host_status != 0 || hdr.driver_status & DRIVER_STATUS_MASK != 0 {
            return Err(QueryError::Transport(format!(
                "{}: host status {:#x}, driver status {:#x}",
                context, hdr.host_status, hdr.driver_status
            )));
        }

        let transferred = transfer_len.saturating_sub(hdr.resid.max(0) as usize);
        data.truncate(transferred);
        let sense_len = (hdr.sb_len_wr as usize).min(SENSE_BUFFER_LEN);
        debug!(
            device = %context,
            status = hdr.status,
            transferred,
            duration_ms = hdr.duration,
            "SG_IO completed"
        );
        Ok(ScsiResponse {
            status: hdr.status,
            data,
            sense: sense[..sense_len].to_vec(),
        })
    }
}
