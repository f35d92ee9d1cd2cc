//! `IOCTL_SCSI_PASS_THROUGH_DIRECT` on `\\.\PhysicalDriveN`.

use std::ffi::c_void;
use std::mem::{offset_of, size_of};
use std::time::Duration;
use tracing::debug;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, E_ACCESSDENIED, ERROR_FILE_NOT_FOUND, ERROR_SEM_TIMEOUT, GENERIC_READ,
    GENERIC_WRITE, HANDLE,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::Storage::IscsiDisc::{
    IOCTL_SCSI_PASS_THROUGH_DIRECT, SCSI_IOCTL_DATA_IN, SCSI_PASS_THROUGH_DIRECT,
};
use windows::Win32::System::IO::DeviceIoControl;

use usbtool_core::scsi::{Cdb, ScsiResponse};
use usbtool_core::{Locator, PassThrough, QueryError, QueryTarget};

const SENSE_BUFFER_LEN: usize = 32;

#[repr(C)]
struct SptdWithSense {
    sptd: SCSI_PASS_THROUGH_DIRECT,
    sense: [u8; SENSE_BUFFER_LEN],
}

fn wide(s: &str) -> Vec<u16> {
    use std::os::windows::prelude::*;
    std::ffi::OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn win_error(context: &str, err: windows::core::Error) -> QueryError {
    let code = err.code();
    if code == E_ACCESSDENIED {
        QueryError::PermissionDenied(context.to_string())
    } else if code == ERROR_FILE_NOT_FOUND.to_hresult() {
        QueryError::NotFound(context.to_string())
    } else if code == ERROR_SEM_TIMEOUT.to_hresult() {
        QueryError::Transport(format!("{}: timed out", context))
    } else {
        QueryError::Transport(format!("{}: {}", context, err))
    }
}

/// Handle closed on drop.
struct Drive {
    handle: HANDLE,
    path: String,
}

impl Drive {
    fn open(index: u32) -> Result<Self, QueryError> {
        let path = format!(r"\\.\PhysicalDrive{}", index);
        let w = wide(&path);
        let handle = unsafe {
            CreateFileW(
                PCWSTR(w.as_ptr()),
                (GENERIC_READ | GENERIC_WRITE).0,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL,
                HANDLE::default(),
            )
        }
        .map_err(|err| win_error(&path, err))?;
        Ok(Self { handle, path })
    }
}

impl Drop for Drive {
    fn drop(&mut self) {
        if let Err(err) = unsafe { CloseHandle(self.handle) } {
            debug!(drive = %self.path, error = %err, "CloseHandle failed");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SptdPassThrough;

impl SptdPassThrough {
    pub fn new() -> Self {
        SptdPassThrough
    }
}

impl PassThrough for SptdPassThrough {
    fn execute(
        &self,
        target: &QueryTarget,
        cdb: &Cdb,
        transfer_len: usize,
        timeout: Duration,
    ) -> Result<ScsiResponse, QueryError> {
        let index = match &target.locator {
            Some(Locator::PhysicalDrive(index)) => *index,
            _ => {
                return Err(QueryError::NotFound(format!(
                    "no physical drive for {}",
                    target.describe()
                )))
            }
        };
        let drive = Drive::open(index)?;

        let mut data = vec![0u8; transfer_len];
        let mut request = SptdWithSense {
            sptd: SCSI_PASS_THROUGH_DIRECT::default(),
            sense: [0; SENSE_BUFFER_LEN],
        };
        let sptd = &mut request.sptd;
        sptd.Length = size_of::<SCSI_PASS_THROUGH_DIRECT>() as u16;
        sptd.CdbLength = cdb.len() as u8;
        sptd.SenseInfoLength = SENSE_BUFFER_LEN as u8;
        sptd.DataIn = SCSI_IOCTL_DATA_IN as u8;
        sptd.DataTransferLength = transfer_len as u32;
        sptd.TimeOutValue = timeout.as_secs().clamp(1, u64::from(u32::MAX)) as u32;
        sptd.DataBuffer = data.as_mut_ptr() as *mut c_void;
        sptd.SenseInfoOffset = offset_of!(SptdWithSense, sense) as u32;
        let bytes = cdb.as_bytes();
        let cdb_len = bytes.len().min(sptd.Cdb.len());
        sptd.Cdb[..cdb_len].copy_from_slice(&bytes[..cdb_len]);

        let mut returned = 0u32;
        let in_out = &mut request as *mut SptdWithSense as *mut c_void;
        // SAFETY: `request` and `data` outlive the call and their sizes match
        // the lengths passed alongside them.
        unsafe {
            DeviceIoControl(
                drive.handle,
                IOCTL_SCSI_PASS_THROUGH_DIRECT,
                Some(in_out as *const c_void),
                size_of::<SptdWithSense>() as u32,
                Some(in_out),
                size_of::<SptdWithSense>() as u32,
                Some(&mut returned),
                None,
            )
        }
        .map_err(|err| win_error(&drive.path, err))?;

        let status = request.sptd.ScsiStatus;
        let transferred = (request.sptd.DataTransferLength as usize).min(transfer_len);
        data.truncate(transferred);
        let sense_len = if status == 0 {
            0
        } else {
            (request.sptd.SenseInfoLength as usize).min(SENSE_BUFFER_LEN)
        };
        debug!(drive = %drive.path, status, transferred, "SCSI pass-through completed");
        Ok(ScsiResponse {
            status,
            data,
            sense: request.sense[..sense_len].to_vec(),
        })
    }
}
