//! SCSI command construction and the pass-through seam.
//!
//! Each host crate implements [`PassThrough`] once with whatever raw
//! mechanism the platform offers. Everything above that seam (the version
//! query, poke) is platform independent.

use crate::error::QueryError;
use crate::Locator;
use std::time::Duration;

pub const READ_BUFFER: u8 = 0x3C;
pub const READ_10: u8 = 0x28;
pub const REQUEST_SENSE: u8 = 0x03;

/// Fixed size of the version query response buffer.
pub const RESPONSE_LENGTH: usize = 1024;
pub const BLOCK_SIZE: usize = 512;
pub const SENSE_LENGTH: usize = 18;

/// Mode 1 is the vendor-specific READ BUFFER mode the firmware answers.
const READ_BUFFER_VENDOR_MODE: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cdb(Vec<u8>);

impl Cdb {
    /// Six bytes, opcode first, everything else zero apart from the mode.
    pub fn read_buffer() -> Self {
        Cdb(vec![READ_BUFFER, READ_BUFFER_VENDOR_MODE, 0, 0, 0, 0])
    }

    pub fn read10(lba: u32, blocks: u16) -> Self {
        let lba = lba.to_be_bytes();
        let blocks = blocks.to_be_bytes();
        Cdb(vec![
            READ_10, 0, lba[0], lba[1], lba[2], lba[3], 0, blocks[0], blocks[1], 0,
        ])
    }

    pub fn request_sense(allocation: u8) -> Self {
        Cdb(vec![REQUEST_SENSE, 0, 0, 0, allocation, 0])
    }

    pub fn opcode(&self) -> u8 {
        self.0[0]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Completion of one data-in command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiResponse {
    pub status: u8,
    /// Truncated to the length the transport reports as transferred.
    pub data: Vec<u8>,
    pub sense: Vec<u8>,
}

impl ScsiResponse {
    pub fn good(data: Vec<u8>) -> Self {
        Self {
            status: 0,
            data,
            sense: Vec::new(),
        }
    }

    pub fn is_good(&self) -> bool {
        self.status == 0
    }

    /// A non-zero status is an error carrying status and sense, never empty data.
    pub fn into_data(self) -> Result<Vec<u8>, QueryError> {
        if self.status == 0 {
            Ok(self.data)
        } else {
            Err(QueryError::DeviceReported {
                status: self.status,
                sense: self.sense,
            })
        }
    }
}

/// Everything a platform may need to reach one physical unit.
///
/// Block-level pass-through only looks at `locator`; bulk-only transport
/// finds the USB interface through the vendor/product/serial identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTarget {
    pub locator: Option<Locator>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: String,
}

impl QueryTarget {
    pub fn from_device(device: &crate::UnifiedDevice) -> Self {
        Self {
            locator: device.locator.clone(),
            vendor_id: u16::from_str_radix(&device.vendor_id, 16).unwrap_or(0),
            product_id: u16::from_str_radix(&device.product_id, 16).unwrap_or(0),
            serial: device.serial.clone(),
        }
    }

    pub fn describe(&self) -> String {
        match &self.locator {
            Some(Locator::PhysicalDrive(index)) => format!("\\\\.\\PhysicalDrive{}", index),
            Some(Locator::BlockPath(path)) => path.display().to_string(),
            None => format!("{:04x}:{:04x} {}", self.vendor_id, self.product_id, self.serial),
        }
    }
}

/// Raw data-in SCSI command transport for one platform.
///
/// Implementations open the device for this call only and release it on
/// every exit path. `timeout` bounds this single attempt.
pub trait PassThrough {
    fn execute(
        &self,
        target: &QueryTarget,
        cdb: &Cdb,
        transfer_len: usize,
        timeout: Duration,
    ) -> Result<ScsiResponse, QueryError>;
}

pub trait VersionQuery {
    fn query(&self, target: &QueryTarget, timeout: Duration) -> Result<Vec<u8>, QueryError>;
}

impl<T: PassThrough + ?Sized> VersionQuery for T {
    fn query(&self, target: &QueryTarget, timeout: Duration) -> Result<Vec<u8>, QueryError> {
        let response = self.execute(target, &Cdb::read_buffer(), RESPONSE_LENGTH, timeout)?;
        tracing::debug!(
            target = %target.describe(),
            status = response.status,
            len = response.data.len(),
            "read buffer completed"
        );
        response.into_data()
    }
}

/// Reads one block at LBA 0. Succeeds iff the device reports good status.
pub fn poke<P: PassThrough + ?Sized>(
    pass_through: &P,
    target: &QueryTarget,
    timeout: Duration,
) -> Result<(), QueryError> {
    pass_through
        .execute(target, &Cdb::read10(0, 1), BLOCK_SIZE, timeout)?
        .into_data()
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    struct Recorder {
        response: ScsiResponse,
        seen: RefCell<Vec<(Vec<u8>, usize)>>,
    }

    impl PassThrough for Recorder {
        fn execute(
            &self,
            _target: &QueryTarget,
            cdb: &Cdb,
            transfer_len: usize,
            _timeout: Duration,
        ) -> Result<ScsiResponse, QueryError> {
            self.seen.borrow_mut().push((cdb.as_bytes().to_vec(), transfer_len));
            Ok(self.response.clone())
        }
    }

    fn target() -> QueryTarget {
        QueryTarget {
            locator: Some(Locator::BlockPath(PathBuf::from("/dev/sdb"))),
            vendor_id: 0x0984,
            product_id: 0x1407,
            serial: "SER".to_string(),
        }
    }

    #[test]
    fn read_buffer_cdb_layout() {
        assert_eq!(Cdb::read_buffer().as_bytes(), &[0x3C, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn read10_encodes_lba_and_length_big_endian() {
        assert_eq!(
            Cdb::read10(0x01020304, 2).as_bytes(),
            &[0x28, 0, 1, 2, 3, 4, 0, 0, 2, 0]
        );
    }

    #[test]
    fn short_transfer_is_not_a_failure() {
        let recorder = Recorder {
            response: ScsiResponse::good(vec![1, 2, 3]),
            seen: RefCell::new(Vec::new()),
        };
        let data = recorder.query(&target(), Duration::from_secs(1)).unwrap();
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(recorder.seen.borrow()[0], (Cdb::read_buffer().as_bytes().to_vec(), 1024));
    }

    #[test]
    fn device_status_is_never_converted_to_data() {
        let recorder = Recorder {
            response: ScsiResponse {
                status: 0x02,
                data: vec![0xFF; 16],
                sense: vec![0x70, 0x00, 0x05],
            },
            seen: RefCell::new(Vec::new()),
        };
        let err = recorder.query(&target(), Duration::from_secs(1)).unwrap_err();
        assert_eq!(
            err,
            QueryError::DeviceReported {
                status: 0x02,
                sense: vec![0x70, 0x00, 0x05]
            }
        );
    }

    #[test]
    fn poke_reads_block_zero() {
        let recorder = Recorder {
            response: ScsiResponse::good(vec![0; 512]),
            seen: RefCell::new(Vec::new()),
        };
        assert!(poke(&recorder, &target(), Duration::from_secs(1)).is_ok());
        let seen = recorder.seen.borrow();
        assert_eq!(seen[0].0[0], READ_10);
        assert_eq!(seen[0].1, 512);
    }

    #[test]
    fn describes_targets() {
        let mut t = target();
        assert_eq!(t.describe(), "/dev/sdb");
        t.locator = Some(Locator::PhysicalDrive(3));
        assert_eq!(t.describe(), "\\\\.\\PhysicalDrive3");
    }
}
