//! USB mass-storage bulk-only transport framing.
//!
//! Used where no block-level SCSI pass-through exists. A command is a
//! Command Block Wrapper on bulk OUT, an optional data-in phase and a
//! Command Status Wrapper on bulk IN.

use crate::error::QueryError;
use crate::scsi::{Cdb, ScsiResponse, SENSE_LENGTH};
use std::time::Duration;

pub const CBW_SIGNATURE: &[u8; 4] = b"USBC";
pub const CSW_SIGNATURE: &[u8; 4] = b"USBS";
pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

const DIRECTION_IN: u8 = 0x80;
const MAX_CDB_LEN: usize = 16;

/// SCSI CHECK CONDITION, reported for a failed CSW.
pub const CHECK_CONDITION: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CswStatus {
    Passed,
    Failed,
    PhaseError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    pub tag: u32,
    pub residue: u32,
    pub status: CswStatus,
}

pub fn encode_cbw(tag: u32, transfer_len: u32, lun: u8, cdb: &Cdb) -> Result<[u8; CBW_LEN], QueryError> {
    if cdb.is_empty() || cdb.len() > MAX_CDB_LEN {
        return Err(QueryError::Transport(format!(
            "CDB length {} does not fit a command block wrapper",
            cdb.len()
        )));
    }
    let mut cbw = [0u8; CBW_LEN];
    cbw[0..4].copy_from_slice(CBW_SIGNATURE);
    cbw[4..8].copy_from_slice(&tag.to_le_bytes());
    cbw[8..12].copy_from_slice(&transfer_len.to_le_bytes());
    cbw[12] = DIRECTION_IN;
    cbw[13] = lun & 0x0F;
    cbw[14] = cdb.len() as u8;
    cbw[15..15 + cdb.len()].copy_from_slice(cdb.as_bytes());
    Ok(cbw)
}

pub fn decode_csw(bytes: &[u8], expected_tag: u32) -> Result<CommandStatus, QueryError> {
    if bytes.len() < CSW_LEN {
        return Err(QueryError::Transport(format!(
            "short command status wrapper ({} bytes)",
            bytes.len()
        )));
    }
    if &bytes[0..4] != CSW_SIGNATURE {
        return Err(QueryError::Transport("bad command status signature".to_string()));
    }
    let tag = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if tag != expected_tag {
        return Err(QueryError::Transport(format!(
            "command status tag {:#x} does not match {:#x}",
            tag, expected_tag
        )));
    }
    let residue = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let status = match bytes[12] {
        0 => CswStatus::Passed,
        1 => CswStatus::Failed,
        2 => CswStatus::PhaseError,
        other => {
            return Err(QueryError::Transport(format!(
                "unknown command status {:#04x}",
                other
            )))
        }
    };
    Ok(CommandStatus {
        tag,
        residue,
        status,
    })
}

/// A claimed pair of bulk endpoints.
pub trait BulkPipe {
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<usize, QueryError>;
    fn bulk_in(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, QueryError>;
    /// Clears a halt condition on the bulk IN endpoint.
    fn clear_halt(&mut self) -> Result<(), QueryError>;
}

/// Runs one data-in command through a bulk-only transport.
///
/// A failed command is followed by REQUEST SENSE and surfaces as a
/// CHECK CONDITION response with the returned sense bytes.
pub fn transact<P: BulkPipe + ?Sized>(
    pipe: &mut P,
    tag: u32,
    lun: u8,
    cdb: &Cdb,
    transfer_len: usize,
    timeout: Duration,
) -> Result<ScsiResponse, QueryError> {
    let (status, data) = exchange(pipe, tag, lun, cdb, transfer_len, timeout)?;
    match status.status {
        CswStatus::Passed => Ok(ScsiResponse::good(data)),
        CswStatus::PhaseError => Err(QueryError::Transport("phase error".to_string())),
        CswStatus::Failed => {
            let sense_cdb = Cdb::request_sense(SENSE_LENGTH as u8);
            let sense = match exchange(pipe, tag.wrapping_add(1), lun, &sense_cdb, SENSE_LENGTH, timeout) {
                Ok((sense_status, sense)) if sense_status.status == CswStatus::Passed => sense,
                Ok(_) => Vec::new(),
                Err(err) => {
                    tracing::debug!(error = %err, "request sense failed");
                    Vec::new()
                }
            };
            Ok(ScsiResponse {
                status: CHECK_CONDITION,
                data,
                sense,
            })
        }
    }
}

fn exchange<P: BulkPipe + ?Sized>(
    pipe: &mut P,
    tag: u32,
    lun: u8,
    cdb: &Cdb,
    transfer_len: usize,
    timeout: Duration,
) -> Result<(CommandStatus, Vec<u8>), QueryError> {
    let cbw = encode_cbw(tag, transfer_len as u32, lun, cdb)?;
    let written = pipe.bulk_out(&cbw, timeout)?;
    if written != CBW_LEN {
        return Err(QueryError::Transport(format!(
            "command block wrapper truncated to {} bytes",
            written
        )));
    }

    let mut data = vec![0u8; transfer_len];
    let received = if transfer_len > 0 {
        match pipe.bulk_in(&mut data, timeout) {
            Ok(received) => received,
            Err(err) => {
                // A device fails a data-in command by stalling bulk IN.
                tracing::debug!(error = %err, "data phase failed, clearing halt");
                if pipe.clear_halt().is_err() {
                    return Err(err);
                }
                let status = read_csw(pipe, tag, timeout).map_err(|_| err)?;
                data.clear();
                return Ok((status, data));
            }
        }
    } else {
        0
    };

    // Some devices skip the data phase and answer with the CSW directly.
    if received == CSW_LEN && transfer_len != CSW_LEN && data.starts_with(CSW_SIGNATURE) {
        if let Ok(status) = decode_csw(&data[..CSW_LEN], tag) {
            data.clear();
            return Ok((status, data));
        }
    }

    let status = read_csw(pipe, tag, timeout)?;
    let transferred = transfer_len
        .saturating_sub(status.residue as usize)
        .min(received);
    data.truncate(transferred);
    Ok((status, data))
}

fn read_csw<P: BulkPipe + ?Sized>(pipe: &mut P, tag: u32, timeout: Duration) -> Result<CommandStatus, QueryError> {
    let mut csw = [0u8; CSW_LEN];
    let read = pipe.bulk_in(&mut csw, timeout)?;
    decode_csw(&csw[..read], tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays queued bulk-in packets and records bulk-out writes.
    #[derive(Default)]
    struct ScriptedPipe {
        incoming: VecDeque<Result<Vec<u8>, QueryError>>,
        written: Vec<Vec<u8>>,
        halts_cleared: usize,
    }

    impl ScriptedPipe {
        fn queue(&mut self, packet: Vec<u8>) {
            self.incoming.push_back(Ok(packet));
        }
    }

    impl BulkPipe for ScriptedPipe {
        fn bulk_out(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, QueryError> {
            self.written.push(data.to_vec());
            Ok(data.len())
        }

        fn bulk_in(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, QueryError> {
            let packet = self
                .incoming
                .pop_front()
                .unwrap_or_else(|| Err(QueryError::Transport("timeout".to_string())))?;
            let len = packet.len().min(buf.len());
            buf[..len].copy_from_slice(&packet[..len]);
            Ok(len)
        }

        fn clear_halt(&mut self) -> Result<(), QueryError> {
            self.halts_cleared += 1;
            Ok(())
        }
    }

    fn csw(tag: u32, residue: u32, status: u8) -> Vec<u8> {
        let mut bytes = CSW_SIGNATURE.to_vec();
        bytes.extend_from_slice(&tag.to_le_bytes());
        bytes.extend_from_slice(&residue.to_le_bytes());
        bytes.push(status);
        bytes
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn cbw_layout() {
        let cbw = encode_cbw(7, 1024, 0, &Cdb::read_buffer()).unwrap();
        assert_eq!(&cbw[0..4], b"USBC");
        assert_eq!(&cbw[4..8], &7u32.to_le_bytes());
        assert_eq!(&cbw[8..12], &1024u32.to_le_bytes());
        assert_eq!(cbw[12], 0x80);
        assert_eq!(cbw[14], 6);
        assert_eq!(&cbw[15..21], &[0x3C, 0x01, 0, 0, 0, 0]);
        assert!(cbw[21..].iter().all(|b| *b == 0));
    }

    #[test]
    fn residue_shortens_data() {
        let mut pipe = ScriptedPipe::default();
        pipe.queue(vec![0xAA; 16]);
        pipe.queue(csw(1, 1024 - 16, 0));
        let response = transact(&mut pipe, 1, 0, &Cdb::read_buffer(), 1024, TIMEOUT).unwrap();
        assert!(response.is_good());
        assert_eq!(response.data, vec![0xAA; 16]);
        assert_eq!(pipe.written.len(), 1);
    }

    #[test]
    fn failed_status_fetches_sense() {
        let mut pipe = ScriptedPipe::default();
        pipe.queue(Vec::new());
        pipe.queue(csw(5, 1024, 1));
        pipe.queue(vec![0x70, 0x00, 0x05, 0x00]);
        pipe.queue(csw(6, (SENSE_LENGTH - 4) as u32, 0));
        let response = transact(&mut pipe, 5, 0, &Cdb::read_buffer(), 1024, TIMEOUT).unwrap();
        assert_eq!(response.status, CHECK_CONDITION);
        assert_eq!(response.sense, vec![0x70, 0x00, 0x05, 0x00]);
        assert_eq!(pipe.written[1][15], 0x03);
        assert!(matches!(
            response.into_data(),
            Err(QueryError::DeviceReported { status: 0x02, .. })
        ));
    }

    #[test]
    fn stalled_data_phase_recovers_status_and_sense() {
        let mut pipe = ScriptedPipe::default();
        pipe.incoming
            .push_back(Err(QueryError::Transport("bulk in: Pipe error".to_string())));
        pipe.queue(csw(3, 1024, 1));
        pipe.queue(vec![0x70, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x0A]);
        pipe.queue(csw(4, (SENSE_LENGTH - 8) as u32, 0));
        let response = transact(&mut pipe, 3, 0, &Cdb::read_buffer(), 1024, TIMEOUT).unwrap();
        assert_eq!(pipe.halts_cleared, 1);
        assert_eq!(response.status, CHECK_CONDITION);
        assert!(response.data.is_empty());
        assert_eq!(response.sense[2], 0x05);
        assert!(matches!(
            response.into_data(),
            Err(QueryError::DeviceReported { status: 0x02, .. })
        ));
    }

    #[test]
    fn stall_without_status_keeps_original_error() {
        let mut pipe = ScriptedPipe::default();
        pipe.incoming
            .push_back(Err(QueryError::Transport("bulk in: Pipe error".to_string())));
        let err = transact(&mut pipe, 1, 0, &Cdb::read_buffer(), 1024, TIMEOUT).unwrap_err();
        assert_eq!(err, QueryError::Transport("bulk in: Pipe error".to_string()));
    }

    #[test]
    fn status_in_place_of_data_is_the_command_status() {
        let mut pipe = ScriptedPipe::default();
        pipe.queue(csw(9, 1024, 1));
        pipe.queue(vec![0x70, 0x00, 0x06]);
        pipe.queue(csw(10, (SENSE_LENGTH - 3) as u32, 0));
        let response = transact(&mut pipe, 9, 0, &Cdb::read_buffer(), 1024, TIMEOUT).unwrap();
        assert_eq!(pipe.halts_cleared, 0);
        assert_eq!(response.status, CHECK_CONDITION);
        assert!(response.data.is_empty());
        assert_eq!(response.sense, vec![0x70, 0x00, 0x06]);
    }

    #[test]
    fn data_resembling_a_status_with_foreign_tag_stays_data() {
        let mut pipe = ScriptedPipe::default();
        pipe.queue(csw(77, 0, 0));
        pipe.queue(csw(2, 1024 - CSW_LEN as u32, 0));
        let response = transact(&mut pipe, 2, 0, &Cdb::read_buffer(), 1024, TIMEOUT).unwrap();
        assert!(response.is_good());
        assert_eq!(response.data, csw(77, 0, 0));
    }

    #[test]
    fn tag_mismatch_is_transport_error() {
        let mut pipe = ScriptedPipe::default();
        pipe.queue(vec![0; 8]);
        pipe.queue(csw(99, 0, 0));
        let err = transact(&mut pipe, 1, 0, &Cdb::read_buffer(), 8, TIMEOUT).unwrap_err();
        assert!(matches!(err, QueryError::Transport(_)));
    }

    #[test]
    fn phase_error_is_transport_error() {
        let mut pipe = ScriptedPipe::default();
        pipe.queue(vec![0; 8]);
        pipe.queue(csw(1, 0, 2));
        let err = transact(&mut pipe, 1, 0, &Cdb::read_buffer(), 8, TIMEOUT).unwrap_err();
        assert_eq!(err, QueryError::Transport("phase error".to_string()));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = csw(1, 0, 0);
        bytes[3] = b'X';
        assert!(decode_csw(&bytes, 1).is_err());
        assert!(decode_csw(&bytes[..5], 1).is_err());
    }
}
