//! The redo engine (C9): replays a log device's packs onto the data device,
//! stopping at the first corrupted or invalid pack it finds.
//!
//! Restartable and idempotent: re-running redo from the super sector's
//! `written_lsid` after a partial apply simply re-applies the same
//! not-yet-acknowledged packs, which is harmless since they are
//! byte-identical. `oldest_lsid` marks the reclaim frontier, not the redo
//! start — everything between it and `written_lsid` is already known to be
//! on the data device.

use std::os::fd::RawFd;

use log::{info, warn};

use crate::error::WalbResult;
use crate::log_pack::{read_logpack_data_from_wldev, read_logpack_header_from_wldev, LogPackHeader};
use crate::log_record::RecordKind;
use crate::ring::offset_of;
use crate::sector_array::pwrite_exact;
use crate::super_sector::SuperSector;

/// Outcome of one redo pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RedoReport {
    /// Number of packs fully applied.
    pub n_packs_applied: u64,
    /// Number of individual write/discard records applied.
    pub n_records_applied: u64,
    /// The lsid redo stopped at (exclusive): the new `written_lsid`.
    pub written_lsid: u64,
    /// Whether redo stopped early due to a corrupted or truncated pack
    /// rather than reaching a clean end-of-log marker.
    pub truncated: bool,
}

/// Replays every pack from `super_sect.written_lsid` up to the first invalid
/// pack, applying each record's payload to `data_fd` at `record.offset *
/// logical_bs`. Returns a report describing how far it got; the caller is
/// expected to persist `report.written_lsid` back into the super sector.
pub fn redo(
    log_fd: RawFd,
    data_fd: RawFd,
    super_sect: &SuperSector,
) -> WalbResult<RedoReport> {
    let pbs = super_sect.physical_bs;
    let logical_bs = super_sect.logical_bs;
    let salt = super_sect.log_checksum_salt;
    let mut lsid = super_sect.written_lsid;
    let mut report = RedoReport {
        written_lsid: lsid,
        ..Default::default()
    };

    loop {
        let sector_offset = offset_of(super_sect, lsid);
        let header = match read_logpack_header_from_wldev(log_fd, super_sect, lsid, sector_offset, salt) {
            Ok(h) => h,
            Err(e) => {
                warn!("redo stopping at lsid {lsid}: header invalid: {e}");
                report.truncated = true;
                break;
            }
        };

        if header.is_end_marker() {
            info!("redo reached end-of-log marker at lsid {lsid}");
            break;
        }
        if header.records.is_empty() {
            // Zero-flush pack: advances nothing, but its lsid is real.
            lsid = header.next_lsid();
            report.n_packs_applied += 1;
            report.written_lsid = lsid;
            continue;
        }

        let (payload, n_valid) =
            read_logpack_data_from_wldev(log_fd, &header, pbs, salt, sector_offset)?;
        let effective = if n_valid < header.records.len() {
            warn!(
                "pack at lsid {lsid} has {n_valid}/{} valid records, truncating",
                header.records.len()
            );
            header.shrink_to(pbs, n_valid)
        } else {
            header.clone()
        };

        apply_pack(data_fd, &effective, &payload, pbs, logical_bs)?;
        report.n_records_applied += effective.records.len() as u64;
        report.n_packs_applied += 1;
        report.written_lsid = effective.next_lsid();

        if n_valid < header.records.len() {
            report.truncated = true;
            break;
        }
        lsid = effective.next_lsid();
    }

    Ok(report)
}

fn apply_pack(
    data_fd: RawFd,
    header: &LogPackHeader,
    payload: &[u8],
    pbs: u32,
    logical_bs: u32,
) -> WalbResult<()> {
    for rec in &header.records {
        match rec.kind {
            RecordKind::Discard => {
                // No-op: this implementation does not forward discards to
                // the data device.
            }
            RecordKind::Padding => {}
            RecordKind::Normal => {
                let byte_start = (rec.lsid_local as usize - 1) * pbs as usize;
                let n_bytes = rec.io_size as usize * logical_bs as usize;
                let slice = &payload[byte_start..byte_start + n_bytes];
                let dst_off = rec.offset * logical_bs as u64;
                pwrite_exact(data_fd, slice, dst_off)?;
            }
        }
    }
    Ok(())
}
