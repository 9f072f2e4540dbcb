//! The `walblog` archival file format (§6): a 4096-byte header followed by a
//! stream of log packs, used to export a range of the log device to a plain
//! file independent of the ring buffer's wraparound.

use std::mem::size_of;
use std::os::fd::RawFd;
use std::slice;

use crate::error::{WalbError, WalbResult};
use crate::log_pack::read_logpack_data_from_wldev;
use crate::sector_array::{pread_exact, pwrite_exact};

/// Sector type tag for a walblog header.
pub const SECTOR_TYPE_WALBLOG_HEADER: u16 = 0x0004;
/// Fixed on-disk size of the walblog header, regardless of `pbs`.
pub const WALBLOG_HEADER_SIZE: usize = 4096;
/// Current walblog format version.
pub const WALBLOG_VERSION: u16 = 1;

#[repr(C, packed)]
struct RawWalblogHeader {
    sector_type: u16,
    version: u16,
    header_size: u16,
    reserved: u16,
    checksum: u32,
    log_checksum_salt: u32,
    logical_bs: u32,
    physical_bs: u32,
    uuid: [u8; 16],
    begin_lsid: u64,
    end_lsid: u64,
}

const RAW_SIZE: usize = size_of::<RawWalblogHeader>();

/// The archival stream's header: identifies the lsid range it covers and
/// the block-size/salt parameters needed to validate the packs that follow.
#[derive(Clone, Debug)]
pub struct WalblogHeader {
    pub log_checksum_salt: u32,
    pub logical_bs: u32,
    pub physical_bs: u32,
    pub uuid: [u8; 16],
    pub begin_lsid: u64,
    pub end_lsid: u64,
}

impl WalblogHeader {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8; WALBLOG_HEADER_SIZE];
        let raw = RawWalblogHeader {
            sector_type: SECTOR_TYPE_WALBLOG_HEADER,
            version: WALBLOG_VERSION,
            header_size: WALBLOG_HEADER_SIZE as u16,
            reserved: 0,
            checksum: 0,
            log_checksum_salt: self.log_checksum_salt,
            logical_bs: self.logical_bs,
            physical_bs: self.physical_bs,
            uuid: self.uuid,
            begin_lsid: self.begin_lsid,
            end_lsid: self.end_lsid,
        };
        let raw_bytes =
            unsafe { slice::from_raw_parts(&raw as *const _ as *const u8, RAW_SIZE) };
        buf[..RAW_SIZE].copy_from_slice(raw_bytes);
        let c = crate::checksum::checksum(&buf, 0);
        buf[4..8].copy_from_slice(&c.to_le_bytes());
        buf
    }

    pub fn deserialize(buf: &[u8]) -> WalbResult<Self> {
        if buf.len() != WALBLOG_HEADER_SIZE {
            return Err(WalbError::Format("bad walblog header buffer size".into()));
        }
        if crate::checksum::checksum(buf, 0) != 0 {
            return Err(WalbError::Checksum("walblog header checksum".into()));
        }
        let raw = unsafe { &*(buf.as_ptr() as *const RawWalblogHeader) };
        if raw.sector_type != SECTOR_TYPE_WALBLOG_HEADER {
            return Err(WalbError::Format(format!(
                "bad sector_type {:#x}",
                raw.sector_type
            )));
        }
        if raw.header_size as usize != WALBLOG_HEADER_SIZE {
            return Err(WalbError::Format("unexpected header_size".into()));
        }
        if raw.begin_lsid != raw.end_lsid
            && !crate::super_sector::is_valid_lsid_range(raw.begin_lsid, raw.end_lsid)
        {
            return Err(WalbError::Range("invalid walblog lsid range".into()));
        }
        Ok(Self {
            log_checksum_salt: raw.log_checksum_salt,
            logical_bs: raw.logical_bs,
            physical_bs: raw.physical_bs,
            uuid: raw.uuid,
            begin_lsid: raw.begin_lsid,
            end_lsid: raw.end_lsid,
        })
    }
}

/// Archives `[begin_lsid, end_lsid)` from the log device into `out_fd`,
/// reading each pack via its ring-buffer offset and re-writing it
/// contiguously (no wraparound) into the archive stream.
pub fn export_range(
    log_fd: RawFd,
    out_fd: RawFd,
    super_sect: &crate::super_sector::SuperSector,
    begin_lsid: u64,
    end_lsid: u64,
) -> WalbResult<()> {
    let header = WalblogHeader {
        log_checksum_salt: super_sect.log_checksum_salt,
        logical_bs: super_sect.logical_bs,
        physical_bs: super_sect.physical_bs,
        uuid: super_sect.uuid,
        begin_lsid,
        end_lsid,
    };
    let header_buf = header.serialize();
    pwrite_exact(out_fd, &header_buf, 0)?;

    let pbs = super_sect.physical_bs;
    let salt = super_sect.log_checksum_salt;
    let mut lsid = begin_lsid;
    let mut out_off = WALBLOG_HEADER_SIZE as u64;
    while lsid < end_lsid {
        let sector_offset = crate::ring::offset_of(super_sect, lsid);
        let header = crate::log_pack::read_logpack_header_from_wldev(
            log_fd,
            super_sect,
            lsid,
            sector_offset,
            salt,
        )?;
        if header.is_end_marker() {
            break;
        }
        let header_bytes = header.serialize(pbs, salt)?;
        pwrite_exact(out_fd, &header_bytes, out_off)?;
        out_off += pbs as u64;
        if header.total_io_size > 0 {
            let (payload, n_valid) =
                read_logpack_data_from_wldev(log_fd, &header, pbs, salt, sector_offset)?;
            if n_valid < header.records.len() {
                return Err(WalbError::Checksum(format!(
                    "pack at lsid {lsid} failed payload validation during export"
                )));
            }
            pwrite_exact(out_fd, &payload, out_off)?;
            out_off += payload.len() as u64;
        }
        lsid = header.next_lsid();
    }
    Ok(())
}

/// Reads back the header of a walblog archive file.
pub fn read_header(fd: RawFd) -> WalbResult<WalblogHeader> {
    let mut buf = vec![0u8; WALBLOG_HEADER_SIZE];
    pread_exact(fd, &mut buf, 0)?;
    WalblogHeader::deserialize(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_4096() {
        let h = WalblogHeader {
            log_checksum_salt: 1,
            logical_bs: 512,
            physical_bs: 4096,
            uuid: [0u8; 16],
            begin_lsid: 0,
            end_lsid: 10,
        };
        assert_eq!(h.serialize().len(), WALBLOG_HEADER_SIZE);
    }

    #[test]
    fn header_roundtrip() {
        let h = WalblogHeader {
            log_checksum_salt: 0xabcd,
            logical_bs: 512,
            physical_bs: 4096,
            uuid: [9u8; 16],
            begin_lsid: 5,
            end_lsid: 50,
        };
        let buf = h.serialize();
        let back = WalblogHeader::deserialize(&buf).unwrap();
        assert_eq!(back.log_checksum_salt, 0xabcd);
        assert_eq!(back.begin_lsid, 5);
        assert_eq!(back.end_lsid, 50);
        assert_eq!(back.uuid, [9u8; 16]);
    }

    #[test]
    fn rejects_wrong_sector_type() {
        let mut buf = vec![0u8; WALBLOG_HEADER_SIZE];
        buf[0..2].copy_from_slice(&0x0001u16.to_le_bytes());
        let c = crate::checksum::checksum(&buf, 0);
        buf[4..8].copy_from_slice(&c.to_le_bytes());
        assert!(WalblogHeader::deserialize(&buf).is_err());
    }
}
