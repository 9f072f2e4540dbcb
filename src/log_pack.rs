//! Log-pack header codec (C6) and the pack writer/reader pipeline (C8).
//!
//! A pack is a header physical block followed by `total_io_size` payload
//! physical blocks. The header carries a contiguous array of
//! fixed-size [`LogRecord`]s; non-discard records consume payload blocks in
//! array order, with at most one padding record allowed per pack.

use std::mem::size_of;
use std::os::fd::RawFd;
use std::slice;

use log::{debug, warn};

use crate::block::capacity_pb;
use crate::error::{WalbError, WalbResult};
use crate::log_record::{LogRecord, RecordKind, MAX_NORMAL_IO_SIZE, RAW_RECORD_SIZE};
use crate::sector_array::{pread_exact, pwrite_exact};
use crate::super_sector::{INVALID_LSID, SuperSector};

/// Sector type tag for a log-pack header.
pub const SECTOR_TYPE_LOGPACK: u16 = 0x0003;

#[repr(C, packed)]
struct RawHeader {
    checksum: u32,
    sector_type: u16,
    total_io_size: u16,
    logpack_lsid: u64,
    n_records: u16,
    n_padding: u16,
    reserved1: u32,
}

const RAW_HEADER_SIZE: usize = size_of::<RawHeader>();

/// Maximum number of records a pack header can hold for physical block size
/// `pbs`.
pub fn max_n_log_record_in_sector(pbs: u32) -> usize {
    (pbs as usize - RAW_HEADER_SIZE) / RAW_RECORD_SIZE
}

/// Physical blocks of payload a record of `io_size` logical blocks occupies.
fn record_payload_blocks(pbs: u32, kind: RecordKind, io_size: u32) -> u32 {
    match kind {
        RecordKind::Discard => 0,
        RecordKind::Normal | RecordKind::Padding => capacity_pb(pbs, io_size),
    }
}

/// One I/O request to be packaged into a log pack.
#[derive(Clone, Debug)]
pub struct IoRequest {
    pub kind: RecordKind,
    pub offset: u64,
    /// Size in logical blocks.
    pub io_size: u32,
    /// Payload bytes; empty for discard requests. Length must equal
    /// `io_size * logical_bs` for non-discard requests.
    pub data: Vec<u8>,
}

/// A parsed, validated log-pack header plus its record array.
#[derive(Clone, Debug)]
pub struct LogPackHeader {
    pub logpack_lsid: u64,
    pub total_io_size: u32,
    pub n_padding: u16,
    pub records: Vec<LogRecord>,
}

impl LogPackHeader {
    /// Builds the end-marker header (`n_records = 0`, `logpack_lsid =
    /// INVALID_LSID`). Valid without a checksum; terminates readers.
    pub fn end_marker() -> Self {
        Self {
            logpack_lsid: INVALID_LSID,
            total_io_size: 0,
            n_padding: 0,
            records: Vec::new(),
        }
    }

    pub fn is_end_marker(&self) -> bool {
        self.records.is_empty() && self.logpack_lsid == INVALID_LSID
    }

    /// Builds a zero-flush-only header: no records, but a real lsid that is
    /// not consumed by this pack.
    pub fn zero_flush(logpack_lsid: u64) -> Self {
        Self {
            logpack_lsid,
            total_io_size: 0,
            n_padding: 0,
            records: Vec::new(),
        }
    }

    /// The lsid the *next* pack should use.
    pub fn next_lsid(&self) -> u64 {
        if self.total_io_size == 0 && self.records.is_empty() {
            self.logpack_lsid
        } else {
            self.logpack_lsid + 1 + self.total_io_size as u64
        }
    }

    fn validate(&self, pbs: u32) -> WalbResult<()> {
        if self.is_end_marker() {
            return Ok(());
        }
        if self.records.is_empty() {
            if self.total_io_size != 0 || self.n_padding != 0 {
                return Err(WalbError::Format(
                    "empty pack with nonzero total_io_size/n_padding".into(),
                ));
            }
        } else {
            if self.n_padding > 1 || self.n_padding as usize > self.records.len() {
                return Err(WalbError::Format("n_padding out of range".into()));
            }
            if self.records.len() > max_n_log_record_in_sector(pbs) {
                return Err(WalbError::Format("too many records for pbs".into()));
            }
            if self.total_io_size > u16::MAX as u32 {
                return Err(WalbError::Format(
                    "total_io_size exceeds the on-disk u16 field".into(),
                ));
            }
            let end = self
                .logpack_lsid
                .checked_add(1 + self.total_io_size as u64)
                .ok_or_else(|| WalbError::Format("pack lsid range wraps".into()))?;
            if end > crate::super_sector::MAX_LSID + 1 {
                return Err(WalbError::Format("pack lsid range exceeds MAX_LSID".into()));
            }
            let mut n_padding_seen = 0u16;
            for rec in &self.records {
                if !rec.belongs_to_pack(self.logpack_lsid) {
                    return Err(WalbError::Format("record lsid inconsistent with pack".into()));
                }
                if rec.kind == RecordKind::Padding {
                    n_padding_seen += 1;
                }
            }
            if n_padding_seen != self.n_padding {
                return Err(WalbError::Format("n_padding does not match records".into()));
            }
        }
        Ok(())
    }

    fn to_raw(&self) -> RawHeader {
        RawHeader {
            checksum: 0,
            sector_type: SECTOR_TYPE_LOGPACK,
            total_io_size: self.total_io_size as u16,
            logpack_lsid: self.logpack_lsid,
            n_records: self.records.len() as u16,
            n_padding: self.n_padding,
            reserved1: 0,
        }
    }

    /// Serializes the header (and only the header) into a `pbs`-byte
    /// buffer, with a self-consistent salted checksum when `n_records > 0`.
    pub fn serialize(&self, pbs: u32, salt: u32) -> WalbResult<Vec<u8>> {
        self.validate(pbs)?;
        let mut buf = vec![0u8; pbs as usize];
        let raw = self.to_raw();
        let raw_bytes = unsafe {
            slice::from_raw_parts(&raw as *const _ as *const u8, RAW_HEADER_SIZE)
        };
        buf[..RAW_HEADER_SIZE].copy_from_slice(raw_bytes);
        for (i, rec) in self.records.iter().enumerate() {
            let off = RAW_HEADER_SIZE + i * RAW_RECORD_SIZE;
            rec.write_raw(&mut buf[off..off + RAW_RECORD_SIZE]);
        }
        if !self.records.is_empty() {
            let c = crate::checksum::checksum(&buf, salt);
            buf[0..4].copy_from_slice(&c.to_le_bytes());
        }
        Ok(buf)
    }

    /// Parses and validates a `pbs`-byte buffer as a pack header.
    pub fn deserialize(buf: &[u8], pbs: u32, salt: u32) -> WalbResult<Self> {
        if buf.len() != pbs as usize || buf.len() < RAW_HEADER_SIZE {
            return Err(WalbError::Format("bad header buffer size".into()));
        }
        let raw = unsafe { &*(buf.as_ptr() as *const RawHeader) };
        if raw.sector_type != SECTOR_TYPE_LOGPACK {
            return Err(WalbError::Format(format!(
                "bad sector_type {:#x}",
                raw.sector_type
            )));
        }
        let n_records = raw.n_records;
        if n_records == 0 {
            if raw.logpack_lsid == INVALID_LSID {
                return Ok(Self::end_marker());
            }
            return Ok(Self::zero_flush(raw.logpack_lsid));
        }
        if crate::checksum::checksum(buf, salt) != 0 {
            return Err(WalbError::Checksum("log-pack header checksum".into()));
        }
        let mut records = Vec::with_capacity(n_records as usize);
        for i in 0..n_records as usize {
            let off = RAW_HEADER_SIZE + i * RAW_RECORD_SIZE;
            if off + RAW_RECORD_SIZE > buf.len() {
                return Err(WalbError::Format("record array overruns sector".into()));
            }
            records.push(LogRecord::read_raw(&buf[off..off + RAW_RECORD_SIZE])?);
        }
        let header = Self {
            logpack_lsid: raw.logpack_lsid,
            total_io_size: raw.total_io_size as u32,
            n_padding: raw.n_padding,
            records,
        };
        header.validate(pbs)?;
        Ok(header)
    }

    /// Rebuilds a header keeping only the first `n_valid` records,
    /// recomputing `total_io_size` and `n_padding` from their actual
    /// payload footprint. Used by the redo engine when trailing records
    /// fail payload checksum validation.
    pub fn shrink_to(&self, pbs: u32, n_valid: usize) -> Self {
        let records: Vec<LogRecord> = self.records[..n_valid].to_vec();
        let total_io_size = records
            .iter()
            .map(|r| record_payload_blocks(pbs, r.kind, r.io_size))
            .sum();
        let n_padding = records.iter().filter(|r| r.kind == RecordKind::Padding).count() as u16;
        Self {
            logpack_lsid: self.logpack_lsid,
            total_io_size,
            n_padding,
            records,
        }
    }
}

/// Builds log packs from a batch of [`IoRequest`]s the way the writer of
/// §4.6 does: one record per request, with at most one padding record
/// appended to round the pack up to a flush boundary.
pub struct PackBuilder {
    pbs: u32,
}

impl PackBuilder {
    pub fn new(pbs: u32) -> Self {
        Self { pbs }
    }

    /// Packages `requests` into a header plus the concatenated payload
    /// bytes (`total_io_size * pbs` bytes), assigning `logpack_lsid` and
    /// per-record `lsid`/`lsid_local`/`checksum`.
    pub fn build(
        &self,
        logpack_lsid: u64,
        requests: &[IoRequest],
        salt: u32,
    ) -> WalbResult<(LogPackHeader, Vec<u8>)> {
        let max_records = max_n_log_record_in_sector(self.pbs);
        if requests.len() > max_records {
            return Err(WalbError::Format("too many requests for one pack".into()));
        }
        let mut records = Vec::with_capacity(requests.len());
        let mut payload = Vec::new();
        let mut blocks_so_far: u32 = 0;

        for req in requests {
            match req.kind {
                RecordKind::Discard => {
                    let lsid_local = (blocks_so_far + 1) as u16;
                    records.push(LogRecord {
                        kind: RecordKind::Discard,
                        offset: req.offset,
                        io_size: req.io_size,
                        lsid_local,
                        lsid: logpack_lsid + lsid_local as u64,
                        checksum: 0,
                    });
                }
                RecordKind::Normal => {
                    if req.io_size == 0 || req.io_size > MAX_NORMAL_IO_SIZE {
                        return Err(WalbError::Format("invalid io_size for normal record".into()));
                    }
                    let blocks = capacity_pb(self.pbs, req.io_size);
                    let expected_bytes = blocks as usize * self.pbs as usize;
                    if req.data.len() > expected_bytes {
                        return Err(WalbError::Format("payload larger than capacity".into()));
                    }
                    let mut block_buf = vec![0u8; expected_bytes];
                    block_buf[..req.data.len()].copy_from_slice(&req.data);
                    let checksum = crate::checksum::checksum(&block_buf, salt);
                    let lsid_local = (blocks_so_far + 1) as u16;
                    records.push(LogRecord {
                        kind: RecordKind::Normal,
                        offset: req.offset,
                        io_size: req.io_size,
                        lsid_local,
                        lsid: logpack_lsid + lsid_local as u64,
                        checksum,
                    });
                    payload.extend_from_slice(&block_buf);
                    blocks_so_far += blocks;
                }
                RecordKind::Padding => {
                    return Err(WalbError::Format(
                        "padding records are appended separately, not requested".into(),
                    ));
                }
            }
        }

        let header = LogPackHeader {
            logpack_lsid,
            total_io_size: blocks_so_far,
            n_padding: 0,
            records,
        };
        header.validate(self.pbs)?;
        Ok((header, payload))
    }

    /// Appends a single padding record that consumes `n_blocks` physical
    /// blocks of (meaningless) payload, used to round a pack up to a flush
    /// or alignment boundary. At most one may be present per pack.
    pub fn append_padding(
        &self,
        header: &mut LogPackHeader,
        payload: &mut Vec<u8>,
        n_blocks: u32,
    ) -> WalbResult<()> {
        if header.n_padding >= 1 {
            return Err(WalbError::Format("pack already has a padding record".into()));
        }
        if header.records.len() >= max_n_log_record_in_sector(self.pbs) {
            return Err(WalbError::Format("no room for padding record".into()));
        }
        let lsid_local = (header.total_io_size + 1) as u16;
        header.records.push(LogRecord {
            kind: RecordKind::Padding,
            offset: 0,
            io_size: n_blocks * crate::block::n_lb_in_pb(self.pbs),
            lsid_local,
            lsid: header.logpack_lsid + lsid_local as u64,
            checksum: 0,
        });
        header.n_padding += 1;
        header.total_io_size += n_blocks;
        payload.extend(std::iter::repeat(0u8).take(n_blocks as usize * self.pbs as usize));
        header.validate(self.pbs)
    }
}

/// Writes a complete pack (header + payload) to the log device at the
/// sector offset `offset_of(logpack_lsid)` supplies.
pub fn write_pack_to_wldev(
    fd: RawFd,
    header: &LogPackHeader,
    payload: &[u8],
    pbs: u32,
    salt: u32,
    sector_offset: u64,
) -> WalbResult<()> {
    let header_buf = header.serialize(pbs, salt)?;
    let byte_off = sector_offset * pbs as u64;
    pwrite_exact(fd, &header_buf, byte_off)?;
    if !payload.is_empty() {
        pwrite_exact(fd, payload, byte_off + pbs as u64)?;
    }
    debug!(
        "wrote pack lsid={} records={} payload_blocks={}",
        header.logpack_lsid,
        header.records.len(),
        header.total_io_size
    );
    Ok(())
}

/// Reads one pack header sector at `offset_of(lsid)` and validates that it
/// claims to be exactly that lsid.
pub fn read_logpack_header_from_wldev(
    fd: RawFd,
    super_sect: &SuperSector,
    lsid: u64,
    sector_offset: u64,
    salt: u32,
) -> WalbResult<LogPackHeader> {
    let pbs = super_sect.physical_bs;
    let mut buf = vec![0u8; pbs as usize];
    pread_exact(fd, &mut buf, sector_offset * pbs as u64)?;
    let header = LogPackHeader::deserialize(&buf, pbs, salt)?;
    if !header.is_end_marker() && header.logpack_lsid != lsid {
        return Err(WalbError::Format(format!(
            "header lsid {} does not match requested {}",
            header.logpack_lsid, lsid
        )));
    }
    Ok(header)
}

/// Reads every record's payload from the log device, contiguous with the
/// header sector, and validates non-discard, non-padding checksums. Returns
/// the payload bytes and the count of leading records that validated
/// (equal to `header.records.len()` if all pass); the redo engine truncates
/// the pack to that count via [`LogPackHeader::shrink_to`].
pub fn read_logpack_data_from_wldev(
    fd: RawFd,
    header: &LogPackHeader,
    pbs: u32,
    salt: u32,
    sector_offset: u64,
) -> WalbResult<(Vec<u8>, usize)> {
    let total_blocks = header.total_io_size as usize;
    let mut out = vec![0u8; total_blocks * pbs as usize];
    if total_blocks > 0 {
        if let Err(e) = pread_exact(fd, &mut out, (sector_offset + 1) * pbs as u64) {
            warn!("short read of pack payload at lsid {}: {e}", header.logpack_lsid);
            return Ok((out, 0));
        }
    }
    let mut n_valid = header.records.len();
    for (i, rec) in header.records.iter().enumerate() {
        if rec.kind == RecordKind::Discard {
            continue;
        }
        let byte_start = (rec.lsid_local as usize - 1) * pbs as usize;
        let blocks = record_payload_blocks(pbs, rec.kind, rec.io_size);
        let byte_len = blocks as usize * pbs as usize;
        if byte_start + byte_len > out.len() {
            n_valid = i;
            break;
        }
        if rec.kind == RecordKind::Padding {
            continue;
        }
        let slice = &out[byte_start..byte_start + byte_len];
        if crate::checksum::checksum(slice, salt) != rec.checksum {
            n_valid = i;
            break;
        }
    }
    Ok((out, n_valid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_24_bytes() {
        assert_eq!(RAW_HEADER_SIZE, 24);
    }

    #[test]
    fn capacity_for_4k_pbs() {
        assert_eq!(max_n_log_record_in_sector(4096), (4096 - 24) / 32);
    }

    #[test]
    fn end_marker_roundtrip() {
        let h = LogPackHeader::end_marker();
        let buf = h.serialize(4096, 0xaaaa).unwrap();
        let back = LogPackHeader::deserialize(&buf, 4096, 0xaaaa).unwrap();
        assert!(back.is_end_marker());
    }

    #[test]
    fn zero_flush_preserves_lsid() {
        let h = LogPackHeader::zero_flush(42);
        assert_eq!(h.next_lsid(), 42);
    }

    #[test]
    fn build_single_record_pack() {
        let builder = PackBuilder::new(4096);
        let req = IoRequest {
            kind: RecordKind::Normal,
            offset: 16,
            io_size: 8,
            data: vec![0xABu8; 4096],
        };
        let (header, payload) = builder.build(10, &[req], 0x1111).unwrap();
        assert_eq!(header.records.len(), 1);
        assert_eq!(header.total_io_size, 1);
        assert_eq!(payload.len(), 4096);
        assert_eq!(header.next_lsid(), 10 + 1 + 1);
        let buf = header.serialize(4096, 0x1111).unwrap();
        let back = LogPackHeader::deserialize(&buf, 4096, 0x1111).unwrap();
        assert_eq!(back.records.len(), 1);
        assert_eq!(back.records[0].lsid_local, 1);
    }

    #[test]
    fn discard_record_has_no_payload() {
        let builder = PackBuilder::new(4096);
        let req = IoRequest {
            kind: RecordKind::Discard,
            offset: 0,
            io_size: 1000,
            data: Vec::new(),
        };
        let (header, payload) = builder.build(0, &[req], 0).unwrap();
        assert_eq!(header.total_io_size, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn padding_roundtrip_exactly_one() {
        let builder = PackBuilder::new(4096);
        let r1 = IoRequest {
            kind: RecordKind::Normal,
            offset: 0,
            io_size: 8,
            data: vec![1u8; 4096],
        };
        let r2 = IoRequest {
            kind: RecordKind::Normal,
            offset: 8,
            io_size: 8,
            data: vec![2u8; 4096],
        };
        let (mut header, mut payload) = builder.build(0, &[r1, r2], 7).unwrap();
        builder.append_padding(&mut header, &mut payload, 1).unwrap();
        assert_eq!(header.n_padding, 1);
        let padding_count = header
            .records
            .iter()
            .filter(|r| r.kind == RecordKind::Padding)
            .count();
        assert_eq!(padding_count, 1);
        let buf = header.serialize(4096, 7).unwrap();
        let back = LogPackHeader::deserialize(&buf, 4096, 7).unwrap();
        assert_eq!(back.n_padding, 1);
        assert_eq!(back.total_io_size, header.total_io_size);
    }

    #[test]
    fn shrink_to_drops_trailing_records_and_recomputes_size() {
        let builder = PackBuilder::new(4096);
        let r1 = IoRequest {
            kind: RecordKind::Normal,
            offset: 0,
            io_size: 8,
            data: vec![1u8; 4096],
        };
        let r2 = IoRequest {
            kind: RecordKind::Normal,
            offset: 8,
            io_size: 8,
            data: vec![2u8; 4096],
        };
        let (header, _payload) = builder.build(0, &[r1, r2], 3).unwrap();
        assert_eq!(header.total_io_size, 2);
        let shrunk = header.shrink_to(4096, 1);
        assert_eq!(shrunk.records.len(), 1);
        assert_eq!(shrunk.total_io_size, 1);
        assert_eq!(shrunk.n_padding, 0);
    }
}
