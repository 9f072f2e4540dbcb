//! The super sector: one logical object stored as two physical-sector
//! replicas (`super0`, `super1`) bracketing the snapshot metadata region.

use std::mem::size_of;
use std::os::fd::RawFd;
use std::slice;

use crate::block::is_valid_pbs;
use crate::error::{WalbError, WalbResult};
use crate::sector_array::{pread_exact, pwrite_exact};

/// Sector type tag for the super sector.
pub const SECTOR_TYPE_SUPER: u16 = 0x0001;
/// Current on-disk format version.
pub const WALB_LOG_VERSION: u16 = 2;
/// `4096`, the convention used to place `super0` past a reserved first page.
pub const PAGE_SIZE: u64 = 4096;
/// Maximum length (including the terminating `\0`) of a device name.
pub const DISK_NAME_LEN: usize = 64;

/// `u64::MAX`. Marks "no lsid" / end-of-log sentinels.
pub const INVALID_LSID: u64 = u64::MAX;
/// The largest lsid a record or pack may legally carry.
pub const MAX_LSID: u64 = u64::MAX - 1;

/// Returns whether `lo < hi ≤ MAX_LSID + 1`, i.e. `[lo, hi)` is a legal lsid
/// range.
pub fn is_valid_lsid_range(lo: u64, hi: u64) -> bool {
    lo < hi && hi <= MAX_LSID + 1
}

/// One logical super sector. Laid out identically to its on-disk
/// representation; `read`/`write` move it to/from a physical-block-sized
/// buffer.
#[derive(Clone, Debug)]
pub struct SuperSector {
    pub version: u16,
    pub logical_bs: u32,
    pub physical_bs: u32,
    pub metadata_size: u32,
    pub log_checksum_salt: u32,
    pub uuid: [u8; 16],
    pub name: [u8; DISK_NAME_LEN],
    pub ring_buffer_size: u64,
    pub oldest_lsid: u64,
    pub written_lsid: u64,
    pub device_size: u64,
}

/// Raw on-disk layout, packed and 8-byte aligned as the format requires.
/// Mirrored into/out of `SuperSector` at the codec boundary so the rest of
/// the crate never has to reason about byte order or padding.
#[repr(C, packed)]
struct RawSuper {
    sector_type: u16,
    version: u16,
    checksum: u32,
    logical_bs: u32,
    physical_bs: u32,
    metadata_size: u32,
    log_checksum_salt: u32,
    uuid: [u8; 16],
    name: [u8; DISK_NAME_LEN],
    ring_buffer_size: u64,
    oldest_lsid: u64,
    written_lsid: u64,
    device_size: u64,
}

impl SuperSector {
    /// Returns the physical sector offset of `super0` within the log device.
    pub fn super0_offset(pbs: u32) -> u64 {
        PAGE_SIZE / pbs as u64
    }

    /// Returns the physical sector offset of `super1`, given `metadata_size`
    /// (the snapshot region's size in physical blocks).
    pub fn super1_offset(pbs: u32, metadata_size: u32) -> u64 {
        Self::super0_offset(pbs) + 1 + metadata_size as u64
    }

    fn to_raw(&self, salt_zero_checksum: bool) -> RawSuper {
        let _ = salt_zero_checksum;
        RawSuper {
            sector_type: SECTOR_TYPE_SUPER,
            version: self.version,
            checksum: 0,
            logical_bs: self.logical_bs,
            physical_bs: self.physical_bs,
            metadata_size: self.metadata_size,
            log_checksum_salt: self.log_checksum_salt,
            uuid: self.uuid,
            name: self.name,
            ring_buffer_size: self.ring_buffer_size,
            oldest_lsid: self.oldest_lsid,
            written_lsid: self.written_lsid,
            device_size: self.device_size,
        }
    }

    /// Serializes `self` into a `pbs`-byte buffer with a self-consistent
    /// checksum (salt is always 0 for the super sector).
    pub fn serialize(&self, pbs: u32) -> Vec<u8> {
        assert!(pbs as usize >= size_of::<RawSuper>(), "pbs too small");
        let mut buf = vec![0u8; pbs as usize];
        let raw = self.to_raw(true);
        let raw_bytes =
            unsafe { slice::from_raw_parts(&raw as *const _ as *const u8, size_of::<RawSuper>()) };
        buf[..raw_bytes.len()].copy_from_slice(raw_bytes);
        let c = crate::checksum::checksum(&buf, 0);
        buf[4..8].copy_from_slice(&c.to_le_bytes());
        buf
    }

    /// Parses and validates a `pbs`-byte buffer as a super sector.
    pub fn deserialize(buf: &[u8], pbs: u32) -> WalbResult<Self> {
        if !is_valid_pbs(pbs) {
            return Err(WalbError::Format(format!("invalid pbs {pbs}")));
        }
        if buf.len() != pbs as usize {
            return Err(WalbError::Format("buffer size mismatch".into()));
        }
        if crate::checksum::checksum(buf, 0) != 0 {
            return Err(WalbError::Checksum("super sector checksum".into()));
        }
        if buf.len() < size_of::<RawSuper>() {
            return Err(WalbError::Format("buffer smaller than super sector".into()));
        }
        let raw = unsafe { &*(buf.as_ptr() as *const RawSuper) };
        if raw.sector_type != SECTOR_TYPE_SUPER {
            return Err(WalbError::Format(format!(
                "bad sector_type {:#x}",
                raw.sector_type
            )));
        }
        if raw.version != WALB_LOG_VERSION {
            return Err(WalbError::Format(format!("bad version {}", raw.version)));
        }
        if raw.physical_bs != pbs {
            return Err(WalbError::Format("physical_bs does not match device".into()));
        }
        if !is_valid_pbs(raw.physical_bs) || raw.physical_bs < raw.logical_bs
            || raw.physical_bs % raw.logical_bs != 0
        {
            return Err(WalbError::Format("inconsistent block sizes".into()));
        }
        if raw.oldest_lsid == INVALID_LSID || raw.written_lsid == INVALID_LSID {
            return Err(WalbError::Format("lsid fields must not be INVALID_LSID".into()));
        }
        if raw.oldest_lsid > raw.written_lsid {
            return Err(WalbError::Format("oldest_lsid > written_lsid".into()));
        }
        Ok(Self {
            version: raw.version,
            logical_bs: raw.logical_bs,
            physical_bs: raw.physical_bs,
            metadata_size: raw.metadata_size,
            log_checksum_salt: raw.log_checksum_salt,
            uuid: raw.uuid,
            name: raw.name,
            ring_buffer_size: raw.ring_buffer_size,
            oldest_lsid: raw.oldest_lsid,
            written_lsid: raw.written_lsid,
            device_size: raw.device_size,
        })
    }

    /// Returns the device name as a `&str`, trimmed at the first NUL.
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Probes `physical_bs`/`metadata_size` from the unchecksummed header
    /// fields at `super0`'s fixed byte offset (`page/pbs * pbs ==
    /// PAGE_SIZE` for any `pbs`, so this needs no prior knowledge of it),
    /// then performs a full validated [`Self::read`]. Used when opening a
    /// device whose block size is not already known.
    pub fn read_auto(fd: RawFd) -> WalbResult<Self> {
        let mut probe = vec![0u8; size_of::<RawSuper>()];
        pread_exact(fd, &mut probe, PAGE_SIZE)?;
        let raw = unsafe { &*(probe.as_ptr() as *const RawSuper) };
        let pbs = raw.physical_bs;
        let metadata_size = raw.metadata_size;
        if !is_valid_pbs(pbs) {
            return Err(WalbError::Format(format!("probed invalid pbs {pbs}")));
        }
        Self::read(fd, pbs, metadata_size)
    }

    /// Reads both super sector replicas from the log device and returns
    /// whichever is valid and has the larger `written_lsid`. Fails only if
    /// both replicas are invalid.
    pub fn read(fd: RawFd, pbs: u32, metadata_size: u32) -> WalbResult<Self> {
        let off0 = Self::super0_offset(pbs) * pbs as u64;
        let off1 = Self::super1_offset(pbs, metadata_size) * pbs as u64;
        let s0 = Self::read_one(fd, pbs, off0);
        let s1 = Self::read_one(fd, pbs, off1);
        match (s0, s1) {
            (Ok(a), Ok(b)) => {
                if b.written_lsid > a.written_lsid {
                    Ok(b)
                } else {
                    Ok(a)
                }
            }
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(e), Err(_)) => Err(e),
        }
    }

    fn read_one(fd: RawFd, pbs: u32, byte_off: u64) -> WalbResult<Self> {
        let mut buf = vec![0u8; pbs as usize];
        pread_exact(fd, &mut buf, byte_off)?;
        Self::deserialize(&buf, pbs)
    }

    /// Writes both replicas, blocking until each completes.
    pub fn write(&self, fd: RawFd) -> WalbResult<()> {
        let pbs = self.physical_bs;
        let buf = self.serialize(pbs);
        let off0 = Self::super0_offset(pbs) * pbs as u64;
        let off1 = Self::super1_offset(pbs, self.metadata_size) * pbs as u64;
        pwrite_exact(fd, &buf, off0)?;
        pwrite_exact(fd, &buf, off1)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SuperSector {
        SuperSector {
            version: WALB_LOG_VERSION,
            logical_bs: 512,
            physical_bs: 4096,
            metadata_size: 3,
            log_checksum_salt: 0xdead_beef,
            uuid: [7u8; 16],
            name: {
                let mut n = [0u8; DISK_NAME_LEN];
                n[..2].copy_from_slice(b"s1");
                n
            },
            ring_buffer_size: 1000,
            oldest_lsid: 0,
            written_lsid: 0,
            device_size: 65536,
        }
    }

    #[test]
    fn roundtrip_serialize_deserialize() {
        let s = sample();
        let buf = s.serialize(4096);
        assert_eq!(crate::checksum::checksum(&buf, 0), 0);
        let back = SuperSector::deserialize(&buf, 4096).unwrap();
        assert_eq!(back.logical_bs, s.logical_bs);
        assert_eq!(back.physical_bs, s.physical_bs);
        assert_eq!(back.uuid, s.uuid);
        assert_eq!(back.name_str(), "s1");
        assert_eq!(back.ring_buffer_size, s.ring_buffer_size);
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let s = sample();
        let mut buf = s.serialize(4096);
        buf[100] ^= 0xff;
        assert!(SuperSector::deserialize(&buf, 4096).is_err());
    }

    #[test]
    fn offsets_match_layout() {
        assert_eq!(SuperSector::super0_offset(4096), 1);
        assert_eq!(SuperSector::super1_offset(4096, 3), 1 + 1 + 3);
    }

    #[test]
    fn lsid_range_validity() {
        assert!(is_valid_lsid_range(0, 1));
        assert!(is_valid_lsid_range(0, MAX_LSID + 1));
        assert!(!is_valid_lsid_range(5, 5));
        assert!(!is_valid_lsid_range(5, 4));
    }
}
