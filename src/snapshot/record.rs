//! A single snapshot record: `{id, name, lsid, timestamp}`.

use std::mem::size_of;
use std::slice;

use crate::error::{WalbError, WalbResult};
use crate::super_sector::INVALID_LSID;

/// Marks a record slot as unused. Never a real snapshot id.
pub const INVALID_SNAPSHOT_ID: u32 = u32::MAX;
/// Largest id a real snapshot may carry.
pub const MAX_SNAPSHOT_ID: u32 = u32::MAX - 1;
/// Maximum length of a snapshot name, including the terminating NUL.
pub const SNAPSHOT_NAME_MAX_LEN: usize = 64;

#[repr(C, packed)]
pub(crate) struct RawRecord {
    pub lsid: u64,
    pub timestamp: u64,
    pub snapshot_id: u32,
    pub name: [u8; SNAPSHOT_NAME_MAX_LEN],
}

pub(crate) const RAW_RECORD_SIZE: usize = size_of::<RawRecord>();

/// One named point-in-time marker in the log stream.
#[derive(Clone, Debug)]
pub struct SnapshotRecord {
    pub snapshot_id: u32,
    pub name: String,
    pub lsid: u64,
    pub timestamp: u64,
}

/// Whether `name` satisfies the format's naming rule: 1 to 63 bytes of
/// `[-_0-9a-zA-Z]`.
pub fn is_valid_snapshot_name(name: &str) -> bool {
    let len = name.len();
    if len == 0 || len >= SNAPSHOT_NAME_MAX_LEN {
        return false;
    }
    name.bytes()
        .all(|b| b == b'-' || b == b'_' || b.is_ascii_alphanumeric())
}

impl SnapshotRecord {
    pub fn new(snapshot_id: u32, name: &str, lsid: u64, timestamp: u64) -> WalbResult<Self> {
        if !is_valid_snapshot_name(name) {
            return Err(WalbError::Format(format!("invalid snapshot name {name:?}")));
        }
        Ok(Self {
            snapshot_id,
            name: name.to_string(),
            lsid,
            timestamp,
        })
    }

    fn is_valid(&self) -> bool {
        self.snapshot_id != INVALID_SNAPSHOT_ID
            && self.lsid != INVALID_LSID
            && is_valid_snapshot_name(&self.name)
    }

    pub(crate) fn to_raw(&self) -> WalbResult<RawRecord> {
        if !self.is_valid() {
            return Err(WalbError::Format("invalid snapshot record".into()));
        }
        let mut name = [0u8; SNAPSHOT_NAME_MAX_LEN];
        let bytes = self.name.as_bytes();
        name[..bytes.len()].copy_from_slice(bytes);
        Ok(RawRecord {
            lsid: self.lsid,
            timestamp: self.timestamp,
            snapshot_id: self.snapshot_id,
            name,
        })
    }

    pub(crate) fn from_raw(raw: &RawRecord) -> WalbResult<Self> {
        let end = raw.name.iter().position(|&b| b == 0).unwrap_or(raw.name.len());
        let name = std::str::from_utf8(&raw.name[..end])
            .map_err(|_| WalbError::Format("snapshot name is not valid utf-8".into()))?
            .to_string();
        let rec = Self {
            snapshot_id: raw.snapshot_id,
            name,
            lsid: raw.lsid,
            timestamp: raw.timestamp,
        };
        if !rec.is_valid() {
            return Err(WalbError::Format("invalid snapshot record".into()));
        }
        Ok(rec)
    }

    pub(crate) fn write_raw(&self, buf: &mut [u8]) -> WalbResult<()> {
        assert!(buf.len() >= RAW_RECORD_SIZE);
        let raw = self.to_raw()?;
        let bytes =
            unsafe { slice::from_raw_parts(&raw as *const _ as *const u8, RAW_RECORD_SIZE) };
        buf[..RAW_RECORD_SIZE].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn read_raw(buf: &[u8]) -> WalbResult<Self> {
        assert!(buf.len() >= RAW_RECORD_SIZE);
        let raw = unsafe { &*(buf.as_ptr() as *const RawRecord) };
        Self::from_raw(raw)
    }
}
