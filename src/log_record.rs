//! A single log record: one fixed-size descriptor inside a pack header,
//! describing one write, a padding gap, or a discard.

use std::mem::size_of;
use std::slice;

use bitflags::bitflags;

use crate::error::{WalbError, WalbResult};

bitflags! {
    /// On-disk flag bitset. `Exist` is set on every record that occupies a
    /// slot in this format; `Padding` and `Discard` are mutually exclusive
    /// refinements of a normal record. Decoded into [`RecordKind`] plus a
    /// plain `exist` bool at the codec boundary — see Design Note on flag
    /// fields.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct RecordFlags: u32 {
        const EXIST   = 1 << 0;
        const PADDING = 1 << 1;
        const DISCARD = 1 << 2;
    }
}

/// The semantic kind of a record, reconstructed from [`RecordFlags`] at the
/// codec boundary rather than carried as a raw bitset through the rest of
/// the crate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordKind {
    /// An ordinary write: `io_size` logical blocks of payload follow.
    Normal,
    /// Alignment filler. Has payload bytes but no meaning.
    Padding,
    /// A discard/TRIM request. Has no payload.
    Discard,
}

/// Largest `io_size` a non-discard record may carry.
pub const MAX_NORMAL_IO_SIZE: u32 = u16::MAX as u32;

/// One log record.
#[derive(Clone, Copy, Debug)]
pub struct LogRecord {
    pub kind: RecordKind,
    /// Target offset into the data device, in logical blocks.
    pub offset: u64,
    /// I/O size in logical blocks (up to `u32::MAX` for discards, else
    /// `u16::MAX`).
    pub io_size: u32,
    /// Position of this record's payload within its pack, in physical
    /// blocks counted from the pack header. Always `>= 1`.
    pub lsid_local: u16,
    /// This record's absolute lsid. `lsid - lsid_local` is the pack's lsid.
    pub lsid: u64,
    /// Salted checksum of the record's payload bytes. Meaningless for
    /// padding and discard records.
    pub checksum: u32,
}

#[repr(C, packed)]
pub(crate) struct RawRecord {
    pub checksum: u32,
    pub flags: u32,
    pub offset: u64,
    pub io_size: u32,
    pub lsid_local: u16,
    pub reserved1: u16,
    pub lsid: u64,
}

pub(crate) const RAW_RECORD_SIZE: usize = size_of::<RawRecord>();

impl LogRecord {
    pub(crate) fn to_raw(&self) -> RawRecord {
        let flags = match self.kind {
            RecordKind::Normal => RecordFlags::EXIST,
            RecordKind::Padding => RecordFlags::EXIST | RecordFlags::PADDING,
            RecordKind::Discard => RecordFlags::EXIST | RecordFlags::DISCARD,
        };
        RawRecord {
            checksum: self.checksum,
            flags: flags.bits(),
            offset: self.offset,
            io_size: self.io_size,
            lsid_local: self.lsid_local,
            reserved1: 0,
            lsid: self.lsid,
        }
    }

    pub(crate) fn from_raw(raw: &RawRecord) -> WalbResult<Self> {
        let flags = RecordFlags::from_bits_truncate(raw.flags);
        if !flags.contains(RecordFlags::EXIST) {
            return Err(WalbError::Format("log record missing EXIST flag".into()));
        }
        let kind = if flags.contains(RecordFlags::PADDING) {
            RecordKind::Padding
        } else if flags.contains(RecordFlags::DISCARD) {
            RecordKind::Discard
        } else {
            RecordKind::Normal
        };
        let rec = Self {
            kind,
            offset: raw.offset,
            io_size: raw.io_size,
            lsid_local: raw.lsid_local,
            lsid: raw.lsid,
            checksum: raw.checksum,
        };
        rec.validate_fields()?;
        Ok(rec)
    }

    fn validate_fields(&self) -> WalbResult<()> {
        if self.lsid_local < 1 {
            return Err(WalbError::Format("lsid_local must be >= 1".into()));
        }
        match self.kind {
            RecordKind::Normal => {
                if self.io_size == 0 {
                    return Err(WalbError::Format("normal record with io_size 0".into()));
                }
                if self.io_size > MAX_NORMAL_IO_SIZE {
                    return Err(WalbError::Format("normal record io_size too large".into()));
                }
            }
            RecordKind::Padding => {
                // io_size may be 0 or more; padding has payload bytes but no
                // meaningful content.
                if self.io_size > MAX_NORMAL_IO_SIZE {
                    return Err(WalbError::Format("padding record io_size too large".into()));
                }
            }
            RecordKind::Discard => {
                // up to u32::MAX is fine.
            }
        }
        Ok(())
    }

    /// Whether this record's `lsid`/`lsid_local` is consistent with the pack
    /// it claims to belong to.
    pub fn belongs_to_pack(&self, logpack_lsid: u64) -> bool {
        self.lsid.wrapping_sub(self.lsid_local as u64) == logpack_lsid
    }

    pub(crate) fn write_raw(&self, buf: &mut [u8]) {
        assert!(buf.len() >= RAW_RECORD_SIZE);
        let raw = self.to_raw();
        let bytes =
            unsafe { slice::from_raw_parts(&raw as *const _ as *const u8, RAW_RECORD_SIZE) };
        buf[..RAW_RECORD_SIZE].copy_from_slice(bytes);
    }

    pub(crate) fn read_raw(buf: &[u8]) -> WalbResult<Self> {
        assert!(buf.len() >= RAW_RECORD_SIZE);
        let raw = unsafe { &*(buf.as_ptr() as *const RawRecord) };
        Self::from_raw(raw)
    }
}
