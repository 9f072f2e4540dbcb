//! Ring-buffer address map (C7): translates an lsid to its physical sector
//! offset within the log device's circular log region.

use crate::super_sector::SuperSector;

/// Returns the physical sector offset of the log region's first sector,
/// immediately following both super sector replicas.
pub fn ring_buffer_offset(pbs: u32, metadata_size: u32) -> u64 {
    SuperSector::super1_offset(pbs, metadata_size) + 1
}

/// Maps `lsid` to its physical sector offset within the log device.
pub fn offset_of(super_sect: &SuperSector, lsid: u64) -> u64 {
    let base = ring_buffer_offset(super_sect.physical_bs, super_sect.metadata_size);
    base + lsid % super_sect.ring_buffer_size
}

/// Number of lsids between `oldest_lsid` and `written_lsid`, i.e. how much
/// of the ring buffer currently holds live log data.
pub fn usage(super_sect: &SuperSector) -> u64 {
    super_sect.written_lsid - super_sect.oldest_lsid
}

/// Remaining free lsid capacity before the ring buffer would overflow the
/// oldest still-needed record.
pub fn free_capacity(super_sect: &SuperSector) -> u64 {
    super_sect.ring_buffer_size.saturating_sub(usage(super_sect))
}
