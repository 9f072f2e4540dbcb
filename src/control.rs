//! The control façade (§6): one `WalbControl` per assembled device,
//! collapsing what the original system exposes as ioctls into direct method
//! calls.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use log::{info, warn};
use uuid::Uuid;

use crate::block::{capacity_pb, is_valid_pbs};
use crate::error::{WalbError, WalbResult};
use crate::log_pack::{write_pack_to_wldev, IoRequest, LogPackHeader, PackBuilder};
use crate::log_record::RecordKind;
use crate::redo::{redo, RedoReport};
use crate::ring::{self, offset_of};
use crate::sector_array::pwrite_exact;
use crate::snapshot::{snapshot_data_initialize, SnapshotEngine};
use crate::super_sector::{SuperSector, DISK_NAME_LEN, WALB_LOG_VERSION};

/// Tunables passed to `create_dev`, mirroring spec §6's control-interface
/// row of the same name. Defaults follow the original system's convention
/// of megabyte- and millisecond-scale knobs.
#[derive(Clone, Copy, Debug)]
pub struct StartParams {
    pub max_logpack_kb: u32,
    pub max_pending_mb: u32,
    pub min_pending_mb: u32,
    pub queue_stop_timeout_ms: u32,
    pub log_flush_interval_mb: u32,
    pub log_flush_interval_ms: u32,
    pub n_pack_bulk: u32,
    pub n_io_bulk: u32,
}

impl Default for StartParams {
    fn default() -> Self {
        Self {
            max_logpack_kb: 256,
            max_pending_mb: 64,
            min_pending_mb: 8,
            queue_stop_timeout_ms: 1000,
            log_flush_interval_mb: 16,
            log_flush_interval_ms: 100,
            n_pack_bulk: 128,
            n_io_bulk: 1024,
        }
    }
}

/// Writes a fresh super sector, zeroes the snapshot region, and writes an
/// end-marker header at lsid 0. The log-device file must already exist and
/// be at least large enough to hold the requested layout.
pub fn format_ldev(
    log_path: &str,
    logical_bs: u32,
    physical_bs: u32,
    ldev_size_lb: u64,
    ddev_size_lb: u64,
    n_snapshots: u32,
    name: &str,
) -> WalbResult<()> {
    if !is_valid_pbs(physical_bs) || physical_bs < logical_bs || physical_bs % logical_bs != 0 {
        return Err(WalbError::Format("invalid block size combination".into()));
    }
    let log_file = OpenOptions::new().read(true).write(true).open(log_path)?;
    let fd = log_file.as_raw_fd();

    let per_sector = crate::snapshot::sector::max_n_records_in_sector(physical_bs) as u32;
    let metadata_size = n_snapshots.div_ceil(per_sector.max(1));

    let ring_buffer_offset = ring::ring_buffer_offset(physical_bs, metadata_size);
    let ldev_size_pb = capacity_pb(physical_bs, ldev_size_lb.min(u32::MAX as u64) as u32) as u64;
    if ldev_size_pb <= ring_buffer_offset {
        return Err(WalbError::Format("log device too small for layout".into()));
    }
    let ring_buffer_size = ldev_size_pb - ring_buffer_offset;

    let mut name_bytes = [0u8; DISK_NAME_LEN];
    let n = name.as_bytes();
    let len = n.len().min(DISK_NAME_LEN - 1);
    name_bytes[..len].copy_from_slice(&n[..len]);

    let super_sect = SuperSector {
        version: WALB_LOG_VERSION,
        logical_bs,
        physical_bs,
        metadata_size,
        log_checksum_salt: rand_salt(),
        uuid: *Uuid::new_v4().as_bytes(),
        name: name_bytes,
        ring_buffer_size,
        oldest_lsid: 0,
        written_lsid: 0,
        device_size: ddev_size_lb,
    };
    super_sect.write(fd)?;

    snapshot_data_initialize(fd, physical_bs, 0, metadata_size)?;

    let end_marker = LogPackHeader::end_marker();
    let buf = end_marker.serialize(physical_bs, super_sect.log_checksum_salt)?;
    let off = offset_of(&super_sect, 0) * physical_bs as u64;
    pwrite_exact(fd, &buf, off)?;

    info!(
        "formatted log device {log_path}: pbs={physical_bs} ring_buffer_size={ring_buffer_size}"
    );
    Ok(())
}

fn rand_salt() -> u32 {
    // Device-identifying, not security-sensitive: any non-deterministic
    // value works since it is stored, not derived, after format.
    let bytes = Uuid::new_v4();
    let b = bytes.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// One assembled device: the log and data file descriptors, the in-memory
/// super sector, and the snapshot engine.
pub struct WalbControl {
    log_file: File,
    data_file: File,
    super_sect: Mutex<SuperSector>,
    snapshot: SnapshotEngine,
    checkpoint_interval_ms: AtomicU32,
    frozen: AtomicBool,
}

impl WalbControl {
    /// Opens an already-formatted device, replaying its log onto the data
    /// device before returning.
    pub fn create_dev(log_path: &str, data_path: &str, _params: StartParams) -> WalbResult<Self> {
        let log_file = OpenOptions::new().read(true).write(true).open(log_path)?;
        let data_file = OpenOptions::new().read(true).write(true).open(data_path)?;
        let log_fd = log_file.as_raw_fd();
        let data_fd = data_file.as_raw_fd();

        let mut super_sect = SuperSector::read_auto(log_fd)?;
        let report = redo(log_fd, data_fd, &super_sect)?;
        super_sect.written_lsid = report.written_lsid;
        super_sect.write(log_fd)?;

        let snapshot = SnapshotEngine::open(
            log_fd,
            super_sect.physical_bs,
            0,
            super_sect.metadata_size,
        )?;

        info!(
            "device assembled: {} packs replayed, written_lsid={}",
            report.n_packs_applied, report.written_lsid
        );

        Ok(Self {
            log_file,
            data_file,
            super_sect: Mutex::new(super_sect),
            snapshot,
            checkpoint_interval_ms: AtomicU32::new(1000),
            frozen: AtomicBool::new(false),
        })
    }

    fn log_fd(&self) -> RawFd {
        self.log_file.as_raw_fd()
    }

    fn data_fd(&self) -> RawFd {
        self.data_file.as_raw_fd()
    }

    /// Flushes pending data and rewrites the super sector (a checkpoint).
    pub fn take_checkpoint(&self) -> WalbResult<()> {
        self.data_file.sync_all()?;
        self.snapshot.sync()?;
        let super_sect = self.super_sect.lock().unwrap();
        super_sect.write(self.log_fd())?;
        Ok(())
    }

    pub fn set_checkpoint_interval_ms(&self, ms: u32) {
        self.checkpoint_interval_ms.store(ms, Ordering::Relaxed);
    }

    pub fn get_checkpoint_interval_ms(&self) -> u32 {
        self.checkpoint_interval_ms.load(Ordering::Relaxed)
    }

    pub fn get_oldest_lsid(&self) -> u64 {
        self.super_sect.lock().unwrap().oldest_lsid
    }

    pub fn get_written_lsid(&self) -> u64 {
        self.super_sect.lock().unwrap().written_lsid
    }

    /// Equal to `written_lsid` in this implementation: there is no
    /// separate "permanent" checkpoint lsid beyond what redo has applied.
    pub fn get_permanent_lsid(&self) -> u64 {
        self.get_written_lsid()
    }

    /// Equal to `written_lsid`: every write this core acknowledges is
    /// already durable on the log device.
    pub fn get_completed_lsid(&self) -> u64 {
        self.get_written_lsid()
    }

    pub fn get_log_usage(&self) -> u64 {
        ring::usage(&self.super_sect.lock().unwrap())
    }

    pub fn get_log_capacity(&self) -> u64 {
        self.super_sect.lock().unwrap().ring_buffer_size
    }

    /// Advances `oldest_lsid`, the point before which log data may be
    /// reclaimed. Must not pass `written_lsid`.
    pub fn set_oldest_lsid(&self, lsid: u64) -> WalbResult<()> {
        let mut super_sect = self.super_sect.lock().unwrap();
        if lsid > super_sect.written_lsid {
            return Err(WalbError::Range(
                "oldest_lsid must not exceed written_lsid".into(),
            ));
        }
        super_sect.oldest_lsid = lsid;
        super_sect.write(self.log_fd())
    }

    /// Whether the log device can still accept a flush (i.e. is not frozen
    /// and has free ring-buffer capacity).
    pub fn is_flush_capable(&self) -> bool {
        !self.frozen.load(Ordering::Relaxed) && !self.is_log_overflow()
    }

    /// Whether the ring buffer has filled to capacity relative to
    /// `oldest_lsid` (`original_source`'s `IS_LOG_OVERFLOW`).
    pub fn is_log_overflow(&self) -> bool {
        let s = self.super_sect.lock().unwrap();
        ring::usage(&s) >= s.ring_buffer_size
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Relaxed)
    }

    /// Quiesces I/O (here: a cheap flag flip; there is no in-flight request
    /// queue to drain in this userspace reimplementation).
    pub fn freeze(&self, _timeout_sec: u32) -> WalbResult<()> {
        self.frozen.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub fn melt(&self) -> WalbResult<()> {
        self.frozen.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Grows the data device's recorded size. `new_size_lb = 0` autodetects
    /// from the file's current length. Shrinking is rejected.
    pub fn resize(&self, new_size_lb: u64) -> WalbResult<()> {
        let mut super_sect = self.super_sect.lock().unwrap();
        let new_size = if new_size_lb == 0 {
            let len = self.data_file.metadata()?.len();
            len / super_sect.logical_bs as u64
        } else {
            new_size_lb
        };
        if new_size < super_sect.device_size {
            return Err(WalbError::Range("resize does not support shrinking".into()));
        }
        super_sect.device_size = new_size;
        super_sect.write(self.log_fd())
    }

    /// Online re-initialization of the log device only: rewinds both lsid
    /// counters to zero and writes a fresh end-marker, leaving the data
    /// device and snapshot metadata untouched.
    pub fn reset_wal(&self) -> WalbResult<()> {
        let mut super_sect = self.super_sect.lock().unwrap();
        super_sect.oldest_lsid = 0;
        super_sect.written_lsid = 0;
        super_sect.write(self.log_fd())?;
        let end_marker = LogPackHeader::end_marker();
        let buf = end_marker.serialize(super_sect.physical_bs, super_sect.log_checksum_salt)?;
        let off = offset_of(&super_sect, 0) * super_sect.physical_bs as u64;
        pwrite_exact(self.log_fd(), &buf, off)?;
        warn!("log device reset: oldest_lsid=written_lsid=0");
        Ok(())
    }

    /// Packages `data` as a single normal-write log pack at the current
    /// `written_lsid`, writes it to the log device, applies it straight to
    /// the data device, then advances `written_lsid` past it and re-stamps
    /// the end-marker at the new tail. Returns the lsid the pack was written
    /// at. `offset_lb`/`data.len()` are in logical blocks/bytes.
    pub fn submit_write(&self, offset_lb: u64, data: &[u8]) -> WalbResult<u64> {
        if !self.is_flush_capable() {
            return Err(WalbError::InvariantViolation(
                "device is frozen or the log ring is full".into(),
            ));
        }
        let mut super_sect = self.super_sect.lock().unwrap();
        let logical_bs = super_sect.logical_bs;
        if logical_bs == 0 || data.len() % logical_bs as usize != 0 {
            return Err(WalbError::Format(
                "write length must be a multiple of logical_bs".into(),
            ));
        }
        let pbs = super_sect.physical_bs;
        let salt = super_sect.log_checksum_salt;
        let lsid = super_sect.written_lsid;

        let builder = PackBuilder::new(pbs);
        let req = IoRequest {
            kind: RecordKind::Normal,
            offset: offset_lb,
            io_size: (data.len() / logical_bs as usize) as u32,
            data: data.to_vec(),
        };
        let (header, payload) = builder.build(lsid, &[req], salt)?;
        let sector_offset = offset_of(&super_sect, lsid);
        write_pack_to_wldev(self.log_fd(), &header, &payload, pbs, salt, sector_offset)?;

        pwrite_exact(self.data_fd(), data, offset_lb * logical_bs as u64)?;

        let next_lsid = header.next_lsid();
        let end_marker = LogPackHeader::end_marker();
        let end_buf = end_marker.serialize(pbs, salt)?;
        let end_off = offset_of(&super_sect, next_lsid) * pbs as u64;
        pwrite_exact(self.log_fd(), &end_buf, end_off)?;

        super_sect.written_lsid = next_lsid;
        super_sect.write(self.log_fd())?;

        info!("submitted write at lsid={lsid}, written_lsid now {next_lsid}");
        Ok(lsid)
    }

    pub fn snapshot_add(&self, name: &str, lsid: u64, timestamp: u64) -> WalbResult<u32> {
        self.snapshot.add(name, lsid, timestamp)
    }

    pub fn snapshot_del_by_name(&self, name: &str) -> WalbResult<()> {
        self.snapshot.del_by_name(name)
    }

    pub fn snapshot_del_range(&self, lo: u64, hi: u64) -> WalbResult<usize> {
        self.snapshot.del_range(lo, hi)
    }

    pub fn snapshot_get_by_name(&self, name: &str) -> WalbResult<crate::snapshot::SnapshotRecord> {
        self.snapshot.get_by_name(name)
    }

    pub fn snapshot_list_from(
        &self,
        start_id: u32,
        n: usize,
    ) -> WalbResult<Vec<crate::snapshot::SnapshotRecord>> {
        self.snapshot.list_from(start_id, n)
    }

    pub fn snapshot_list_range(
        &self,
        lo: u64,
        hi: u64,
    ) -> WalbResult<Vec<crate::snapshot::SnapshotRecord>> {
        self.snapshot.list_range(lo, hi)
    }

    pub fn snapshot_n_records_range(&self, lo: u64, hi: u64) -> usize {
        self.snapshot.n_records_range(lo, hi)
    }

    /// Closes the device: syncs the snapshot engine, checkpoints the super
    /// sector, and flushes both file descriptors.
    pub fn delete_dev(self) -> WalbResult<()> {
        self.take_checkpoint()?;
        self.log_file.sync_all()?;
        self.data_file.sync_all()?;
        Ok(())
    }
}

/// Re-runs redo against an already-open device pair, useful for manual
/// recovery tooling outside of `create_dev`'s automatic pass.
pub fn redo_manual(log_fd: RawFd, data_fd: RawFd, super_sect: &SuperSector) -> WalbResult<RedoReport> {
    redo(log_fd, data_fd, super_sect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_file(size: u64) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; size as usize]).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn format_then_create_dev_replays_empty_log() {
        let pbs = 4096u32;
        let log_file = make_file(pbs as u64 * 200);
        let data_file = make_file(pbs as u64 * 64);
        let log_path = log_file.path().to_str().unwrap();
        let data_path = data_file.path().to_str().unwrap();

        format_ldev(log_path, 512, pbs, 200 * 8, 64 * 8, 4, "testdev").unwrap();
        let ctl = WalbControl::create_dev(log_path, data_path, StartParams::default()).unwrap();
        assert_eq!(ctl.get_written_lsid(), 0);
        assert_eq!(ctl.get_oldest_lsid(), 0);
        assert!(ctl.is_flush_capable());
        assert!(!ctl.is_frozen());
    }

    #[test]
    fn snapshot_roundtrip_through_control() {
        let pbs = 4096u32;
        let log_file = make_file(pbs as u64 * 200);
        let data_file = make_file(pbs as u64 * 64);
        let log_path = log_file.path().to_str().unwrap();
        let data_path = data_file.path().to_str().unwrap();

        format_ldev(log_path, 512, pbs, 200 * 8, 64 * 8, 4, "testdev").unwrap();
        let ctl = WalbControl::create_dev(log_path, data_path, StartParams::default()).unwrap();
        ctl.snapshot_add("nightly", 10, 123).unwrap();
        assert_eq!(ctl.snapshot_get_by_name("nightly").unwrap().lsid, 10);
    }

    #[test]
    fn submit_write_applies_to_data_device_and_advances_written_lsid() {
        let pbs = 4096u32;
        let log_file = make_file(pbs as u64 * 200);
        let data_file = make_file(pbs as u64 * 64);
        let log_path = log_file.path().to_str().unwrap();
        let data_path = data_file.path().to_str().unwrap();

        format_ldev(log_path, 512, pbs, 200 * 8, 64 * 8, 4, "testdev").unwrap();
        let ctl = WalbControl::create_dev(log_path, data_path, StartParams::default()).unwrap();
        assert_eq!(ctl.get_written_lsid(), 0);

        let lsid = ctl.submit_write(4, &[0x5Au8; 4096]).unwrap();
        assert_eq!(lsid, 0);
        assert!(ctl.get_written_lsid() > 0);

        let mut readback = vec![0u8; 4096];
        crate::sector_array::pread_exact(data_file.as_raw_fd(), &mut readback, 4 * 512).unwrap();
        assert_eq!(readback, vec![0x5Au8; 4096]);

        // A reopen's redo must not re-apply what submit_write already wrote.
        // total_io_size is counted in physical blocks: 4096 bytes is exactly
        // one pbs=4096 block, so the pack occupies lsid (header) + lsid+1
        // (payload), and the next write starts at lsid + 2.
        drop(ctl);
        let ctl2 = WalbControl::create_dev(log_path, data_path, StartParams::default()).unwrap();
        assert_eq!(ctl2.get_written_lsid(), lsid + 2);
    }

    #[test]
    fn freeze_melt_toggle_flush_capability() {
        let pbs = 4096u32;
        let log_file = make_file(pbs as u64 * 200);
        let data_file = make_file(pbs as u64 * 64);
        let log_path = log_file.path().to_str().unwrap();
        let data_path = data_file.path().to_str().unwrap();
        format_ldev(log_path, 512, pbs, 200 * 8, 64 * 8, 4, "testdev").unwrap();
        let ctl = WalbControl::create_dev(log_path, data_path, StartParams::default()).unwrap();
        ctl.freeze(5).unwrap();
        assert!(!ctl.is_flush_capable());
        ctl.melt().unwrap();
        assert!(ctl.is_flush_capable());
    }
}
