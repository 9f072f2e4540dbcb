//! End-to-end scenarios exercising format → create_dev → write/redo →
//! snapshot lifecycle together, the way a caller assembling a whole device
//! would.

use std::io::Write;
use std::os::fd::AsRawFd;

use tempfile::NamedTempFile;

use walb::control::{format_ldev, StartParams, WalbControl};
use walb::log_pack::{write_pack_to_wldev, IoRequest, LogPackHeader, PackBuilder};
use walb::log_record::RecordKind;
use walb::ring::offset_of;
use walb::sector_array::{pread_exact, pwrite_exact};
use walb::super_sector::SuperSector;

fn make_file(size: u64) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(&vec![0u8; size as usize]).unwrap();
    f.flush().unwrap();
    f
}

/// Scenario 1: format a log device, then read back the winning super sector
/// replica directly (independent of `create_dev`).
#[test]
fn format_then_read_super_sector() {
    let pbs = 4096u32;
    let log_file = make_file(pbs as u64 * 200);
    let log_path = log_file.path().to_str().unwrap();

    format_ldev(log_path, 512, pbs, 200 * 8, 64 * 8, 8, "e2e-dev").unwrap();

    let s = SuperSector::read_auto(log_file.as_raw_fd()).unwrap();
    assert_eq!(s.physical_bs, pbs);
    assert_eq!(s.logical_bs, 512);
    assert_eq!(s.name_str(), "e2e-dev");
    assert_eq!(s.oldest_lsid, 0);
    assert_eq!(s.written_lsid, 0);
}

/// Scenario 2: write a single pack directly to the log device, then assemble
/// the device and confirm redo carried its payload onto the data device.
#[test]
fn write_pack_then_create_dev_redoes_it() {
    let pbs = 4096u32;
    let log_file = make_file(pbs as u64 * 200);
    let data_file = make_file(pbs as u64 * 64);
    let log_path = log_file.path().to_str().unwrap();
    let data_path = data_file.path().to_str().unwrap();

    format_ldev(log_path, 512, pbs, 200 * 8, 64 * 8, 8, "e2e-dev").unwrap();

    let log_fd = log_file.as_raw_fd();
    let s = SuperSector::read_auto(log_fd).unwrap();
    let salt = s.log_checksum_salt;

    let builder = PackBuilder::new(pbs);
    let req = IoRequest {
        kind: RecordKind::Normal,
        offset: 4,
        io_size: 8,
        data: vec![0x5Au8; 4096],
    };
    let (header, payload) = builder.build(0, &[req], salt).unwrap();
    let off = offset_of(&s, 0);
    write_pack_to_wldev(log_fd, &header, &payload, pbs, salt, off).unwrap();
    let end = LogPackHeader::end_marker();
    let end_buf = end.serialize(pbs, salt).unwrap();
    let end_off = offset_of(&s, header.next_lsid());
    pwrite_exact(log_fd, &end_buf, end_off * pbs as u64).unwrap();

    let ctl = WalbControl::create_dev(log_path, data_path, StartParams::default()).unwrap();
    assert_eq!(ctl.get_written_lsid(), header.next_lsid());

    let mut readback = vec![0u8; 4096];
    pread_exact(data_file.as_raw_fd(), &mut readback, 4 * 512).unwrap();
    assert_eq!(readback, vec![0x5Au8; 4096]);
}

/// Scenario 3: three packs written back to back, the middle one's payload
/// corrupted on disk. `create_dev`'s redo must apply the first pack and stop
/// before the corrupted one, leaving a durable prefix.
#[test]
fn redo_truncates_at_corrupted_pack() {
    let pbs = 4096u32;
    let log_file = make_file(pbs as u64 * 200);
    let data_file = make_file(pbs as u64 * 64);
    let log_path = log_file.path().to_str().unwrap();
    let data_path = data_file.path().to_str().unwrap();

    format_ldev(log_path, 512, pbs, 200 * 8, 64 * 8, 8, "e2e-dev").unwrap();

    let log_fd = log_file.as_raw_fd();
    let s = SuperSector::read_auto(log_fd).unwrap();
    let salt = s.log_checksum_salt;
    let builder = PackBuilder::new(pbs);

    let mut lsid = 0u64;
    let req1 = IoRequest {
        kind: RecordKind::Normal,
        offset: 0,
        io_size: 8,
        data: vec![1u8; 4096],
    };
    let (h1, p1) = builder.build(lsid, &[req1], salt).unwrap();
    write_pack_to_wldev(log_fd, &h1, &p1, pbs, salt, offset_of(&s, lsid)).unwrap();
    lsid = h1.next_lsid();

    let req2 = IoRequest {
        kind: RecordKind::Normal,
        offset: 8,
        io_size: 8,
        data: vec![2u8; 4096],
    };
    let (h2, p2) = builder.build(lsid, &[req2], salt).unwrap();
    let off2 = offset_of(&s, lsid);
    write_pack_to_wldev(log_fd, &h2, &p2, pbs, salt, off2).unwrap();
    // Corrupt the payload sector of the second pack after writing it.
    let mut garbage = vec![0xFFu8; 4096];
    garbage[0] = 0x00;
    pwrite_exact(log_fd, &garbage, (off2 + 1) * pbs as u64).unwrap();
    let lsid_after_2 = h2.next_lsid();

    let req3 = IoRequest {
        kind: RecordKind::Normal,
        offset: 16,
        io_size: 8,
        data: vec![3u8; 4096],
    };
    let (h3, p3) = builder.build(lsid_after_2, &[req3], salt).unwrap();
    write_pack_to_wldev(log_fd, &h3, &p3, pbs, salt, offset_of(&s, lsid_after_2)).unwrap();

    let ctl = WalbControl::create_dev(log_path, data_path, StartParams::default()).unwrap();
    assert_eq!(ctl.get_written_lsid(), h1.next_lsid());

    let mut first_block = vec![0u8; 4096];
    pread_exact(data_file.as_raw_fd(), &mut first_block, 0).unwrap();
    assert_eq!(first_block, vec![1u8; 4096]);

    let mut second_block = vec![0u8; 4096];
    pread_exact(data_file.as_raw_fd(), &mut second_block, 8 * 512).unwrap();
    assert_eq!(second_block, vec![0u8; 4096], "corrupted pack must not be applied");
}

/// Scenario 4: a pack built from two unevenly sized requests, rounded up
/// with exactly one padding record, round-trips through the log device.
#[test]
fn padding_record_roundtrips_through_device() {
    let pbs = 4096u32;
    let log_file = make_file(pbs as u64 * 200);
    let data_file = make_file(pbs as u64 * 64);
    let log_path = log_file.path().to_str().unwrap();
    let data_path = data_file.path().to_str().unwrap();

    format_ldev(log_path, 512, pbs, 200 * 8, 64 * 8, 8, "e2e-dev").unwrap();

    let log_fd = log_file.as_raw_fd();
    let s = SuperSector::read_auto(log_fd).unwrap();
    let salt = s.log_checksum_salt;
    let builder = PackBuilder::new(pbs);

    let req = IoRequest {
        kind: RecordKind::Normal,
        offset: 0,
        io_size: 8,
        data: vec![9u8; 4096],
    };
    let (mut header, mut payload) = builder.build(0, &[req], salt).unwrap();
    builder.append_padding(&mut header, &mut payload, 1).unwrap();
    assert_eq!(header.n_padding, 1);
    assert_eq!(header.total_io_size, 2);

    write_pack_to_wldev(log_fd, &header, &payload, pbs, salt, offset_of(&s, 0)).unwrap();
    let end = LogPackHeader::end_marker();
    let end_buf = end.serialize(pbs, salt).unwrap();
    pwrite_exact(
        log_fd,
        &end_buf,
        offset_of(&s, header.next_lsid()) * pbs as u64,
    )
    .unwrap();

    let ctl = WalbControl::create_dev(log_path, data_path, StartParams::default()).unwrap();
    assert_eq!(ctl.get_written_lsid(), header.next_lsid());

    let mut readback = vec![0u8; 4096];
    pread_exact(data_file.as_raw_fd(), &mut readback, 0).unwrap();
    assert_eq!(readback, vec![9u8; 4096]);
}

/// Scenario 5: snapshot add/get/list/del through the assembled device.
#[test]
fn snapshot_lifecycle_through_control() {
    let pbs = 4096u32;
    let log_file = make_file(pbs as u64 * 200);
    let data_file = make_file(pbs as u64 * 64);
    let log_path = log_file.path().to_str().unwrap();
    let data_path = data_file.path().to_str().unwrap();

    format_ldev(log_path, 512, pbs, 200 * 8, 64 * 8, 8, "e2e-dev").unwrap();
    let ctl = WalbControl::create_dev(log_path, data_path, StartParams::default()).unwrap();

    ctl.snapshot_add("hourly-1", 10, 1000).unwrap();
    ctl.snapshot_add("hourly-2", 20, 2000).unwrap();
    ctl.snapshot_add("daily-1", 30, 3000).unwrap();

    assert_eq!(ctl.snapshot_get_by_name("hourly-2").unwrap().lsid, 20);
    assert_eq!(ctl.snapshot_n_records_range(0, 25), 2);

    let in_range = ctl.snapshot_list_range(0, 25).unwrap();
    assert_eq!(in_range.len(), 2);
    assert!(in_range.iter().all(|r| r.lsid < 25));

    let deleted = ctl.snapshot_del_range(0, 25).unwrap();
    assert_eq!(deleted, 2);
    assert!(ctl.snapshot_get_by_name("hourly-1").is_err());
    assert!(ctl.snapshot_get_by_name("daily-1").is_ok());
}

/// Scenario 6: a tiny metadata region (one record per sector, one sector
/// total) overflows on the second add.
#[test]
fn snapshot_metadata_overflow() {
    let pbs = 512u32;
    let log_file = make_file(pbs as u64 * 200);
    let data_file = make_file(pbs as u64 * 64);
    let log_path = log_file.path().to_str().unwrap();
    let data_path = data_file.path().to_str().unwrap();

    // n_snapshots=1 with pbs=512 still rounds up to one whole metadata
    // sector, but that sector's bitmap capacity (>1 record) means we need
    // to fill every slot to observe NoSpace; drive it via repeated adds
    // until exhaustion rather than asserting a specific count.
    format_ldev(log_path, 512, pbs, 200 * 8, 64 * 8, 1, "tiny-dev").unwrap();
    let ctl = WalbControl::create_dev(log_path, data_path, StartParams::default()).unwrap();

    let mut added = 0;
    loop {
        let name = format!("snap-{added}");
        match ctl.snapshot_add(&name, added as u64, added as u64) {
            Ok(_) => added += 1,
            Err(e) => {
                assert_eq!(e.kind(), "no-space");
                break;
            }
        }
        if added > 1000 {
            panic!("metadata region never reported NoSpace");
        }
    }
    assert!(added > 0);
}
