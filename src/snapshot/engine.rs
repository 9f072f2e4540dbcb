//! The snapshot record engine (C11): a paginated, indexed store of
//! [`SnapshotRecord`]s backed by the sector cache. One `RwLock` protects
//! all mutable state; readers (`get_by_name`, `list_*`) take a shared lock,
//! writers (`add`, `del_*`) an exclusive one.

use std::collections::{BTreeMap, HashMap};
use std::os::fd::RawFd;
use std::sync::RwLock;

use log::info;

use crate::error::{WalbError, WalbResult};

use super::cache::{metadata_base_offset, SectorCache};
use super::record::{is_valid_snapshot_name, SnapshotRecord, INVALID_SNAPSHOT_ID};
use super::sector::{max_n_records_in_sector, SnapshotSector, SECTOR_TYPE_SNAPSHOT};

/// Address of a record within the metadata region: sector index plus slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Addr {
    sector: u32,
    slot: u8,
}

struct Inner {
    cache: SectorCache,
    by_id: HashMap<u32, Addr>,
    by_name: HashMap<String, Addr>,
    by_lsid: BTreeMap<u64, Vec<Addr>>,
    next_id: u32,
}

/// The metadata engine for one walb device's snapshot records.
pub struct SnapshotEngine {
    fd: RawFd,
    pbs: u32,
    metadata_size: u32,
    inner: RwLock<Inner>,
}

/// Zero-initializes `metadata_size` sectors starting immediately after
/// `super0` (the format operation performed when a device is first
/// created).
pub fn snapshot_data_initialize(
    fd: RawFd,
    pbs: u32,
    salt: u32,
    metadata_size: u32,
) -> WalbResult<()> {
    let base = metadata_base_offset(pbs);
    let empty = SnapshotSector::new(pbs);
    let buf = empty.serialize(salt)?;
    for i in 0..metadata_size as u64 {
        crate::sector_array::pwrite_exact(fd, &buf, (base + i) * pbs as u64)?;
    }
    Ok(())
}

impl SnapshotEngine {
    /// Opens the engine against an already-formatted metadata region,
    /// loading every sector eagerly to build the id/name/lsid indices.
    pub fn open(fd: RawFd, pbs: u32, salt: u32, metadata_size: u32) -> WalbResult<Self> {
        let base = metadata_base_offset(pbs);
        let cache = SectorCache::new(pbs, salt, base, metadata_size);
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        let mut by_lsid: BTreeMap<u64, Vec<Addr>> = BTreeMap::new();
        let mut max_id = 0u32;

        for sector_idx in 0..metadata_size {
            let sect = cache.get(fd, sector_idx)?;
            for (slot, rec) in sect.iter_allocated() {
                let addr = Addr {
                    sector: sector_idx,
                    slot: slot as u8,
                };
                by_id.insert(rec.snapshot_id, addr);
                by_name.insert(rec.name.clone(), addr);
                by_lsid.entry(rec.lsid).or_default().push(addr);
                max_id = max_id.max(rec.snapshot_id);
            }
        }

        info!("snapshot engine opened: {} records indexed", by_id.len());
        Ok(Self {
            fd,
            pbs,
            metadata_size,
            inner: RwLock::new(Inner {
                cache,
                by_id,
                by_name,
                by_lsid,
                next_id: max_id.wrapping_add(1),
            }),
        })
    }

    fn max_n_records(&self) -> usize {
        max_n_records_in_sector(self.pbs)
    }

    /// Adds a new snapshot record, returning its freshly assigned id.
    pub fn add(&self, name: &str, lsid: u64, timestamp: u64) -> WalbResult<u32> {
        if !is_valid_snapshot_name(name) {
            return Err(WalbError::Format(format!("invalid snapshot name {name:?}")));
        }
        let mut inner = self.inner.write().unwrap();
        if inner.by_name.contains_key(name) {
            return Err(WalbError::NameInUse(name.to_string()));
        }

        let max_per_sector = self.max_n_records();
        let mut target = None;
        for sector_idx in 0..self.metadata_size {
            let sect = inner.cache.get(self.fd, sector_idx)?;
            if sect.n_allocated() < max_per_sector {
                if let Some(slot) = sect.first_free() {
                    target = Some((sector_idx, slot));
                    break;
                }
            }
        }
        let (sector_idx, slot) = target.ok_or(WalbError::NoSpace)?;

        let mut id = inner.next_id;
        while id == INVALID_SNAPSHOT_ID || inner.by_id.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);

        let rec = SnapshotRecord::new(id, name, lsid, timestamp)?;
        let addr = Addr {
            sector: sector_idx,
            slot: slot as u8,
        };
        inner.cache.modify(self.fd, sector_idx, move |sect| sect.set(slot, rec))?;
        inner.by_id.insert(id, addr);
        inner.by_name.insert(name.to_string(), addr);
        inner.by_lsid.entry(lsid).or_default().push(addr);
        Self::sync_and_evict_all(&mut inner, self.fd)?;
        Ok(id)
    }

    fn remove_addr(inner: &mut Inner, fd: RawFd, addr: Addr, id: u32, name: &str, lsid: u64) -> WalbResult<()> {
        let slot = addr.slot as usize;
        inner.cache.modify(fd, addr.sector, move |sect| sect.clear(slot))?;
        inner.by_id.remove(&id);
        inner.by_name.remove(name);
        if let Some(v) = inner.by_lsid.get_mut(&lsid) {
            v.retain(|&a| a != addr);
            if v.is_empty() {
                inner.by_lsid.remove(&lsid);
            }
        }
        Ok(())
    }

    /// Flushes every dirty sector and drops the cache's in-memory copies, as
    /// required after any mutating operation before it returns success.
    fn sync_and_evict_all(inner: &mut Inner, fd: RawFd) -> WalbResult<()> {
        inner.cache.sync_all(fd)?;
        inner.cache.evict_all()
    }

    /// Deletes the record named `name`. Errs with `NotFound` if absent.
    pub fn del_by_name(&self, name: &str) -> WalbResult<()> {
        let mut inner = self.inner.write().unwrap();
        let addr = *inner
            .by_name
            .get(name)
            .ok_or_else(|| WalbError::NotFound(name.to_string()))?;
        let (id, lsid) = {
            let sect = inner.cache.get(self.fd, addr.sector)?;
            let rec = sect.get(addr.slot as usize).expect("index out of sync with sector");
            (rec.snapshot_id, rec.lsid)
        };
        Self::remove_addr(&mut inner, self.fd, addr, id, name, lsid)?;
        Self::sync_and_evict_all(&mut inner, self.fd)
    }

    /// Deletes every record whose lsid falls in `[lo, hi)`, returning the
    /// count removed.
    pub fn del_range(&self, lo: u64, hi: u64) -> WalbResult<usize> {
        let mut inner = self.inner.write().unwrap();
        let lsids: Vec<u64> = inner.by_lsid.range(lo..hi).map(|(&l, _)| l).collect();
        let mut victims = Vec::new();
        for lsid in lsids {
            if let Some(addrs) = inner.by_lsid.get(&lsid) {
                victims.extend(addrs.iter().copied().map(|a| (a, lsid)));
            }
        }
        let mut n = 0;
        for (addr, lsid) in victims {
            let (id, name) = {
                let sect = inner.cache.get(self.fd, addr.sector)?;
                let rec = sect.get(addr.slot as usize).expect("index out of sync with sector");
                (rec.snapshot_id, rec.name.clone())
            };
            Self::remove_addr(&mut inner, self.fd, addr, id, &name, lsid)?;
            n += 1;
        }
        Self::sync_and_evict_all(&mut inner, self.fd)?;
        Ok(n)
    }

    /// Looks up the record named `name`.
    pub fn get_by_name(&self, name: &str) -> WalbResult<SnapshotRecord> {
        let inner = self.inner.read().unwrap();
        let addr = *inner
            .by_name
            .get(name)
            .ok_or_else(|| WalbError::NotFound(name.to_string()))?;
        let sect = inner.cache.get(self.fd, addr.sector)?;
        Ok(sect
            .get(addr.slot as usize)
            .expect("index out of sync with sector")
            .clone())
    }

    /// Lists up to `n` records with id `>= start_id`, ordered by id.
    pub fn list_from(&self, start_id: u32, n: usize) -> WalbResult<Vec<SnapshotRecord>> {
        let inner = self.inner.read().unwrap();
        let mut ids: Vec<u32> = inner
            .by_id
            .keys()
            .copied()
            .filter(|&id| id >= start_id)
            .collect();
        ids.sort_unstable();
        ids.truncate(n);
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let addr = inner.by_id[&id];
            let sect = inner.cache.get(self.fd, addr.sector)?;
            out.push(
                sect.get(addr.slot as usize)
                    .expect("index out of sync with sector")
                    .clone(),
            );
        }
        Ok(out)
    }

    /// Lists every record whose lsid falls in `[lo, hi)`, ordered by lsid.
    pub fn list_range(&self, lo: u64, hi: u64) -> WalbResult<Vec<SnapshotRecord>> {
        let inner = self.inner.read().unwrap();
        let addrs: Vec<Addr> = inner
            .by_lsid
            .range(lo..hi)
            .flat_map(|(_, v)| v.iter().copied())
            .collect();
        let mut out = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let sect = inner.cache.get(self.fd, addr.sector)?;
            out.push(
                sect.get(addr.slot as usize)
                    .expect("index out of sync with sector")
                    .clone(),
            );
        }
        Ok(out)
    }

    /// Count of records whose lsid falls in `[lo, hi)`.
    pub fn n_records_range(&self, lo: u64, hi: u64) -> usize {
        let inner = self.inner.read().unwrap();
        inner.by_lsid.range(lo..hi).map(|(_, v)| v.len()).sum()
    }

    /// Flushes every dirty metadata sector to the log device.
    pub fn sync(&self) -> WalbResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.cache.sync_all(self.fd)
    }

    /// Flushes and evicts every cached metadata sector. Every mutating
    /// method already does this before returning; exposed for a caller
    /// that wants to force it explicitly, e.g. before closing the device.
    pub fn finalize(&self) -> WalbResult<()> {
        let mut inner = self.inner.write().unwrap();
        Self::sync_and_evict_all(&mut inner, self.fd)
    }
}

const _SECTOR_TYPE_SNAPSHOT_IN_USE: u16 = SECTOR_TYPE_SNAPSHOT;

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use tempfile::tempfile;

    fn setup(metadata_size: u32) -> (std::fs::File, u32) {
        let file = tempfile().unwrap();
        let pbs = 512u32;
        let fd = file.as_raw_fd();
        let total = (metadata_base_offset(pbs) + metadata_size as u64) * pbs as u64;
        crate::sector_array::pwrite_exact(fd, &vec![0u8; total as usize], 0).unwrap();
        snapshot_data_initialize(fd, pbs, 0x42, metadata_size).unwrap();
        (file, pbs)
    }

    #[test]
    fn add_then_get_by_name() {
        let (file, pbs) = setup(2);
        let fd = file.as_raw_fd();
        let engine = SnapshotEngine::open(fd, pbs, 0x42, 2).unwrap();
        let id = engine.add("daily", 100, 111).unwrap();
        let rec = engine.get_by_name("daily").unwrap();
        assert_eq!(rec.snapshot_id, id);
        assert_eq!(rec.lsid, 100);
    }

    #[test]
    fn duplicate_name_rejected() {
        let (file, pbs) = setup(1);
        let fd = file.as_raw_fd();
        let engine = SnapshotEngine::open(fd, pbs, 0x42, 1).unwrap();
        engine.add("x", 1, 1).unwrap();
        assert!(engine.add("x", 2, 2).is_err());
    }

    #[test]
    fn del_by_name_then_not_found() {
        let (file, pbs) = setup(1);
        let fd = file.as_raw_fd();
        let engine = SnapshotEngine::open(fd, pbs, 0x42, 1).unwrap();
        engine.add("gone", 5, 5).unwrap();
        engine.del_by_name("gone").unwrap();
        assert!(engine.get_by_name("gone").is_err());
    }

    #[test]
    fn list_range_and_del_range() {
        let (file, pbs) = setup(1);
        let fd = file.as_raw_fd();
        let engine = SnapshotEngine::open(fd, pbs, 0x42, 1).unwrap();
        engine.add("a", 10, 1).unwrap();
        engine.add("b", 20, 2).unwrap();
        engine.add("c", 30, 3).unwrap();
        assert_eq!(engine.n_records_range(10, 25), 2);
        let removed = engine.del_range(10, 25).unwrap();
        assert_eq!(removed, 2);
        assert!(engine.get_by_name("a").is_err());
        assert!(engine.get_by_name("c").is_ok());
    }

    #[test]
    fn persists_across_reopen_after_sync() {
        let (file, pbs) = setup(1);
        let fd = file.as_raw_fd();
        {
            let engine = SnapshotEngine::open(fd, pbs, 0x42, 1).unwrap();
            engine.add("durable", 7, 7).unwrap();
            engine.sync().unwrap();
        }
        let engine2 = SnapshotEngine::open(fd, pbs, 0x42, 1).unwrap();
        assert!(engine2.get_by_name("durable").is_ok());
    }

    #[test]
    fn no_space_when_every_sector_full() {
        let (file, pbs) = setup(1);
        let fd = file.as_raw_fd();
        let engine = SnapshotEngine::open(fd, pbs, 0x42, 1).unwrap();
        let cap = max_n_records_in_sector(pbs);
        for i in 0..cap {
            engine.add(&format!("n{i}"), i as u64, 0).unwrap();
        }
        assert!(matches!(engine.add("overflow", 999, 0), Err(WalbError::NoSpace)));
    }
}
