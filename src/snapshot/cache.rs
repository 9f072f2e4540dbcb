//! The per-sector cache state machine: `{FREE, ALLOC, CLEAN, DIRTY}`.
//!
//! `FREE` means nothing is cached for that sector index. `ALLOC` means a
//! slot has been reserved but not yet filled by a disk read. `CLEAN` holds
//! an in-memory copy matching what is on disk; `DIRTY` holds one that has
//! been modified and needs an explicit [`SectorCache::sync`] before it may
//! be evicted.

use std::os::fd::RawFd;
use std::sync::Mutex;

use crate::error::{WalbError, WalbResult};
use crate::sector_array::{pread_exact, pwrite_exact};
use crate::super_sector::SuperSector;

use super::sector::SnapshotSector;

enum SectorState {
    Free,
    Alloc,
    Clean(SnapshotSector),
    Dirty(SnapshotSector),
}

/// A lazily-populated cache of the snapshot metadata region's sectors.
///
/// Entries live behind a `Mutex` rather than requiring `&mut self`: the
/// engine's reader methods (`get_by_name`, `list_*`) only hold a shared
/// `RwLock` read guard over the cache, but still need to lazily (re)load a
/// sector the writer side has evicted since it was last touched.
pub struct SectorCache {
    pbs: u32,
    salt: u32,
    base_sector_offset: u64,
    entries: Mutex<Vec<SectorState>>,
}

impl SectorCache {
    /// Builds a cache for `metadata_size` sectors, all initially `FREE`.
    /// `base_sector_offset` is the physical sector offset of metadata
    /// sector 0 on the log device (immediately after `super0`).
    pub fn new(pbs: u32, salt: u32, base_sector_offset: u64, metadata_size: u32) -> Self {
        Self {
            pbs,
            salt,
            base_sector_offset,
            entries: Mutex::new((0..metadata_size).map(|_| SectorState::Free).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn byte_offset(&self, idx: u32) -> u64 {
        (self.base_sector_offset + idx as u64) * self.pbs as u64
    }

    fn ensure_loaded(&self, fd: RawFd, idx: u32) -> WalbResult<()> {
        {
            let entries = self.entries.lock().unwrap();
            if matches!(entries[idx as usize], SectorState::Clean(_) | SectorState::Dirty(_)) {
                return Ok(());
            }
        }
        self.entries.lock().unwrap()[idx as usize] = SectorState::Alloc;
        let mut buf = vec![0u8; self.pbs as usize];
        pread_exact(fd, &mut buf, self.byte_offset(idx))?;
        let sect = SnapshotSector::deserialize(&buf, self.pbs, self.salt)?;
        self.entries.lock().unwrap()[idx as usize] = SectorState::Clean(sect);
        Ok(())
    }

    /// Returns a copy of sector `idx`'s current contents, loading it on
    /// first touch (or after a prior eviction).
    pub fn get(&self, fd: RawFd, idx: u32) -> WalbResult<SnapshotSector> {
        self.ensure_loaded(fd, idx)?;
        let entries = self.entries.lock().unwrap();
        match &entries[idx as usize] {
            SectorState::Clean(s) | SectorState::Dirty(s) => Ok(s.clone()),
            _ => unreachable!("ensure_loaded guarantees Clean or Dirty"),
        }
    }

    /// Loads sector `idx` (on first touch or after a prior eviction), applies
    /// `f` to it, and marks it `DIRTY`.
    pub fn modify(&self, fd: RawFd, idx: u32, f: impl FnOnce(&mut SnapshotSector)) -> WalbResult<()> {
        self.ensure_loaded(fd, idx)?;
        let mut entries = self.entries.lock().unwrap();
        let entry = std::mem::replace(&mut entries[idx as usize], SectorState::Free);
        let mut sect = match entry {
            SectorState::Clean(s) | SectorState::Dirty(s) => s,
            _ => unreachable!("ensure_loaded guarantees Clean or Dirty"),
        };
        f(&mut sect);
        entries[idx as usize] = SectorState::Dirty(sect);
        Ok(())
    }

    /// Writes sector `idx` to disk if `DIRTY`, demoting it to `CLEAN`.
    pub fn sync(&self, fd: RawFd, idx: u32) -> WalbResult<()> {
        let buf = {
            let entries = self.entries.lock().unwrap();
            match &entries[idx as usize] {
                SectorState::Dirty(sect) => Some(sect.serialize(self.salt)?),
                _ => None,
            }
        };
        if let Some(buf) = buf {
            pwrite_exact(fd, &buf, self.byte_offset(idx))?;
            let mut entries = self.entries.lock().unwrap();
            let entry = std::mem::replace(&mut entries[idx as usize], SectorState::Free);
            if let SectorState::Dirty(s) = entry {
                entries[idx as usize] = SectorState::Clean(s);
            }
        }
        Ok(())
    }

    /// Syncs every dirty sector.
    pub fn sync_all(&self, fd: RawFd) -> WalbResult<()> {
        for idx in 0..self.len() as u32 {
            self.sync(fd, idx)?;
        }
        Ok(())
    }

    /// Drops the cached copy of a `CLEAN` sector, returning it to `FREE`.
    /// Refuses to evict a `DIRTY` sector: call `sync` first.
    pub fn evict(&self, idx: u32) -> WalbResult<()> {
        let mut entries = self.entries.lock().unwrap();
        match &entries[idx as usize] {
            SectorState::Dirty(_) => {
                Err(WalbError::InvariantViolation("cannot evict a dirty sector".into()))
            }
            SectorState::Clean(_) => {
                entries[idx as usize] = SectorState::Free;
                Ok(())
            }
            SectorState::Free | SectorState::Alloc => Ok(()),
        }
    }

    /// Evicts every cached sector, refusing if any is still `DIRTY`.
    pub fn evict_all(&self) -> WalbResult<()> {
        for idx in 0..self.len() as u32 {
            self.evict(idx)?;
        }
        Ok(())
    }

    pub fn is_dirty(&self, idx: u32) -> bool {
        matches!(self.entries.lock().unwrap()[idx as usize], SectorState::Dirty(_))
    }
}

/// Physical sector offset of metadata sector 0: immediately after `super0`.
pub fn metadata_base_offset(pbs: u32) -> u64 {
    SuperSector::super0_offset(pbs) + 1
}
