//! An ordered sequence of same-sized sectors, with byte-granular copy and
//! positional file I/O.

use std::io;
use std::os::fd::RawFd;

use crate::block::n_lb_in_pb;
use crate::checksum;
use crate::sector::SectorBuf;

/// An ordered sequence of sector buffers, all the same physical block size.
#[derive(Clone, Debug)]
pub struct SectorArray {
    pbs: u32,
    sectors: Vec<SectorBuf>,
}

impl SectorArray {
    /// Creates an array of `n` zero-filled sectors of size `pbs`.
    pub fn new(pbs: u32, n: usize) -> Self {
        Self {
            pbs,
            sectors: (0..n).map(|_| SectorBuf::new(pbs)).collect(),
        }
    }

    pub fn pbs(&self) -> u32 {
        self.pbs
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    pub fn get(&self, i: usize) -> &SectorBuf {
        &self.sectors[i]
    }

    pub fn get_mut(&mut self, i: usize) -> &mut SectorBuf {
        &mut self.sectors[i]
    }

    /// Grows or shrinks the array to `n` sectors. Newly appended entries on
    /// grow are freshly zeroed; trailing entries are dropped on shrink.
    /// Existing entries are otherwise untouched.
    pub fn resize(&mut self, n: usize) {
        let pbs = self.pbs;
        self.sectors.resize_with(n, || SectorBuf::new(pbs));
    }

    fn total_bytes(&self) -> usize {
        self.sectors.len() * self.pbs as usize
    }

    /// Copies `len` bytes from `src` into this array starting at byte offset
    /// `byte_offset`, crossing sector boundaries as needed.
    pub fn copy_from(&mut self, byte_offset: usize, src: &[u8]) {
        let len = src.len();
        assert!(
            byte_offset + len <= self.total_bytes(),
            "copy_from out of bounds"
        );
        let pbs = self.pbs as usize;
        let mut remaining = src;
        let mut pos = byte_offset;
        while !remaining.is_empty() {
            let sector_idx = pos / pbs;
            let in_sector = pos % pbs;
            let chunk_len = remaining.len().min(pbs - in_sector);
            let (chunk, rest) = remaining.split_at(chunk_len);
            self.sectors[sector_idx].as_mut_slice()[in_sector..in_sector + chunk_len]
                .copy_from_slice(chunk);
            remaining = rest;
            pos += chunk_len;
        }
    }

    /// Copies `dst.len()` bytes out of this array starting at byte offset
    /// `byte_offset`, crossing sector boundaries as needed.
    pub fn copy_to(&self, byte_offset: usize, dst: &mut [u8]) {
        let len = dst.len();
        assert!(
            byte_offset + len <= self.total_bytes(),
            "copy_to out of bounds"
        );
        let pbs = self.pbs as usize;
        let mut pos = byte_offset;
        let mut written = 0;
        while written < len {
            let sector_idx = pos / pbs;
            let in_sector = pos % pbs;
            let chunk_len = (len - written).min(pbs - in_sector);
            dst[written..written + chunk_len].copy_from_slice(
                &self.sectors[sector_idx].as_slice()[in_sector..in_sector + chunk_len],
            );
            written += chunk_len;
            pos += chunk_len;
        }
    }

    /// Salted checksum over `len` bytes starting at `byte_offset`. Invariant
    /// under how the range happens to be split across sectors, provided
    /// `len` is a multiple of 4 and `byte_offset` is too (the format never
    /// asks for anything else).
    pub fn checksum(&self, byte_offset: usize, len: usize, salt: u32) -> u32 {
        let mut buf = vec![0u8; len];
        self.copy_to(byte_offset, &mut buf);
        checksum::checksum(&buf, salt)
    }

    /// Reads `self.len()` sectors from `fd` at sector offset `sector_off`
    /// (i.e. byte offset `sector_off * pbs`), looping until fully served.
    pub fn pread(&mut self, fd: RawFd, sector_off: u64) -> io::Result<()> {
        let pbs = self.pbs as usize;
        for (i, sector) in self.sectors.iter_mut().enumerate() {
            let byte_off = (sector_off + i as u64) * pbs as u64;
            pread_exact(fd, sector.as_mut_slice(), byte_off)?;
        }
        Ok(())
    }

    /// Writes all sectors to `fd` at sector offset `sector_off`.
    pub fn pwrite(&self, fd: RawFd, sector_off: u64) -> io::Result<()> {
        let pbs = self.pbs as usize;
        for (i, sector) in self.sectors.iter().enumerate() {
            let byte_off = (sector_off + i as u64) * pbs as u64;
            pwrite_exact(fd, sector.as_slice(), byte_off)?;
        }
        Ok(())
    }

    /// Reads sectors from `fd` at a logical-block offset (converted to
    /// sector units via `pbs`); `lb_off` must be sector-aligned.
    pub fn pread_lb(&mut self, fd: RawFd, lb_off: u64) -> io::Result<()> {
        let per_pb = n_lb_in_pb(self.pbs) as u64;
        debug_assert_eq!(lb_off % per_pb, 0, "unaligned logical-block offset");
        self.pread(fd, lb_off / per_pb)
    }

    /// Writes sectors to `fd` at a logical-block offset; `lb_off` must be
    /// sector-aligned.
    pub fn pwrite_lb(&self, fd: RawFd, lb_off: u64) -> io::Result<()> {
        let per_pb = n_lb_in_pb(self.pbs) as u64;
        debug_assert_eq!(lb_off % per_pb, 0, "unaligned logical-block offset");
        self.pwrite(fd, lb_off / per_pb)
    }
}

/// Reads exactly `buf.len()` bytes from `fd` at `offset`, looping over short
/// reads the way a `pread(2)` caller must.
pub fn pread_exact(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let ret = unsafe {
            libc::pread(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
                (offset + done as u64) as libc::off_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read from device",
            ));
        }
        done += ret as usize;
    }
    Ok(())
}

/// Writes exactly `buf.len()` bytes to `fd` at `offset`, looping over short
/// writes the way a `pwrite(2)` caller must.
pub fn pwrite_exact(fd: RawFd, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let ret = unsafe {
            libc::pwrite(
                fd,
                buf[done..].as_ptr() as *const libc::c_void,
                buf.len() - done,
                (offset + done as u64) as libc::off_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        done += ret as usize;
    }
    Ok(())
}
