// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Memory-mapped record arena.
//!
//! Owns the lattice file descriptor, the advisory lock, and the mapping.
//! Record slot `i` lives at byte offset `HEADER_SIZE + i * NODE_SIZE`; the
//! header page occupies offset 0.
//!
//! # Growth
//!
//! Capacity doubles: truncate the file to the new size, map it again, and
//! publish the new base pointer through an `ArcSwap`. Readers load the
//! pointer once per operation and keep the old mapping alive through their
//! `Arc` until the copy completes; the old region is unmapped when the
//! last holder drops it. Growth therefore never invalidates a pointer a
//! reader is actively using.
//!
//! # Lifecycle
//!
//! 1. `Arena::open_or_create()` opens or creates the file and takes the
//!    advisory lock (exclusive for writers, shared for read-only opens)
//! 2. Mutators go through `node()` + the seqlock protocol
//! 3. `flush_slots()` / `flush_header()` msync modified ranges at checkpoint
//! 4. The mapping and the lock are released on drop

use arc_swap::ArcSwap;
use std::fs::{File, OpenOptions as FsOpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{HEADER_SIZE, NODE_SIZE};
use crate::node::RawNode;
use crate::{Error, Result};

const PAGE_SIZE: usize = 4096;

/// One mmap of the lattice file. Unmapped on drop.
pub struct MapRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is shared memory coordinated by per-record seqlock
// counters and the single-writer protocol; raw pointer access is guarded
// by those, not by &mut aliasing.
unsafe impl Send for MapRegion {}
unsafe impl Sync for MapRegion {}

impl MapRegion {
    fn map(file: &File, len: usize, writable: bool) -> Result<Self> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };

        // SAFETY:
        // - First argument null lets the kernel choose the address
        // - len covers exactly the file size the caller just validated or
        //   truncated to; mmap fails cleanly if it cannot satisfy it
        // - MAP_SHARED makes stores visible to msync/fsync persistence
        // - file.as_raw_fd() is a valid open descriptor owned by Arena
        // - mmap returns MAP_FAILED on error (checked below)
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Reference the record at `slot`.
    ///
    /// Panics in debug builds when the slot is out of range for this
    /// mapping; release callers always bound slots by the capacity the
    /// mapping was created for.
    #[inline]
    #[must_use]
    pub fn node(&self, slot: u64) -> &RawNode {
        let offset = HEADER_SIZE + slot as usize * NODE_SIZE;
        debug_assert!(offset + NODE_SIZE <= self.len);
        // SAFETY:
        // - offset is within the mapping (asserted above; callers bound
        //   slots by the capacity this mapping covers)
        // - the arena is created page-aligned and NODE_SIZE is a multiple
        //   of 64, so every slot satisfies RawNode's 64-byte alignment
        // - RawNode synchronizes its own interior via the seq atomic
        unsafe { &*(self.ptr.add(offset) as *const RawNode) }
    }

    fn msync(&self, offset: usize, len: usize) -> Result<()> {
        // Round to page boundaries; msync requires an aligned address.
        let start = offset & !(PAGE_SIZE - 1);
        let end = (offset + len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let end = end.min(self.len);

        // SAFETY:
        // - self.ptr..self.ptr+len is a live mapping owned by this region
        // - start/end are page-aligned and clamped within the mapping
        // - MS_SYNC blocks until the pages reach stable storage
        let ret = unsafe {
            libc::msync(
                self.ptr.add(start) as *mut libc::c_void,
                end - start,
                libc::MS_SYNC,
            )
        };
        if ret != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for MapRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and Drop runs once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// File-backed arena of fixed-size records.
pub struct Arena {
    file: File,
    map: ArcSwap<MapRegion>,
    capacity: AtomicU64,
    read_only: bool,
}

impl Arena {
    /// Open an existing lattice file or create a fresh one.
    ///
    /// Takes the advisory lock (exclusive, or shared for read-only opens);
    /// a second live handle on the same file fails with `AlreadyOpen`.
    /// Returns the arena and whether the file was created by this call.
    pub fn open_or_create(
        path: &Path,
        initial_capacity: u64,
        read_only: bool,
    ) -> Result<(Self, bool)> {
        if initial_capacity == 0 {
            return Err(Error::InvalidCapacity(0));
        }

        let file = FsOpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .map_err(Error::Io)?;

        lock_file(&file, read_only)?;

        let file_len = file.metadata().map_err(Error::Io)?.len();
        let created = file_len == 0;
        if created && read_only {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "cannot create a lattice read-only",
            )));
        }

        let (len, capacity) = if created {
            let len = arena_len(initial_capacity);
            file.set_len(len as u64).map_err(Error::Io)?;
            (len, initial_capacity)
        } else {
            if file_len < HEADER_SIZE as u64 {
                return Err(Error::CorruptHeader("file shorter than header".into()));
            }
            // Capacity is validated against the header by recovery once
            // the page is decoded; here the mapping just covers the file.
            let capacity = (file_len as usize - HEADER_SIZE) / NODE_SIZE;
            (file_len as usize, capacity as u64)
        };

        let region = MapRegion::map(&file, len, !read_only)?;

        Ok((
            Self {
                file,
                map: ArcSwap::from_pointee(region),
                capacity: AtomicU64::new(capacity),
                read_only,
            },
            created,
        ))
    }

    /// Current capacity in records.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Snapshot of the current mapping. Hold the `Arc` for the duration of
    /// any pointer use; growth retires old regions only after the last
    /// holder drops.
    #[inline]
    #[must_use]
    pub fn map(&self) -> Arc<MapRegion> {
        self.map.load_full()
    }

    /// Double (or more) the arena to `new_capacity` records.
    ///
    /// Serialized by the caller's writer mutex. Publishes the new base
    /// pointer; in-flight readers finish on the old mapping.
    pub fn grow(&self, new_capacity: u64) -> Result<()> {
        debug_assert!(!self.read_only);
        debug_assert!(new_capacity > self.capacity());

        let len = arena_len(new_capacity);
        self.file.set_len(len as u64).map_err(Error::Io)?;
        let region = MapRegion::map(&self.file, len, true)?;
        self.map.store(Arc::new(region));
        self.capacity.store(new_capacity, Ordering::Release);
        log::debug!("[ARENA] grew to {} records ({} bytes)", new_capacity, len);
        Ok(())
    }

    /// Copy the header page out of the mapping.
    #[must_use]
    pub fn read_header_page(&self) -> [u8; HEADER_SIZE] {
        let map = self.map.load();
        let mut page = [0u8; HEADER_SIZE];
        // SAFETY: the mapping is always at least HEADER_SIZE bytes
        // (enforced at open); the source may race a concurrent header
        // write only on the writer's own thread, which is serialized.
        unsafe {
            ptr::copy_nonoverlapping(map.as_ptr(), page.as_mut_ptr(), HEADER_SIZE);
        }
        page
    }

    /// Write the header page into the mapping and msync it.
    pub fn write_header_page(&self, page: &[u8; HEADER_SIZE]) -> Result<()> {
        debug_assert!(!self.read_only);
        let map = self.map.load();
        // SAFETY: destination is the first HEADER_SIZE bytes of a live
        // writable mapping; only the single writer calls this.
        unsafe {
            ptr::copy_nonoverlapping(page.as_ptr(), map.as_ptr(), HEADER_SIZE);
        }
        map.msync(0, HEADER_SIZE)
    }

    /// msync the pages covering slots `from..=to`.
    pub fn flush_slots(&self, from: u64, to: u64) -> Result<()> {
        debug_assert!(from <= to);
        let map = self.map.load();
        let offset = HEADER_SIZE + from as usize * NODE_SIZE;
        let len = (to - from + 1) as usize * NODE_SIZE;
        map.msync(offset, len)
    }

    /// fsync the lattice file (metadata included).
    pub fn sync_file(&self) -> Result<()> {
        self.file.sync_all().map_err(Error::Io)
    }
}

fn arena_len(capacity: u64) -> usize {
    HEADER_SIZE + capacity as usize * NODE_SIZE
}

fn lock_file(file: &File, shared: bool) -> Result<()> {
    let kind = if shared { libc::LOCK_SH } else { libc::LOCK_EX };
    let op = kind | libc::LOCK_NB;
    // SAFETY: file.as_raw_fd() is a valid descriptor for the lifetime of
    // this call; flock has no memory-safety concerns.
    let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Err(Error::AlreadyOpen);
        }
        return Err(Error::Io(err));
    }
    Ok(())
}
