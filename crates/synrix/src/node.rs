// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-size lattice record ("node") with cache-line alignment.
//!
//! Every node is exactly 1216 bytes (19 cache lines) so that slot `i` lives
//! at byte offset `HEADER_SIZE + i * NODE_SIZE` and lookups are pure
//! arithmetic. The first 8 bytes are the seqlock counter; the remaining
//! 1208 bytes are the body, mutated in place under the seqlock protocol.
//!
//! # Memory Layout
//!
//! ```text
//! Offset  Size  Field
//! 0       8     seq (AtomicU64) - even = stable, odd = write in progress
//! 8       8     id
//! 16      8     created_at (microseconds since epoch)
//! 24      8     updated_at
//! 32      2     node_type
//! 34      2     flags (occupied | deleted | chunk_head | chunk_continuation)
//! 36      2     data_len (bytes used in data)
//! 38      2     chunk_count (live entries in chunk_ids, heads only)
//! 40      128   name (UTF-8, NUL-padded, max 127 bytes)
//! 168     64    chunk_ids ([u64; 8], continuation ids, heads only)
//! 232     8     checksum (XxHash64)
//! 240     976   data
//! ```
//!
//! # Synchronization Protocol
//!
//! Writer (exactly one per lattice):
//! 1. `seq := seq | 1` (odd, Release)
//! 2. overwrite the body
//! 3. `seq := odd + 1` (even, Release)
//!
//! Reader: load `s1` (Acquire); if odd, spin; copy the body out; load `s2`
//! (Acquire); if `s1 != s2`, retry. The copy-and-recheck loop itself lives
//! in `lattice.rs`; this module only provides the primitives.
//!
//! # Checksum Domain
//!
//! XxHash64 over all 1216 record bytes with the `seq` and `checksum` fields
//! zeroed. `seq` is transient concurrency state: a WAL-replayed record
//! lands under a different slot generation and must still verify.

use std::cell::UnsafeCell;
use std::hash::Hasher;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use twox_hash::XxHash64;

use crate::config::NODE_SIZE;

/// Body size: everything after the seqlock counter.
pub const BODY_SIZE: usize = NODE_SIZE - 8;

/// Name field capacity. Names are NUL-padded; the last byte is always NUL.
pub const NAME_CAPACITY: usize = 128;

/// Maximum name length in bytes.
pub const MAX_NAME_LEN: usize = 127;

/// Inline payload capacity of one node.
pub const DATA_CAPACITY: usize = 976;

/// Continuation ids a chunk head can reference.
pub const MAX_INLINE_CHUNKS: usize = 8;

/// Payload bytes a chunk head carries after its u32 total-length prefix.
pub const HEAD_SLICE_CAPACITY: usize = DATA_CAPACITY - 4;

/// Largest logical payload the chain representation admits.
pub const MAX_PAYLOAD: usize = HEAD_SLICE_CAPACITY + MAX_INLINE_CHUNKS * DATA_CAPACITY;

/// Longest prefix `extract_prefix` will return, in bytes.
pub const PREFIX_MAX: usize = 64;

/// Slot holds a record (live or tombstoned). Never cleared once set.
pub const FLAG_OCCUPIED: u16 = 1 << 0;
/// Record is a tombstone; its slot is on the freelist.
pub const FLAG_DELETED: u16 = 1 << 1;
/// Record heads a chunked payload chain.
pub const FLAG_CHUNK_HEAD: u16 = 1 << 2;
/// Record is a chain continuation; invisible to lookups.
pub const FLAG_CHUNK_CONT: u16 = 1 << 3;

/// Record body: every field except the seqlock counter.
///
/// Plain old data; safe to copy out of the arena byte-for-byte.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct NodeBody {
    pub id: u64,
    pub created_at: u64,
    pub updated_at: u64,
    pub node_type: u16,
    pub flags: u16,
    pub data_len: u16,
    pub chunk_count: u16,
    pub name: [u8; NAME_CAPACITY],
    pub chunk_ids: [u64; MAX_INLINE_CHUNKS],
    pub checksum: u64,
    pub data: [u8; DATA_CAPACITY],
}

/// One 1216-byte record slot in the memory-mapped arena.
///
/// Accessed in place through pointers into the mapping; never constructed
/// on the heap. The `seq` counter is the only synchronization for the body.
#[repr(C, align(64))]
pub struct RawNode {
    /// Seqlock counter: even = stable, odd = write in progress.
    pub seq: AtomicU64,
    /// Record body, mutated under the seqlock protocol.
    pub body: UnsafeCell<NodeBody>,
}

// Format contract: exactly 1216 bytes, cache-line aligned.
const _: () = assert!(std::mem::size_of::<RawNode>() == NODE_SIZE);
const _: () = assert!(std::mem::size_of::<NodeBody>() == BODY_SIZE);
const _: () = assert!(NODE_SIZE % 64 == 0);
const _: () = assert!(std::mem::align_of::<RawNode>() == 64);

// SAFETY: RawNode lives in a shared mapping read by many threads while one
// writer mutates it. The seq counter (atomic) plus the copy-and-recheck
// read protocol make the body race benign; torn copies are detected and
// discarded by the reader.
unsafe impl Send for RawNode {}
unsafe impl Sync for RawNode {}

impl NodeBody {
    /// All-zero body (unoccupied slot image).
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            id: 0,
            created_at: 0,
            updated_at: 0,
            node_type: 0,
            flags: 0,
            data_len: 0,
            chunk_count: 0,
            name: [0u8; NAME_CAPACITY],
            chunk_ids: [0u64; MAX_INLINE_CHUNKS],
            checksum: 0,
            data: [0u8; DATA_CAPACITY],
        }
    }

    /// View the body as raw bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BODY_SIZE] {
        // SAFETY:
        // - NodeBody is repr(C) with no padding (all fields naturally
        //   aligned, verified by the size assertion above)
        // - Every bit pattern of the integer and byte-array fields is valid
        // - The reference lives as long as &self
        unsafe { &*(self as *const NodeBody as *const [u8; BODY_SIZE]) }
    }

    /// Rebuild a body from raw bytes (WAL replay, file inspection).
    #[must_use]
    pub fn from_bytes(bytes: &[u8; BODY_SIZE]) -> Self {
        // SAFETY:
        // - Source is exactly BODY_SIZE bytes
        // - NodeBody is repr(C) plain old data; every bit pattern is valid
        // - read_unaligned tolerates arbitrary source alignment
        unsafe { ptr::read_unaligned(bytes.as_ptr() as *const NodeBody) }
    }

    /// Set the name field, NUL-padding the remainder.
    ///
    /// Caller validates length; names over [`MAX_NAME_LEN`] are rejected
    /// before a body is ever built.
    pub fn set_name(&mut self, name: &str) {
        debug_assert!(name.len() <= MAX_NAME_LEN);
        self.name = [0u8; NAME_CAPACITY];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
    }

    /// Name bytes up to the first NUL.
    #[must_use]
    pub fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_CAPACITY);
        &self.name[..end]
    }

    /// Live record visible to lookups (occupied, not tombstoned).
    #[inline]
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.flags & FLAG_OCCUPIED != 0 && self.flags & FLAG_DELETED == 0
    }

    /// Chain continuation record.
    #[inline]
    #[must_use]
    pub fn is_continuation(&self) -> bool {
        self.flags & FLAG_CHUNK_CONT != 0
    }

    /// Chunked payload head.
    #[inline]
    #[must_use]
    pub fn is_chunk_head(&self) -> bool {
        self.flags & FLAG_CHUNK_HEAD != 0
    }

    /// Compute the checksum over this body plus a zeroed seq field, with
    /// the stored checksum itself zeroed.
    #[must_use]
    pub fn compute_checksum(&self) -> u64 {
        const CHECKSUM_OFFSET: usize = BODY_SIZE - DATA_CAPACITY - 8;
        let bytes = self.as_bytes();
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&[0u8; 8]); // seq field, always hashed as zero
        hasher.write(&bytes[..CHECKSUM_OFFSET]);
        hasher.write(&[0u8; 8]); // checksum field, hashed as zero
        hasher.write(&bytes[CHECKSUM_OFFSET + 8..]);
        hasher.finish()
    }

    /// Stamp the checksum field from the current contents.
    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = self.compute_checksum();
    }

    /// Verify the stored checksum.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

impl Default for NodeBody {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl RawNode {
    /// Load the seqlock counter (Acquire).
    #[inline]
    #[must_use]
    pub fn load_seq(&self) -> u64 {
        // Acquire pairs with the Release in commit_write(): once we observe
        // an even value, every body byte of that generation is visible.
        self.seq.load(Ordering::Acquire)
    }

    /// Mark the record write-in-progress and return the odd marker.
    ///
    /// Called only by the single writer. `s | 1` also normalizes a slot
    /// left odd by a crash mid-write (recovery rewrites it from the WAL).
    #[inline]
    pub fn begin_write(&self) -> u64 {
        let odd = self.seq.load(Ordering::Relaxed) | 1;
        self.seq.store(odd, Ordering::Release);
        odd
    }

    /// Commit the record (even counter, Release).
    #[inline]
    pub fn commit_write(&self, odd: u64) {
        debug_assert!(odd & 1 == 1);
        // Release: all body writes become visible before the even counter.
        self.seq.store(odd.wrapping_add(1), Ordering::Release);
    }

    /// Copy the body out without any consistency check.
    ///
    /// # Safety
    ///
    /// The copy may race the writer and return torn bytes. The caller must
    /// bracket it with `load_seq()` and discard the copy when the two loads
    /// differ or the first was odd (the seqlock read protocol).
    #[inline]
    #[must_use]
    pub unsafe fn copy_body(&self) -> NodeBody {
        ptr::read_volatile(self.body.get())
    }

    /// Overwrite the body under the seqlock write protocol.
    ///
    /// # Safety
    ///
    /// Caller must be the lattice's single writer (or hold exclusive access
    /// during recovery); two concurrent writers would tear each other.
    pub unsafe fn store_body(&self, body: &NodeBody) {
        let odd = self.begin_write();
        ptr::copy_nonoverlapping(
            body.as_bytes().as_ptr(),
            self.body.get() as *mut u8,
            BODY_SIZE,
        );
        self.commit_write(odd);
    }
}

/// Extract the semantic prefix from a record name.
///
/// The prefix is the longest leading run ending at the first `_` or `:`
/// (inclusive) within the first [`PREFIX_MAX`] bytes; the first occurrence
/// of either separator wins. Empty when no separator appears in the
/// window, meaning the record participates in no prefix bucket.
#[must_use]
pub fn extract_prefix(name: &str) -> &str {
    let bytes = name.as_bytes();
    let window = bytes.len().min(PREFIX_MAX);
    for (i, &b) in bytes[..window].iter().enumerate() {
        if b == b'_' || b == b':' {
            // Separators are ASCII, so i + 1 is a char boundary.
            return &name[..=i];
        }
    }
    ""
}
