// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lattice file header (one 4096-byte page at offset 0).
//!
//! # Layout (little-endian)
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic "SYNR"
//! 4       4     format version (1)
//! 8       8     record size (must equal 1216)
//! 16      8     arena capacity (records)
//! 24      8     next_id high-water mark
//! 32      8     record_count (live records)
//! 40      8     deleted_count (tombstoned slots)
//! 48      8     last_checkpoint_lsn
//! 56      8     dictionary_node_id (0 = none; reserved for the
//!               symbolic-compression collaborator)
//! 64      4024  reserved, zero
//! 4088    8     header checksum (XxHash64 over bytes 0..4088)
//! ```
//!
//! Counter fields are authoritative only as of the last checkpoint; the
//! capacity field is authoritative always (growth rewrites it eagerly so
//! the mapping size can be validated on open).

use byteorder::{ByteOrder, LittleEndian};
use std::hash::Hasher;
use twox_hash::XxHash64;

use crate::config::{FORMAT_VERSION, HEADER_SIZE, LATTICE_MAGIC, NODE_SIZE};
use crate::{Error, Result};

const CHECKSUM_OFFSET: usize = HEADER_SIZE - 8;

/// Decoded lattice header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatticeHeader {
    pub version: u32,
    pub record_size: u64,
    pub capacity: u64,
    pub next_id: u64,
    pub record_count: u64,
    pub deleted_count: u64,
    pub last_checkpoint_lsn: u64,
    pub dictionary_node_id: u64,
}

impl LatticeHeader {
    /// Header for a freshly created lattice.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            record_size: NODE_SIZE as u64,
            capacity,
            next_id: 1, // id 0 is the reserved dictionary slot
            record_count: 0,
            deleted_count: 0,
            last_checkpoint_lsn: 0,
            dictionary_node_id: 0,
        }
    }

    /// Serialize into a header page, including the trailing checksum.
    pub fn encode(&self, page: &mut [u8; HEADER_SIZE]) {
        page.fill(0);
        page[0..4].copy_from_slice(&LATTICE_MAGIC);
        LittleEndian::write_u32(&mut page[4..8], self.version);
        LittleEndian::write_u64(&mut page[8..16], self.record_size);
        LittleEndian::write_u64(&mut page[16..24], self.capacity);
        LittleEndian::write_u64(&mut page[24..32], self.next_id);
        LittleEndian::write_u64(&mut page[32..40], self.record_count);
        LittleEndian::write_u64(&mut page[40..48], self.deleted_count);
        LittleEndian::write_u64(&mut page[48..56], self.last_checkpoint_lsn);
        LittleEndian::write_u64(&mut page[56..64], self.dictionary_node_id);

        let checksum = page_checksum(page);
        LittleEndian::write_u64(&mut page[CHECKSUM_OFFSET..], checksum);
    }

    /// Validate and decode a header page.
    ///
    /// Distinguishes the fatal open-time failures: bad magic or checksum
    /// (`CorruptHeader`), unknown version (`VersionMismatch`), and a record
    /// size other than 1216 (`RecordSizeMismatch`).
    pub fn decode(page: &[u8; HEADER_SIZE]) -> Result<Self> {
        if page[0..4] != LATTICE_MAGIC {
            return Err(Error::CorruptHeader("bad magic".into()));
        }

        let stored = LittleEndian::read_u64(&page[CHECKSUM_OFFSET..]);
        if stored != page_checksum(page) {
            return Err(Error::CorruptHeader("checksum mismatch".into()));
        }

        let version = LittleEndian::read_u32(&page[4..8]);
        if version != FORMAT_VERSION {
            return Err(Error::VersionMismatch {
                expected: FORMAT_VERSION,
                got: version,
            });
        }

        let record_size = LittleEndian::read_u64(&page[8..16]);
        if record_size != NODE_SIZE as u64 {
            return Err(Error::RecordSizeMismatch {
                expected: NODE_SIZE as u64,
                got: record_size,
            });
        }

        Ok(Self {
            version,
            record_size,
            capacity: LittleEndian::read_u64(&page[16..24]),
            next_id: LittleEndian::read_u64(&page[24..32]),
            record_count: LittleEndian::read_u64(&page[32..40]),
            deleted_count: LittleEndian::read_u64(&page[40..48]),
            last_checkpoint_lsn: LittleEndian::read_u64(&page[48..56]),
            dictionary_node_id: LittleEndian::read_u64(&page[56..64]),
        })
    }
}

fn page_checksum(page: &[u8; HEADER_SIZE]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(&page[..CHECKSUM_OFFSET]);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = LatticeHeader::new(1024);
        header.next_id = 99;
        header.record_count = 42;
        header.deleted_count = 3;
        header.last_checkpoint_lsn = 1234;

        let mut page = [0u8; HEADER_SIZE];
        header.encode(&mut page);
        let decoded = LatticeHeader::decode(&page).expect("decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_magic_bytes_on_disk() {
        let mut page = [0u8; HEADER_SIZE];
        LatticeHeader::new(16).encode(&mut page);
        assert_eq!(&page[0..4], b"SYNR");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut page = [0u8; HEADER_SIZE];
        LatticeHeader::new(16).encode(&mut page);
        page[0] = b'X';
        assert!(matches!(
            LatticeHeader::decode(&page),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_corrupt_page_rejected() {
        let mut page = [0u8; HEADER_SIZE];
        LatticeHeader::new(16).encode(&mut page);
        page[20] ^= 0xFF;
        assert!(matches!(
            LatticeHeader::decode(&page),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let mut page = [0u8; HEADER_SIZE];
        LatticeHeader::new(16).encode(&mut page);
        LittleEndian::write_u32(&mut page[4..8], 2);
        // Re-seal so only the version is wrong.
        let checksum = page_checksum(&page);
        LittleEndian::write_u64(&mut page[CHECKSUM_OFFSET..], checksum);
        assert!(matches!(
            LatticeHeader::decode(&page),
            Err(Error::VersionMismatch { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn test_record_size_mismatch() {
        let mut page = [0u8; HEADER_SIZE];
        LatticeHeader::new(16).encode(&mut page);
        LittleEndian::write_u64(&mut page[8..16], 512);
        let checksum = page_checksum(&page);
        LittleEndian::write_u64(&mut page[CHECKSUM_OFFSET..], checksum);
        assert!(matches!(
            LatticeHeader::decode(&page),
            Err(Error::RecordSizeMismatch { got: 512, .. })
        ));
    }

    #[test]
    fn test_reserved_region_zero() {
        let mut page = [0xABu8; HEADER_SIZE];
        LatticeHeader::new(16).encode(&mut page);
        assert!(page[64..CHECKSUM_OFFSET].iter().all(|&b| b == 0));
    }
}
