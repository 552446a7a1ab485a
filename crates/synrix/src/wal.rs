// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Write-ahead log: append-only journal of lattice mutations.
//!
//! # Frame Format
//!
//! ```text
//! +--------------------------------------------------------------+
//! | magic (4) | frame_type (4) | lsn (8) | length (8) |          |
//! | payload[length] | crc (8)                                    |
//! +--------------------------------------------------------------+
//! ```
//!
//! Frame types: 1 = PUT, 2 = DELETE, 3 = CHECKPOINT. The crc is XxHash64
//! over everything before it (header + payload). All fields little-endian.
//!
//! # Payloads
//!
//! - PUT: `u64 slot | 1216 record bytes` (seq serialized as zero)
//! - DELETE: `u32 count | count x u64 id`; a head and its continuations
//!   tombstone under one frame
//! - CHECKPOINT: `u64 lsn` high-water mark
//!
//! # Torn Tails
//!
//! Replay stops at the first frame that fails framing or crc; everything
//! after it is a torn tail from a crash mid-append and is discarded. The
//! frame before it is the last committed mutation.

use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions as FsOpenOptions};
use std::hash::Hasher;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use twox_hash::XxHash64;

use crate::config::{SyncMode, NODE_SIZE};
use crate::node::{NodeBody, BODY_SIZE};
use crate::{Error, Result};

/// WAL frame magic ("SWAL" on disk).
pub const FRAME_MAGIC: u32 = u32::from_le_bytes(*b"SWAL");

/// Fixed frame header size (magic + type + lsn + length).
pub const FRAME_HEADER_SIZE: usize = 24;

/// Trailing crc size.
pub const FRAME_CRC_SIZE: usize = 8;

/// Upper bound on a sane payload; anything larger is framing damage.
const MAX_PAYLOAD_LEN: u64 = 1 << 24;

/// WAL frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    Put = 1,
    Delete = 2,
    Checkpoint = 3,
}

impl FrameType {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Put),
            2 => Some(Self::Delete),
            3 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// A decoded WAL frame.
#[derive(Debug, Clone)]
pub enum WalFrame {
    Put {
        lsn: u64,
        slot: u64,
        body: Box<NodeBody>,
    },
    Delete {
        lsn: u64,
        ids: Vec<u64>,
    },
    Checkpoint {
        lsn: u64,
    },
}

impl WalFrame {
    /// LSN of this frame.
    #[must_use]
    pub fn lsn(&self) -> u64 {
        match self {
            Self::Put { lsn, .. } | Self::Delete { lsn, .. } | Self::Checkpoint { lsn } => *lsn,
        }
    }
}

/// Result of scanning a WAL file.
#[derive(Debug, Default)]
pub struct ReplayOutcome {
    /// Frames with `lsn > after_lsn`, in log order.
    pub frames: Vec<WalFrame>,
    /// Highest lsn seen in the log, including skipped frames.
    pub max_lsn: u64,
    /// A torn tail was detected and discarded.
    pub torn_tail: bool,
}

/// Append-side handle to the WAL file.
pub struct Wal {
    file: File,
    path: PathBuf,
    next_lsn: u64,
    /// Committed log length, for rolling back a failed append.
    len: u64,
    sync_mode: SyncMode,
    /// A failed append could not be rolled back; the tail is suspect and
    /// no further frame may land after it.
    tainted: bool,
}

impl Wal {
    /// Open (or create) the WAL for appending. `next_lsn` continues the
    /// sequence established by recovery.
    pub fn open(path: &Path, next_lsn: u64, sync_mode: SyncMode) -> Result<Self> {
        let file = FsOpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(Error::Io)?;
        let len = file.metadata().map_err(Error::Io)?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            next_lsn,
            len,
            sync_mode,
            tainted: false,
        })
    }

    /// Next LSN this log will assign.
    #[inline]
    #[must_use]
    pub fn next_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// WAL file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a PUT frame carrying the full record image for `slot`.
    pub fn append_put(&mut self, slot: u64, body: &NodeBody) -> Result<u64> {
        let mut payload = Vec::with_capacity(8 + NODE_SIZE);
        payload.extend_from_slice(&slot.to_le_bytes());
        payload.extend_from_slice(&[0u8; 8]); // seq field, serialized as zero
        payload.extend_from_slice(body.as_bytes());
        self.append_frame(FrameType::Put, &payload, false)
    }

    /// Append a DELETE frame tombstoning `ids` (head first, then its
    /// continuations) as one atomic group.
    pub fn append_delete(&mut self, ids: &[u64]) -> Result<u64> {
        let mut payload = Vec::with_capacity(4 + ids.len() * 8);
        payload.extend_from_slice(&(ids.len() as u32).to_le_bytes());
        for id in ids {
            payload.extend_from_slice(&id.to_le_bytes());
        }
        self.append_frame(FrameType::Delete, &payload, false)
    }

    /// Append a CHECKPOINT frame. Always fsynced, even in batched mode.
    pub fn append_checkpoint(&mut self) -> Result<u64> {
        let high_water = self.next_lsn;
        self.append_frame(FrameType::Checkpoint, &high_water.to_le_bytes(), true)
    }

    /// Force the log to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data().map_err(Error::Io)
    }

    /// Truncate the log after a checkpoint. LSNs keep counting; the
    /// checkpoint lsn persisted in the lattice header is the fence.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0).map_err(Error::Io)?;
        self.file.sync_data().map_err(Error::Io)?;
        self.len = 0;
        self.tainted = false;
        Ok(())
    }

    fn append_frame(
        &mut self,
        frame_type: FrameType,
        payload: &[u8],
        force_sync: bool,
    ) -> Result<u64> {
        if self.tainted {
            return Err(Error::Io(std::io::Error::other(
                "WAL tail is suspect after a failed append",
            )));
        }
        let lsn = self.next_lsn;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + FRAME_CRC_SIZE);
        frame.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        frame.extend_from_slice(&(frame_type as u32).to_le_bytes());
        frame.extend_from_slice(&lsn.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        frame.extend_from_slice(payload);

        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&frame);
        frame.extend_from_slice(&hasher.finish().to_le_bytes());

        if let Err(e) = self.write_and_sync(&frame, force_sync) {
            // Roll the partial frame back so a later append cannot land
            // unreachable behind it. If even that fails, refuse further
            // appends until the next truncation.
            if self.file.set_len(self.len).is_err() {
                self.tainted = true;
            }
            return Err(e);
        }

        self.len += frame.len() as u64;
        self.next_lsn = lsn + 1;
        Ok(lsn)
    }

    fn write_and_sync(&mut self, frame: &[u8], force_sync: bool) -> Result<()> {
        self.file.write_all(frame).map_err(Error::Io)?;
        if force_sync || self.sync_mode == SyncMode::Full {
            self.file.sync_data().map_err(Error::Io)?;
        }
        Ok(())
    }
}

/// Scan a WAL file, returning every well-formed frame with
/// `lsn > after_lsn`. Missing file means an empty log. A torn tail is
/// reported, not surfaced as an error.
pub fn replay(path: &Path, after_lsn: u64) -> Result<ReplayOutcome> {
    let mut outcome = ReplayOutcome::default();

    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(outcome),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(Error::Io)?;

    let mut pos = 0usize;
    while buf.len() - pos >= FRAME_HEADER_SIZE + FRAME_CRC_SIZE {
        let header = &buf[pos..pos + FRAME_HEADER_SIZE];
        let magic = LittleEndian::read_u32(&header[0..4]);
        let raw_type = LittleEndian::read_u32(&header[4..8]);
        let lsn = LittleEndian::read_u64(&header[8..16]);
        let length = LittleEndian::read_u64(&header[16..24]);

        let Some(frame_type) = FrameType::from_u32(raw_type) else {
            outcome.torn_tail = true;
            break;
        };
        if magic != FRAME_MAGIC || length > MAX_PAYLOAD_LEN {
            outcome.torn_tail = true;
            break;
        }

        let frame_end = pos + FRAME_HEADER_SIZE + length as usize + FRAME_CRC_SIZE;
        if frame_end > buf.len() {
            outcome.torn_tail = true;
            break;
        }

        let crc_offset = frame_end - FRAME_CRC_SIZE;
        let stored_crc = LittleEndian::read_u64(&buf[crc_offset..frame_end]);
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&buf[pos..crc_offset]);
        if hasher.finish() != stored_crc {
            outcome.torn_tail = true;
            break;
        }

        let payload = &buf[pos + FRAME_HEADER_SIZE..crc_offset];
        let Some(frame) = decode_payload(frame_type, lsn, payload) else {
            outcome.torn_tail = true;
            break;
        };

        outcome.max_lsn = outcome.max_lsn.max(lsn);
        if lsn > after_lsn {
            outcome.frames.push(frame);
        }
        pos = frame_end;
    }

    // Trailing bytes shorter than a frame header are also a torn tail.
    if pos < buf.len() && !outcome.torn_tail {
        outcome.torn_tail = true;
    }

    Ok(outcome)
}

fn decode_payload(frame_type: FrameType, lsn: u64, payload: &[u8]) -> Option<WalFrame> {
    match frame_type {
        FrameType::Put => {
            if payload.len() != 8 + NODE_SIZE {
                return None;
            }
            let slot = LittleEndian::read_u64(&payload[0..8]);
            // Skip the serialized seq field (payload[8..16]).
            let mut body_bytes = [0u8; BODY_SIZE];
            body_bytes.copy_from_slice(&payload[16..16 + BODY_SIZE]);
            Some(WalFrame::Put {
                lsn,
                slot,
                body: Box::new(NodeBody::from_bytes(&body_bytes)),
            })
        }
        FrameType::Delete => {
            if payload.len() < 4 {
                return None;
            }
            let count = LittleEndian::read_u32(&payload[0..4]) as usize;
            if payload.len() != 4 + count * 8 {
                return None;
            }
            let ids = payload[4..]
                .chunks_exact(8)
                .map(LittleEndian::read_u64)
                .collect();
            Some(WalFrame::Delete { lsn, ids })
        }
        FrameType::Checkpoint => {
            if payload.len() != 8 {
                return None;
            }
            Some(WalFrame::Checkpoint { lsn })
        }
    }
}
