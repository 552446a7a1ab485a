// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Synrix - Binary Lattice Knowledge Store
//!
//! A single-file, embeddable local knowledge store for AI agents:
//! deterministic sub-microsecond key lookup and O(k) prefix retrieval over
//! a persistent dataset, without embeddings or a server.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use synrix::{Lattice, OpenOptions, Result};
//!
//! fn main() -> Result<()> {
//!     let lattice = Lattice::open("agent.lattice", OpenOptions::new())?;
//!
//!     let id = lattice.add("USER:name", 1, b"Alice")?;
//!     assert_eq!(lattice.get(id)?.data, b"Alice");
//!
//!     for node in lattice.find_by_prefix("USER:", 0) {
//!         println!("{} = {:?}", node.name, node.data);
//!     }
//!
//!     lattice.close()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                          Lattice API                               |
//! |      add / get / get_by_name / find_by_prefix / delete / ...       |
//! +--------------------------------------------------------------------+
//! |   Prefix Index          |  Exact-Name Map   |  Id-to-Slot Map      |
//! |   (in-memory, rebuilt at open, one RwLock)                         |
//! +--------------------------------------------------------------------+
//! |   Write-Ahead Log       |        Memory-Mapped Arena               |
//! |   (durability fence)    |  1216-byte records, per-record seqlock   |
//! +--------------------------------------------------------------------+
//! |              Recovery & Checkpoint Driver                          |
//! |   header validation | WAL replay | orphan sweep | background flush |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Lattice`] | An opened lattice file; the entry point |
//! | [`OpenOptions`] | Open-time tuning (capacity, WAL path, checkpoints) |
//! | [`NodeView`] | A record copied out of the store |
//! | [`Error`] | Everything that can go wrong |
//!
//! ## Guarantees
//!
//! - **Durability**: a returned `add`/`delete` survives a crash (WAL
//!   fsynced before the arena is touched; see [`SyncMode`])
//! - **Lock-free reads**: readers never block writers; per-record seqlock
//!   counters detect races and retry
//! - **Single writer**: one mutating operation at a time per handle; one
//!   handle per file (advisory lock)
//! - **O(k) prefix scans**: bucket lookup is independent of store size

/// Memory-mapped record arena (file ownership, growth, flushing).
mod arena;
/// Open-time options and file-format constants.
pub mod config;
/// Lattice file header page (magic, version, counters, checksum).
pub mod header;
/// In-memory prefix / name / slot index.
mod index;
/// The lattice handle and its operations.
mod lattice;
/// Diagnostic counters.
pub mod metrics;
/// Fixed-size record layout and the seqlock primitives.
pub mod node;
/// Open-time recovery and the background checkpoint worker.
mod recovery;
/// Write-ahead log framing, append, and replay.
pub mod wal;

pub use config::{OpenOptions, SyncMode};
pub use lattice::{Lattice, NodeView, VerifyReport};
pub use metrics::{LatticeMetrics, LatticeMetricsSnapshot};

use std::fmt;
use std::io;

/// Errors returned by lattice operations.
///
/// # Example
///
/// ```rust,no_run
/// use synrix::{Error, Lattice, OpenOptions};
///
/// match Lattice::open("agent.lattice", OpenOptions::new()) {
///     Err(Error::AlreadyOpen) => println!("another process owns this file"),
///     Err(e) => println!("open failed: {e}"),
///     Ok(_) => println!("ready"),
/// }
/// ```
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Open-Time Errors
    // ========================================================================
    /// Header failed validation (magic, checksum, or file shape).
    CorruptHeader(String),
    /// File written by an incompatible format version.
    VersionMismatch { expected: u32, got: u32 },
    /// File declares a record size other than 1216.
    RecordSizeMismatch { expected: u64, got: u64 },
    /// Another live handle holds the advisory lock on this file.
    AlreadyOpen,
    /// Rejected capacity option (zero).
    InvalidCapacity(u64),

    // ========================================================================
    // Write Errors
    // ========================================================================
    /// Name is empty or longer than 127 bytes (the rejected length).
    InvalidName(usize),
    /// Payload exceeds what the chain representation admits.
    PayloadTooLarge { size: usize, capacity: usize },
    /// The configured `max_records` cap was reached.
    CapacityLimit(u64),
    /// Handle was opened read-only.
    ReadOnly,
    /// A prior arena-side failure disabled writes; only reads and `close`
    /// remain legal.
    Poisoned,

    // ========================================================================
    // Read Errors
    // ========================================================================
    /// No record with that id or name.
    NotFound,
    /// Record failed checksum verification; reported missing, never
    /// auto-deleted.
    CorruptRecord(u64),

    // ========================================================================
    // I/O
    // ========================================================================
    /// Underlying filesystem or mapping failure.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Open-time
            Error::CorruptHeader(msg) => write!(f, "Corrupt lattice header: {msg}"),
            Error::VersionMismatch { expected, got } => {
                write!(f, "Format version mismatch: expected {expected}, got {got}")
            }
            Error::RecordSizeMismatch { expected, got } => {
                write!(f, "Record size mismatch: expected {expected}, got {got}")
            }
            Error::AlreadyOpen => write!(f, "Lattice file is already open in another handle"),
            Error::InvalidCapacity(cap) => write!(f, "Invalid capacity: {cap}"),
            // Write
            Error::InvalidName(len) => {
                write!(f, "Invalid name: {len} bytes (must be 1-127)")
            }
            Error::PayloadTooLarge { size, capacity } => {
                write!(f, "Payload too large: {size} bytes exceeds {capacity}")
            }
            Error::CapacityLimit(cap) => write!(f, "Record cap reached: {cap}"),
            Error::ReadOnly => write!(f, "Handle is read-only"),
            Error::Poisoned => write!(f, "Writer is poisoned after an arena failure"),
            // Read
            Error::NotFound => write!(f, "Record not found"),
            Error::CorruptRecord(id) => write!(f, "Record {id} failed checksum verification"),
            // I/O
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for lattice operations.
pub type Result<T> = std::result::Result<T, Error>;
