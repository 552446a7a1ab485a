// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lattice configuration - single source of truth.
//!
//! This module centralizes the on-disk constants and the open-time options.
//! **Never hardcode these values elsewhere!**
//!
//! # Levels
//!
//! - **Static**: compile-time constants of the file format (record size,
//!   header size, magic). Changing any of these is a format break.
//! - **Dynamic**: [`OpenOptions`] for per-handle tuning (capacity, WAL
//!   path, checkpoint cadence, sync mode).

use std::path::{Path, PathBuf};

// =======================================================================
// File Format Constants
// =======================================================================

/// Lattice file magic, bytes 0..4 of the header ("SYNR").
pub const LATTICE_MAGIC: [u8; 4] = [0x53, 0x59, 0x4E, 0x52];

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Header page size in bytes. Records begin at this offset.
pub const HEADER_SIZE: usize = 4096;

/// Size of one record in bytes. Pinned by a compile-time assertion in
/// `node.rs`; a file whose header declares any other value is rejected.
pub const NODE_SIZE: usize = 1216;

// =======================================================================
// Default Tuning
// =======================================================================

/// Records pre-allocated when a lattice file is created.
pub const DEFAULT_INITIAL_CAPACITY: u64 = 1024;

/// Mutating operations between checkpoints.
pub const DEFAULT_CHECKPOINT_OPS: u64 = 12_500;

/// Maximum wall time between checkpoints, in milliseconds.
pub const DEFAULT_CHECKPOINT_MS: u64 = 5_000;

/// Extension appended to the lattice path for the default WAL location.
pub const WAL_EXTENSION: &str = "wal";

/// WAL durability policy.
///
/// `Full` makes every mutation durable before it returns; `Batched` defers
/// the fsync to the next checkpoint and can lose the last window of writes
/// on a crash (never yielding a corrupt store, only a shorter history).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// fsync the WAL after every frame (default).
    #[default]
    Full,
    /// fsync the WAL only at checkpoint.
    Batched,
}

/// Options recognized by [`Lattice::open`](crate::Lattice::open).
///
/// # Example
///
/// ```rust,no_run
/// use synrix::{Lattice, OpenOptions};
///
/// let lattice = Lattice::open(
///     "agent.lattice",
///     OpenOptions::new().initial_capacity(4096).checkpoint_ops(1000),
/// )?;
/// # Ok::<(), synrix::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Records pre-allocated on creation.
    pub initial_capacity: u64,
    /// Hard cap on live records; `None` means unbounded. An external
    /// license/tier layer typically sets this.
    pub max_records: Option<u64>,
    /// WAL file path. Defaults to the lattice path with `.wal` appended.
    pub wal_path: Option<PathBuf>,
    /// Mutating operations between checkpoints.
    pub checkpoint_ops: u64,
    /// Maximum wall time between checkpoints, in milliseconds.
    pub checkpoint_ms: u64,
    /// Open without the writer path; all mutating operations fail.
    pub read_only: bool,
    /// WAL durability policy.
    pub sync_mode: SyncMode,
    /// Do not spawn the background checkpoint worker; both checkpoint
    /// triggers then fire inline on the next writer.
    pub no_background: bool,
}

impl OpenOptions {
    /// Options with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            max_records: None,
            wal_path: None,
            checkpoint_ops: DEFAULT_CHECKPOINT_OPS,
            checkpoint_ms: DEFAULT_CHECKPOINT_MS,
            read_only: false,
            sync_mode: SyncMode::Full,
            no_background: false,
        }
    }

    /// Records pre-allocated on creation (ignored when the file exists).
    #[must_use]
    pub fn initial_capacity(mut self, records: u64) -> Self {
        self.initial_capacity = records;
        self
    }

    /// Hard cap on live records enforced by `add`.
    #[must_use]
    pub fn max_records(mut self, records: u64) -> Self {
        self.max_records = Some(records);
        self
    }

    /// Explicit WAL file path.
    #[must_use]
    pub fn wal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wal_path = Some(path.into());
        self
    }

    /// Mutating operations between checkpoints.
    #[must_use]
    pub fn checkpoint_ops(mut self, ops: u64) -> Self {
        self.checkpoint_ops = ops;
        self
    }

    /// Maximum wall time between checkpoints, in milliseconds.
    #[must_use]
    pub fn checkpoint_ms(mut self, ms: u64) -> Self {
        self.checkpoint_ms = ms;
        self
    }

    /// Open read-only; mutating operations fail with `ReadOnly`.
    #[must_use]
    pub fn read_only(mut self, yes: bool) -> Self {
        self.read_only = yes;
        self
    }

    /// WAL durability policy.
    #[must_use]
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Disable the background checkpoint worker.
    #[must_use]
    pub fn no_background(mut self, yes: bool) -> Self {
        self.no_background = yes;
        self
    }

    /// Resolve the WAL path for a given lattice path.
    #[must_use]
    pub fn resolved_wal_path(&self, lattice_path: &Path) -> PathBuf {
        match &self.wal_path {
            Some(p) => p.clone(),
            None => {
                let mut os = lattice_path.as_os_str().to_os_string();
                os.push(".");
                os.push(WAL_EXTENSION);
                PathBuf::from(os)
            }
        }
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}
