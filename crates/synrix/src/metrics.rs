// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lattice diagnostic counters.
//!
//! All counters are thread-safe and can be read from any thread. They are
//! diagnostics, not control state: nothing in the engine branches on them.
//!
//! # Tracked Counters
//!
//! - `corrupt_records`: checksum mismatches observed on the read path
//! - `torn_wal_frames`: WAL tails discarded during recovery
//! - `checkpoints`: completed checkpoint cycles
//! - `wal_frames`: frames appended to the WAL
//! - `seqlock_retries`: record reads that had to retry against a writer
//! - `arena_growths`: capacity-doubling remap events
//! - `orphans_swept`: chunk continuations tombstoned by the open-time sweep

use std::sync::atomic::{AtomicU64, Ordering};

/// Diagnostic counters for one lattice handle.
///
/// All counters use `Relaxed` ordering for minimal overhead; values are
/// eventually consistent across threads.
#[derive(Debug, Default)]
pub struct LatticeMetrics {
    /// Checksum mismatches on the read path.
    pub corrupt_records: AtomicU64,
    /// Torn WAL tails discarded during recovery.
    pub torn_wal_frames: AtomicU64,
    /// Completed checkpoint cycles.
    pub checkpoints: AtomicU64,
    /// Frames appended to the WAL.
    pub wal_frames: AtomicU64,
    /// Seqlock read retries (writer raced a reader).
    pub seqlock_retries: AtomicU64,
    /// Arena capacity-doubling events.
    pub arena_growths: AtomicU64,
    /// Orphan chunk continuations swept at open.
    pub orphans_swept: AtomicU64,
}

impl LatticeMetrics {
    /// New instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            corrupt_records: AtomicU64::new(0),
            torn_wal_frames: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            wal_frames: AtomicU64::new(0),
            seqlock_retries: AtomicU64::new(0),
            arena_growths: AtomicU64::new(0),
            orphans_swept: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_corrupt_records(&self) {
        self.corrupt_records.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_torn_wal_frames(&self) {
        self.torn_wal_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_checkpoints(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_wal_frames(&self) {
        self.wal_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_seqlock_retries(&self) {
        self.seqlock_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_arena_growths(&self) {
        self.arena_growths.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_orphans_swept(&self, n: u64) {
        self.orphans_swept.fetch_add(n, Ordering::Relaxed);
    }

    /// Consistent-enough snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> LatticeMetricsSnapshot {
        LatticeMetricsSnapshot {
            corrupt_records: self.corrupt_records.load(Ordering::Relaxed),
            torn_wal_frames: self.torn_wal_frames.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            wal_frames: self.wal_frames.load(Ordering::Relaxed),
            seqlock_retries: self.seqlock_retries.load(Ordering::Relaxed),
            arena_growths: self.arena_growths.load(Ordering::Relaxed),
            orphans_swept: self.orphans_swept.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LatticeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatticeMetricsSnapshot {
    pub corrupt_records: u64,
    pub torn_wal_frames: u64,
    pub checkpoints: u64,
    pub wal_frames: u64,
    pub seqlock_retries: u64,
    pub arena_growths: u64,
    pub orphans_swept: u64,
}
