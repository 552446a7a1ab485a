// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory retrieval index: prefix buckets, exact-name map, id-to-slot
//! map.
//!
//! Pure function of the currently live records: a full rebuild from an
//! arena scan and the incremental maintenance path converge on the same
//! contents (modulo insertion order within a bucket after swap-removes).
//!
//! All three maps live behind one `RwLock` owned by the lattice handle:
//! writers take it exclusively after their WAL frame is durable, readers
//! take it shared just long enough to collect ids, then read records
//! through the seqlock path without any lock.

use std::collections::HashMap;

/// Prefix buckets plus the exact-name and id-to-slot maps.
#[derive(Debug, Default)]
pub struct LatticeIndex {
    /// Prefix -> record ids, insertion order.
    prefixes: HashMap<String, Vec<u64>>,
    /// Full name -> id. Authoritative for name uniqueness.
    names: HashMap<String, u64>,
    /// id -> arena slot, for every addressable record including chain
    /// continuations (continuations are reachable by id only, never by
    /// name or prefix).
    slots: HashMap<u64, u64>,
}

impl LatticeIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live record's slot.
    pub fn register_slot(&mut self, id: u64, slot: u64) {
        self.slots.insert(id, slot);
    }

    /// Drop a record's slot mapping (tombstoned or swept).
    pub fn forget_slot(&mut self, id: u64) {
        self.slots.remove(&id);
    }

    /// Arena slot of `id`, if the record is addressable.
    #[must_use]
    pub fn slot_of(&self, id: u64) -> Option<u64> {
        self.slots.get(&id).copied()
    }

    /// Index a record under its name and prefix. `prefix` is the
    /// precomputed `extract_prefix(name)`; empty means no bucket.
    pub fn insert_name(&mut self, id: u64, name: &str, prefix: &str) {
        self.names.insert(name.to_string(), id);
        if !prefix.is_empty() {
            self.prefixes.entry(prefix.to_string()).or_default().push(id);
        }
    }

    /// Remove a record from the name map and its prefix bucket.
    ///
    /// Bucket removal is a swap-remove: O(bucket) worst case, and the
    /// relative order of later entries in the bucket changes.
    pub fn remove_name(&mut self, id: u64, name: &str, prefix: &str) {
        self.names.remove(name);
        if prefix.is_empty() {
            return;
        }
        if let Some(bucket) = self.prefixes.get_mut(prefix) {
            if let Some(pos) = bucket.iter().position(|&b| b == id) {
                bucket.swap_remove(pos);
            }
            if bucket.is_empty() {
                self.prefixes.remove(prefix);
            }
        }
    }

    /// Id holding `name` exactly, if any.
    #[must_use]
    pub fn id_by_name(&self, name: &str) -> Option<u64> {
        self.names.get(name).copied()
    }

    /// Up to `limit` ids from the prefix bucket in insertion order;
    /// `limit == 0` returns all. O(k) in the number of results.
    #[must_use]
    pub fn find(&self, prefix: &str, limit: usize) -> Vec<u64> {
        match self.prefixes.get(prefix) {
            Some(bucket) if limit == 0 || limit >= bucket.len() => bucket.clone(),
            Some(bucket) => bucket[..limit].to_vec(),
            None => Vec::new(),
        }
    }

    /// Number of live names (addressable records, continuations excluded).
    #[must_use]
    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    /// Number of distinct prefixes.
    #[must_use]
    pub fn prefix_count(&self) -> usize {
        self.prefixes.len()
    }

    /// Size of one bucket (tests and diagnostics).
    #[must_use]
    pub fn bucket_len(&self, prefix: &str) -> usize {
        self.prefixes.get(prefix).map_or(0, Vec::len)
    }
}
