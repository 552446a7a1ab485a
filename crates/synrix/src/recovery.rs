// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Open-time recovery and the background checkpoint driver.
//!
//! # Open Sequence
//!
//! 1. Map the file, validate the header (magic, version, record size,
//!    checksum)
//! 2. Scan the arena for live records (pre-replay id-to-slot map)
//! 3. Replay WAL frames with `lsn > last_checkpoint_lsn`; a torn tail is
//!    discarded and counted
//! 4. Rescan: rebuild the index, freelist, and counters from the arena,
//!    normalize any seq counter left odd by a crash
//! 5. Sweep orphan continuations (chains whose head never materialized)
//! 6. Checkpoint, truncating the WAL
//!
//! Read-only opens stop after step 4 and never write: a crashed store
//! opened read-only shows the last checkpoint state, with a warning that
//! a non-empty WAL was ignored.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::arena::Arena;
use crate::config::{OpenOptions, HEADER_SIZE};
use crate::header::LatticeHeader;
use crate::index::LatticeIndex;
use crate::lattice::{now_micros, Shared, WriterState};
use crate::metrics::LatticeMetrics;
use crate::node::{extract_prefix, NodeBody, FLAG_DELETED, FLAG_OCCUPIED};
use crate::wal::{self, Wal, WalFrame};
use crate::{Error, Result};

/// Open the lattice file, recover it, and build the shared state.
pub(crate) fn open_lattice(path: &Path, options: &OpenOptions) -> Result<Arc<Shared>> {
    let (arena, created) =
        Arena::open_or_create(path, options.initial_capacity, options.read_only)?;
    let metrics = LatticeMetrics::new();
    let wal_path = options.resolved_wal_path(path);

    let header = if created {
        let header = LatticeHeader::new(options.initial_capacity);
        let mut page = [0u8; HEADER_SIZE];
        header.encode(&mut page);
        arena.write_header_page(&page)?;
        arena.sync_file()?;
        log::debug!(
            "[LATTICE] created {} with capacity {}",
            path.display(),
            header.capacity
        );
        header
    } else {
        let page = arena.read_header_page();
        let header = LatticeHeader::decode(&page)?;
        // The mapping is sized from the file; the header may lag behind by
        // one crashed growth (file extended, page not yet rewritten) but
        // must never claim more than the file holds.
        if header.capacity > arena.capacity() {
            return Err(Error::CorruptHeader(
                "declared capacity exceeds file size".into(),
            ));
        }
        header
    };

    let mut last_checkpoint_lsn = header.last_checkpoint_lsn;

    // Pre-replay scan: route PUT/DELETE frames onto existing slots by id.
    let mut slots_by_id: HashMap<u64, u64> = HashMap::new();
    {
        let map = arena.map();
        for slot in 0..arena.capacity() {
            // SAFETY: exclusive access during open; no concurrent writer.
            let body = unsafe { map.node(slot).copy_body() };
            if body.flags & FLAG_OCCUPIED == 0 || body.flags & FLAG_DELETED != 0 {
                continue;
            }
            if body.verify_checksum() {
                slots_by_id.insert(body.id, slot);
            }
        }
    }

    // WAL replay. Every arena mutation since the checkpoint has a frame,
    // so torn arena writes are simply overwritten here.
    let outcome = wal::replay(&wal_path, last_checkpoint_lsn)?;
    let next_lsn = outcome.max_lsn.max(last_checkpoint_lsn) + 1;
    let mut replayed = 0usize;
    if options.read_only {
        if !outcome.frames.is_empty() {
            log::warn!(
                "[LATTICE] read-only open of {}: ignoring {} unapplied WAL frames",
                path.display(),
                outcome.frames.len()
            );
        }
    } else {
        if outcome.torn_tail {
            metrics.inc_torn_wal_frames();
            log::warn!(
                "[LATTICE] discarded torn WAL tail in {}",
                wal_path.display()
            );
        }
        replayed = outcome.frames.len();
        for frame in outcome.frames {
            // A fence means a checkpoint crashed before truncation; the
            // frames before it were flushed pre-crash and re-applying
            // them is idempotent.
            if let WalFrame::Checkpoint { lsn } = frame {
                last_checkpoint_lsn = last_checkpoint_lsn.max(lsn);
                continue;
            }
            apply_frame(&arena, &mut slots_by_id, frame)?;
        }
        if replayed > 0 {
            log::info!("[LATTICE] replayed {replayed} WAL frames");
        }
    }

    // Post-replay scan: rebuild index, freelist, counters; normalize seq
    // counters left odd by a crash mid-write.
    let mut index = LatticeIndex::new();
    let mut freelist: Vec<u64> = Vec::new();
    let mut continuations: Vec<(u64, u64)> = Vec::new();
    let mut referenced: HashSet<u64> = HashSet::new();
    let mut next_slot = 0u64;
    let mut max_id = 0u64;
    let mut record_count = 0u64;
    let mut deleted_count = 0u64;

    {
        let map = arena.map();
        for slot in 0..arena.capacity() {
            let node = map.node(slot);
            let seq = node.load_seq();
            if seq & 1 == 1 {
                if options.read_only {
                    // A write the crashed process never committed. The
                    // mapping is not writable, so the counter cannot be
                    // settled; leave the slot unindexed rather than let a
                    // reader spin on it.
                    log::warn!("[LATTICE] uncommitted write in slot {slot} (read-only)");
                    continue;
                }
                // Torn write whose frame was replayed over it (or whose
                // frame never became durable); settle the counter so
                // readers cannot spin on it.
                node.commit_write(seq);
            }

            // SAFETY: exclusive access during open.
            let body = unsafe { node.copy_body() };
            if body.flags & FLAG_OCCUPIED == 0 {
                continue;
            }
            next_slot = next_slot.max(slot + 1);
            max_id = max_id.max(chain_max_id(&body));

            if body.flags & FLAG_DELETED != 0 {
                freelist.push(slot);
                deleted_count += 1;
                continue;
            }
            if !body.verify_checksum() {
                // Reported missing on read, never auto-deleted.
                log::warn!("[LATTICE] corrupt record in slot {slot} (id {})", body.id);
                continue;
            }
            if body.is_continuation() {
                continuations.push((body.id, slot));
            } else {
                let name = String::from_utf8_lossy(body.name_bytes()).into_owned();
                index.insert_name(body.id, &name, extract_prefix(&name));
                index.register_slot(body.id, slot);
                record_count += 1;
                for &cid in &body.chunk_ids[..body.chunk_count as usize] {
                    referenced.insert(cid);
                }
            }
        }
    }

    // Orphan sweep: continuations no live head references are converted
    // to tombstones and their slots released. The only tombstone source
    // outside the delete path.
    let mut swept = 0u64;
    for (cid, cslot) in continuations {
        if referenced.contains(&cid) {
            index.register_slot(cid, cslot);
        } else if options.read_only {
            log::warn!("[LATTICE] orphan continuation id {cid} (read-only, left in place)");
        } else {
            let map = arena.map();
            let node = map.node(cslot);
            // SAFETY: exclusive access during open.
            let mut body = unsafe { node.copy_body() };
            body.flags |= FLAG_DELETED;
            body.updated_at = now_micros();
            body.seal();
            unsafe { node.store_body(&body) };
            freelist.push(cslot);
            deleted_count += 1;
            swept += 1;
        }
    }
    if swept > 0 {
        metrics.add_orphans_swept(swept);
        log::info!("[LATTICE] swept {swept} orphan chunk continuations");
    }

    let next_id = header.next_id.max(max_id + 1);

    let wal = if options.read_only {
        None
    } else {
        Some(Wal::open(&wal_path, next_lsn, options.sync_mode)?)
    };

    let shared = Arc::new(Shared {
        arena,
        index: RwLock::new(index),
        writer: Mutex::new(WriterState {
            wal,
            next_id,
            next_slot,
            freelist,
            record_count,
            deleted_count,
            ops_since_checkpoint: 0,
            last_checkpoint: Instant::now(),
            last_checkpoint_lsn,
            // Replay and the sweep wrote records outside the normal write
            // path; the recovery checkpoint must msync the whole prefix.
            dirty: if replayed > 0 || swept > 0 {
                next_slot.checked_sub(1).map(|hi| (0, hi))
            } else {
                None
            },
            poisoned: false,
        }),
        metrics,
        live_count: AtomicU64::new(record_count),
        read_only: options.read_only,
        max_records: options.max_records,
        checkpoint_ops: options.checkpoint_ops.max(1),
        checkpoint_ms: options.checkpoint_ms.max(1),
        no_background: options.no_background,
        worker_gate: (Mutex::new(false), Condvar::new()),
    });

    // Establish a fresh recovery baseline when anything was replayed or
    // repaired. A discarded torn tail also forces one: the next append
    // must not land behind dead bytes.
    if !options.read_only && (replayed > 0 || swept > 0 || outcome.torn_tail) {
        let mut w = shared.writer.lock();
        shared.checkpoint_locked(&mut w)?;
    }

    Ok(shared)
}

/// Apply one replayed frame to the arena.
fn apply_frame(
    arena: &Arena,
    slots_by_id: &mut HashMap<u64, u64>,
    frame: WalFrame,
) -> Result<()> {
    match frame {
        WalFrame::Put { slot, body, .. } => {
            while slot >= arena.capacity() {
                let doubled = arena.capacity() * 2;
                arena.grow(doubled)?;
            }
            let map = arena.map();
            // SAFETY: exclusive access during open.
            unsafe { map.node(slot).store_body(&body) };
            slots_by_id.insert(body.id, slot);
        }
        WalFrame::Delete { ids, .. } => {
            for id in ids {
                let Some(slot) = slots_by_id.remove(&id) else {
                    // Its PUT never became durable; nothing to tombstone.
                    continue;
                };
                let map = arena.map();
                let node = map.node(slot);
                // SAFETY: exclusive access during open.
                let mut body = unsafe { node.copy_body() };
                body.flags |= FLAG_DELETED;
                body.seal();
                unsafe { node.store_body(&body) };
            }
        }
        WalFrame::Checkpoint { .. } => {
            // Handled by the caller before frames reach this point.
        }
    }
    Ok(())
}

/// Largest id a record accounts for: its own, plus any continuation ids
/// its chain references.
fn chain_max_id(body: &NodeBody) -> u64 {
    let mut id = body.id;
    for &cid in &body.chunk_ids[..body.chunk_count as usize] {
        id = id.max(cid);
    }
    id
}

/// Spawn the time-based checkpoint worker.
///
/// Wakes every `checkpoint_ms`, checkpoints when mutations accumulated
/// since the last one, and exits when the gate flag is raised.
pub(crate) fn spawn_checkpoint_worker(shared: Arc<Shared>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("synrix-checkpoint".into())
        .spawn(move || {
            let interval = Duration::from_millis(shared.checkpoint_ms);
            loop {
                {
                    let mut stop = shared.worker_gate.0.lock();
                    if *stop {
                        break;
                    }
                    shared.worker_gate.1.wait_for(&mut stop, interval);
                    if *stop {
                        break;
                    }
                }

                let mut w = shared.writer.lock();
                let due = !w.poisoned
                    && w.ops_since_checkpoint > 0
                    && w.last_checkpoint.elapsed() >= interval;
                if due {
                    if let Err(e) = shared.checkpoint_locked(&mut w) {
                        log::warn!("[LATTICE] background checkpoint failed: {e}");
                    }
                }
            }
        })
        .map_err(Error::Io)
}
