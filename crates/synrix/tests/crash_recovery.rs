// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crash recovery: WAL replay, torn-tail discard, orphan-chunk sweep.
//!
//! A crash is simulated by pairing an arena snapshot from checkpoint time
//! with WAL frames written after it - exactly what a kill between fsync
//! and checkpoint leaves on disk.

use synrix::node::{NodeBody, FLAG_CHUNK_CONT, FLAG_OCCUPIED};
use synrix::wal::Wal;
use synrix::{Error, Lattice, OpenOptions, SyncMode};
use tempfile::tempdir;

fn opts() -> OpenOptions {
    OpenOptions::new().initial_capacity(16).no_background(true)
}

fn live_body(id: u64, name: &str, data: &[u8]) -> NodeBody {
    let mut body = NodeBody::zeroed();
    body.id = id;
    body.created_at = 1_000;
    body.updated_at = 1_000;
    body.node_type = 1;
    body.flags = FLAG_OCCUPIED;
    body.set_name(name);
    body.data_len = data.len() as u16;
    body.data[..data.len()].copy_from_slice(data);
    body.seal();
    body
}

/// Create a checkpointed store holding one record ("BASE:1", id 1, slot 0).
fn base_store(path: &std::path::Path) {
    let lattice = Lattice::open(path, opts()).expect("open");
    lattice.add("BASE:1", 1, b"base").expect("add");
    lattice.close().expect("close");
}

#[test]
fn replay_applies_puts_after_checkpoint() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("store.lattice");
    let wal_path = dir.path().join("store.lattice.wal");
    base_store(&path);

    // Frames the crashed writer made durable but never checkpointed.
    {
        let mut wal = Wal::open(&wal_path, 1_000_000, SyncMode::Full).expect("wal");
        wal.append_put(1, &live_body(50, "NEW:x", b"hello")).expect("put");
        wal.append_put(2, &live_body(51, "NEW:y", b"world")).expect("put");
    }

    let lattice = Lattice::open(&path, opts()).expect("recover");
    assert_eq!(lattice.count(), 3);
    assert_eq!(lattice.get_by_name("NEW:x").expect("get").data, b"hello");
    assert_eq!(lattice.get_by_name("NEW:y").expect("get").data, b"world");
    assert_eq!(lattice.get(50).expect("get").name, "NEW:x");
    assert_eq!(lattice.find_by_prefix("NEW:", 0).len(), 2);
    assert!(lattice.verify().is_clean());

    // Recovery checkpointed; the log is truncated.
    assert_eq!(std::fs::metadata(&wal_path).expect("meta").len(), 0);
}

#[test]
fn replay_overwrites_record_in_place() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("store.lattice");
    let wal_path = dir.path().join("store.lattice.wal");
    base_store(&path);

    {
        let mut wal = Wal::open(&wal_path, 1_000_000, SyncMode::Full).expect("wal");
        wal.append_put(0, &live_body(1, "BASE:1", b"updated")).expect("put");
    }

    let lattice = Lattice::open(&path, opts()).expect("recover");
    assert_eq!(lattice.count(), 1);
    assert_eq!(lattice.get(1).expect("get").data, b"updated");
}

#[test]
fn replay_applies_deletes() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("store.lattice");
    let wal_path = dir.path().join("store.lattice.wal");
    base_store(&path);

    {
        let mut wal = Wal::open(&wal_path, 1_000_000, SyncMode::Full).expect("wal");
        wal.append_delete(&[1]).expect("delete");
    }

    let lattice = Lattice::open(&path, opts()).expect("recover");
    assert_eq!(lattice.count(), 0);
    assert!(matches!(lattice.get_by_name("BASE:1"), Err(Error::NotFound)));
    assert!(matches!(lattice.get(1), Err(Error::NotFound)));
}

#[test]
fn torn_tail_is_discarded_prefix_is_kept() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("store.lattice");
    let wal_path = dir.path().join("store.lattice.wal");
    base_store(&path);

    {
        let mut wal = Wal::open(&wal_path, 1_000_000, SyncMode::Full).expect("wal");
        wal.append_put(1, &live_body(50, "NEW:x", b"hello")).expect("put");
        wal.append_put(2, &live_body(51, "NEW:y", b"world")).expect("put");
    }
    // Kill mid-append of the second frame.
    let len = std::fs::metadata(&wal_path).expect("meta").len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&wal_path)
        .expect("open");
    file.set_len(len - 32).expect("truncate");

    let lattice = Lattice::open(&path, opts()).expect("recover");
    assert_eq!(lattice.count(), 2);
    assert!(lattice.get_by_name("NEW:x").is_ok());
    assert!(matches!(lattice.get_by_name("NEW:y"), Err(Error::NotFound)));
    assert_eq!(lattice.metrics().torn_wal_frames, 1);
    assert!(lattice.verify().is_clean());
}

#[test]
fn garbage_wal_leaves_checkpoint_state() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("store.lattice");
    let wal_path = dir.path().join("store.lattice.wal");
    base_store(&path);

    std::fs::write(&wal_path, vec![0xA5u8; 512]).expect("write garbage");

    let lattice = Lattice::open(&path, opts()).expect("recover");
    assert_eq!(lattice.count(), 1);
    assert!(lattice.get_by_name("BASE:1").is_ok());
    assert_eq!(lattice.metrics().torn_wal_frames, 1);
    // The dead bytes were cut away; future appends start clean.
    assert_eq!(std::fs::metadata(&wal_path).expect("meta").len(), 0);
}

#[test]
fn orphan_continuations_are_swept() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("store.lattice");
    let wal_path = dir.path().join("store.lattice.wal");
    base_store(&path);

    // A chunked add that crashed after journaling its continuations but
    // before the head frame: the continuations are reachable from nothing.
    {
        let mut wal = Wal::open(&wal_path, 1_000_000, SyncMode::Full).expect("wal");
        let mut cont = NodeBody::zeroed();
        cont.id = 60;
        cont.flags = FLAG_OCCUPIED | FLAG_CHUNK_CONT;
        cont.data_len = 4;
        cont.data[..4].copy_from_slice(b"orph");
        cont.seal();
        wal.append_put(1, &cont).expect("put");
    }

    let lattice = Lattice::open(&path, opts()).expect("recover");
    assert_eq!(lattice.count(), 1);
    assert_eq!(lattice.metrics().orphans_swept, 1);
    assert!(matches!(lattice.get(60), Err(Error::NotFound)));
    assert!(lattice.verify().is_clean());

    // The swept slot is reusable.
    assert_eq!(lattice.deleted_count(), 1);
}

#[test]
fn wal_only_durability_reconstructs_unflushed_writes() {
    let dir = tempdir().expect("tempdir");
    let crash_dir = tempdir().expect("tempdir");
    let path = dir.path().join("store.lattice");
    let wal_path = dir.path().join("store.lattice.wal");
    base_store(&path);

    // Snapshot the checkpointed arena: this is what stable storage held
    // when the post-checkpoint writes began.
    let crash_path = crash_dir.path().join("store.lattice");
    let crash_wal = crash_dir.path().join("store.lattice.wal");
    std::fs::copy(&path, &crash_path).expect("copy arena");

    // More writes, fully fsynced to the WAL, never checkpointed.
    {
        let lattice = Lattice::open(&path, opts()).expect("open");
        for i in 0..5 {
            lattice
                .add(&format!("POST:{i}"), 1, format!("v{i}").as_bytes())
                .expect("add");
        }
        // The crash image pairs the old arena with the current WAL.
        std::fs::copy(&wal_path, &crash_wal).expect("copy wal");
        lattice.close().expect("close");
    }

    let lattice = Lattice::open(&crash_path, opts()).expect("recover");
    assert_eq!(lattice.count(), 6);
    for i in 0..5 {
        let view = lattice.get_by_name(&format!("POST:{i}")).expect("get");
        assert_eq!(view.data, format!("v{i}").as_bytes());
    }
    assert!(lattice.verify().is_clean());
}

#[test]
fn recovery_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("store.lattice");
    let wal_path = dir.path().join("store.lattice.wal");
    base_store(&path);

    {
        let mut wal = Wal::open(&wal_path, 1_000_000, SyncMode::Full).expect("wal");
        wal.append_put(1, &live_body(50, "NEW:x", b"hello")).expect("put");
    }

    for _ in 0..3 {
        let lattice = Lattice::open(&path, opts()).expect("recover");
        assert_eq!(lattice.count(), 2);
        assert_eq!(lattice.get_by_name("NEW:x").expect("get").data, b"hello");
        lattice.close().expect("close");
    }
}

#[test]
fn read_only_open_ignores_wal() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("store.lattice");
    let wal_path = dir.path().join("store.lattice.wal");
    base_store(&path);

    {
        let mut wal = Wal::open(&wal_path, 1_000_000, SyncMode::Full).expect("wal");
        wal.append_put(1, &live_body(50, "NEW:x", b"hello")).expect("put");
    }
    let wal_len = std::fs::metadata(&wal_path).expect("meta").len();

    {
        let ro = Lattice::open(&path, opts().read_only(true)).expect("open ro");
        // Pre-crash checkpoint state only; the unapplied frame is not
        // visible and nothing was persisted.
        assert_eq!(ro.count(), 1);
        assert!(matches!(ro.get_by_name("NEW:x"), Err(Error::NotFound)));
    }
    assert_eq!(std::fs::metadata(&wal_path).expect("meta").len(), wal_len);

    // A writable open afterwards still replays the frame.
    let lattice = Lattice::open(&path, opts()).expect("recover");
    assert_eq!(lattice.count(), 2);
}
