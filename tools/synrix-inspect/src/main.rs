// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! synrix-inspect - Inspect Synrix lattice files
//!
//! Dumps the header, record occupancy, per-prefix bucket counts, and the
//! WAL frame list of a lattice file. Reads the raw file without taking
//! the advisory lock, so a store left behind by a crashed process can be
//! examined in place.

use clap::Parser;
use colored::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use synrix::config::{HEADER_SIZE, NODE_SIZE};
use synrix::header::LatticeHeader;
use synrix::node::{
    extract_prefix, NodeBody, BODY_SIZE, FLAG_CHUNK_CONT, FLAG_CHUNK_HEAD, FLAG_DELETED,
    FLAG_OCCUPIED,
};
use synrix::wal::{self, WalFrame};

/// Inspect Synrix lattice files
#[derive(Parser, Debug)]
#[command(name = "synrix-inspect")]
#[command(version)]
#[command(about = "Inspect Synrix lattice files and WALs")]
struct Args {
    /// Lattice file to inspect
    lattice: PathBuf,

    /// WAL path (defaults to <lattice>.wal)
    #[arg(short, long)]
    wal: Option<PathBuf>,

    /// List every occupied record
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Verify record checksums while scanning
    #[arg(short, long)]
    check: bool,

    /// List WAL frames
    #[arg(short = 'l', long)]
    log: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> io::Result<bool> {
    let mut file = File::open(&args.lattice)?;
    let file_len = file.metadata()?.len();

    let mut page = [0u8; HEADER_SIZE];
    file.read_exact(&mut page)?;
    let header = match LatticeHeader::decode(&page) {
        Ok(h) => h,
        Err(e) => {
            println!("{} {}", "header:".red().bold(), e);
            return Ok(false);
        }
    };

    print_header(&args.lattice, file_len, &header);

    let scan = scan_records(&mut file, &header, args)?;
    print_scan(&scan);

    let mut clean = scan.corrupt == 0;

    let wal_path = args
        .wal
        .clone()
        .unwrap_or_else(|| default_wal_path(&args.lattice));
    clean &= print_wal(&wal_path, header.last_checkpoint_lsn, args.log);

    Ok(clean)
}

fn print_header(path: &Path, file_len: u64, header: &LatticeHeader) {
    println!("{}", "=== Lattice Header ===".cyan().bold());
    println!("  file:                {}", path.display());
    println!("  file size:           {file_len} bytes");
    println!("  format version:      {}", header.version);
    println!("  record size:         {}", header.record_size);
    println!("  capacity:            {} records", header.capacity);
    println!("  next id:             {}", header.next_id);
    println!("  record count:        {}", header.record_count);
    println!("  deleted count:       {}", header.deleted_count);
    println!("  last checkpoint lsn: {}", header.last_checkpoint_lsn);
    if header.dictionary_node_id != 0 {
        println!("  dictionary node:     {}", header.dictionary_node_id);
    }
    println!();
}

#[derive(Default)]
struct ScanSummary {
    occupied: u64,
    live: u64,
    continuations: u64,
    tombstones: u64,
    corrupt: u64,
    buckets: BTreeMap<String, u64>,
}

fn scan_records(file: &mut File, header: &LatticeHeader, args: &Args) -> io::Result<ScanSummary> {
    let mut summary = ScanSummary::default();
    let mut record = vec![0u8; NODE_SIZE];

    if args.verbose {
        println!("{}", "=== Records ===".cyan().bold());
    }

    for slot in 0..header.capacity {
        let offset = HEADER_SIZE as u64 + slot * NODE_SIZE as u64;
        file.seek(SeekFrom::Start(offset))?;
        if file.read_exact(&mut record).is_err() {
            break; // file shorter than the header claims
        }

        let mut body_bytes = [0u8; BODY_SIZE];
        body_bytes.copy_from_slice(&record[8..]);
        let body = NodeBody::from_bytes(&body_bytes);
        if body.flags & FLAG_OCCUPIED == 0 {
            continue;
        }
        summary.occupied += 1;

        let deleted = body.flags & FLAG_DELETED != 0;
        let cont = body.flags & FLAG_CHUNK_CONT != 0;
        let checksum_ok = !args.check || body.verify_checksum();

        if deleted {
            summary.tombstones += 1;
        } else if !checksum_ok {
            summary.corrupt += 1;
        } else if cont {
            summary.continuations += 1;
        } else {
            summary.live += 1;
            let name = String::from_utf8_lossy(body.name_bytes()).into_owned();
            let prefix = extract_prefix(&name);
            if !prefix.is_empty() {
                *summary.buckets.entry(prefix.to_string()).or_default() += 1;
            }
        }

        if args.verbose {
            print_record(slot, &body, deleted, cont, checksum_ok);
        }
    }

    if args.verbose {
        println!();
    }
    Ok(summary)
}

fn print_record(slot: u64, body: &NodeBody, deleted: bool, cont: bool, checksum_ok: bool) {
    let state = if deleted {
        "tombstone".yellow()
    } else if !checksum_ok {
        "CORRUPT".red().bold()
    } else if cont {
        "continuation".blue()
    } else if body.flags & FLAG_CHUNK_HEAD != 0 {
        "chunk head".green()
    } else {
        "live".green()
    };

    let name = String::from_utf8_lossy(body.name_bytes()).into_owned();
    println!(
        "  slot {:>6}  id {:>6}  type {:>3}  len {:>4}  {:<12}  {}",
        slot, body.id, body.node_type, body.data_len, state, name
    );
}

fn print_scan(summary: &ScanSummary) {
    println!("{}", "=== Occupancy ===".cyan().bold());
    println!("  occupied slots:      {}", summary.occupied);
    println!("  live records:        {}", summary.live);
    println!("  continuations:       {}", summary.continuations);
    println!("  tombstones:          {}", summary.tombstones);
    if summary.corrupt > 0 {
        println!(
            "  {} {}",
            "corrupt records:    ".red().bold(),
            summary.corrupt
        );
    }
    println!();

    if !summary.buckets.is_empty() {
        println!("{}", "=== Prefix Buckets ===".cyan().bold());
        for (prefix, count) in &summary.buckets {
            println!("  {:<32} {count}", prefix);
        }
        println!();
    }
}

fn print_wal(wal_path: &Path, fence: u64, list_frames: bool) -> bool {
    println!("{}", "=== WAL ===".cyan().bold());
    let outcome = match wal::replay(wal_path, 0) {
        Ok(o) => o,
        Err(e) => {
            println!("  {} {e}", "unreadable:".red().bold());
            return false;
        }
    };

    let unapplied = outcome.frames.iter().filter(|f| f.lsn() > fence).count();
    println!("  path:                {}", wal_path.display());
    println!("  frames:              {}", outcome.frames.len());
    println!("  max lsn:             {}", outcome.max_lsn);
    println!("  unapplied frames:    {unapplied}");
    if outcome.torn_tail {
        println!("  {}", "torn tail detected".yellow().bold());
    }

    if list_frames {
        for frame in &outcome.frames {
            match frame {
                WalFrame::Put { lsn, slot, body } => {
                    let name = String::from_utf8_lossy(body.name_bytes()).into_owned();
                    println!("  [{lsn:>6}] PUT        slot {slot:>6}  id {:>6}  {name}", body.id);
                }
                WalFrame::Delete { lsn, ids } => {
                    println!("  [{lsn:>6}] DELETE     ids {ids:?}");
                }
                WalFrame::Checkpoint { lsn } => {
                    println!("  [{lsn:>6}] CHECKPOINT");
                }
            }
        }
    }

    !outcome.torn_tail
}

fn default_wal_path(lattice: &Path) -> PathBuf {
    let mut os = lattice.as_os_str().to_os_string();
    os.push(".wal");
    PathBuf::from(os)
}
