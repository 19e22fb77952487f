//! stalker-replay-dump — dump and replay persisted backpatch descriptors.
//!
//! An [`Observer`](stalker_core::traits::Observer) may persist every
//! [`stalker_core::BackpatchDescriptor`] it sees as a JSON array of
//! [`stalker_core::ReplayRecord`]s (SPEC_FULL §6 "Prefetch surface"). This
//! tool either prints that array back in a human-readable form, or replays
//! it into a fresh process of the same binary via `Stalker::prefetch_backpatch`,
//! so a previously observed warm path doesn't have to pay the first-miss
//! penalty again.

use std::fs;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use stalker::{NullEventSink, Stalker};
use stalker_core::traits::NullTransformer;
use stalker_core::{BackpatchKind, ReplayRecord, StalkerConfig};

#[derive(Parser)]
#[command(name = "stalker-replay-dump", about = "Dump or replay persisted backpatch descriptors")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a JSON array of replay records in human-readable form.
    Dump {
        /// Path to a JSON array of `ReplayRecord`.
        input: String,
    },
    /// Follow the calling thread at `--seed` and replay each record through
    /// `Stalker::prefetch_backpatch`.
    Replay {
        /// Path to a JSON array of `ReplayRecord`.
        input: String,
        /// Hex address to seed `follow` with (stands in for the original
        /// return address, since this tool has no caller to capture one
        /// from — see `Stalker::follow`'s doc comment).
        #[arg(long)]
        seed: String,
        /// Trust threshold to install the replaying `Stalker` with.
        #[arg(long, default_value_t = 1)]
        trust_threshold: i32,
    },
}

fn load_records(path: &str) -> Vec<ReplayRecord> {
    let data = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("failed to read {path}: {e}");
        process::exit(1);
    });
    serde_json::from_str(&data).unwrap_or_else(|e| {
        eprintln!("failed to parse {path} as a JSON array of replay records: {e}");
        process::exit(1);
    })
}

fn parse_hex(s: &str) -> usize {
    usize::from_str_radix(s.trim_start_matches("0x"), 16).unwrap_or_else(|e| {
        eprintln!("invalid hex address {s}: {e}");
        process::exit(1);
    })
}

fn describe(record: &ReplayRecord) -> String {
    match record.kind {
        BackpatchKind::Call { prolog, post_call_offset } => {
            format!(
                "call  from=0x{:x} to=0x{:x} patch_offset={} prolog={prolog:?} post_call_offset={post_call_offset}",
                record.from, record.to, record.patch_offset
            )
        }
        BackpatchKind::Jmp => {
            format!("jmp   from=0x{:x} to=0x{:x} patch_offset={}", record.from, record.to, record.patch_offset)
        }
        BackpatchKind::Ret => {
            format!("ret   from=0x{:x} to=0x{:x} patch_offset={}", record.from, record.to, record.patch_offset)
        }
        BackpatchKind::InlineCache => {
            format!("ic    from=0x{:x} to=0x{:x} patch_offset={}", record.from, record.to, record.patch_offset)
        }
    }
}

fn dump(input: &str) {
    let records = load_records(input);
    println!("{} record(s)", records.len());
    for (i, record) in records.iter().enumerate() {
        println!("[{i}] {}", describe(record));
    }
}

fn replay(input: &str, seed: &str, trust_threshold: i32) {
    let records = load_records(input);
    let seed_pc = parse_hex(seed);

    let config = StalkerConfig::new(trust_threshold, 4).unwrap_or_else(|e| {
        eprintln!("invalid config: {e}");
        process::exit(1);
    });
    let stalker = Stalker::new(config).unwrap_or_else(|e| {
        eprintln!("failed to install stalker: {e}");
        process::exit(1);
    });

    let thread_id = unsafe { libc::syscall(libc::SYS_gettid) as u64 };
    if let Err(e) = stalker.follow(thread_id, seed_pc, Arc::new(NullTransformer), Arc::new(NullEventSink), None) {
        eprintln!("follow failed: {e}");
        process::exit(1);
    }

    let mut applied = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;
    for (i, record) in records.into_iter().enumerate() {
        match stalker.prefetch_backpatch(thread_id, record) {
            Ok(true) => {
                applied += 1;
                println!("[{i}] applied");
            }
            Ok(false) => {
                skipped += 1;
                println!("[{i}] skipped (target not yet trusted)");
            }
            Err(e) => {
                failed += 1;
                println!("[{i}] error: {e}");
            }
        }
    }

    println!("{applied} applied, {skipped} skipped, {failed} failed");
    if failed > 0 {
        process::exit(1);
    }
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Dump { input } => dump(&input),
        Command::Replay { input, seed, trust_threshold } => replay(&input, &seed, trust_threshold),
    }
}
