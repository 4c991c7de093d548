// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Operator CLI for the object-graph persistence engine.
//!
//! Provides `list`/`get`/`put`/`delete`/`ttl`/`stats`/`check`/`safemode`/
//! `maintenance` subcommands over a [`persist_store::Storage`] rooted at
//! `--root` (default `.`). No persisted class is registered, so every
//! record is read back as an opaque field bag and rendered as JSON.
//!
//! # Usage
//! ```text
//! persist-cli --root ./data list --class Widget
//! persist-cli --root ./data get <uuid> --raw
//! persist-cli --root ./data put --file node.json --class Widget
//! ```
//!
//! Exit code `0` on success, `1` on a usage or not-found error, `2` on an
//! operation failure (lock timeout, checksum mismatch, I/O error).

#![deny(rust_2018_idioms)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro
)]
// The CLI is expected to print to stdout/stderr.
#![allow(clippy::print_stdout, clippy::print_stderr, clippy::multiple_crate_versions)]

mod record;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use persist_store::{PersistError, Storage, StoreConfig};
use persist_uuid::RecordId;

use record::RawRecord;

#[derive(Parser)]
#[command(name = "persist-cli", about = "Operator CLI for the object-graph persistence engine")]
struct Cli {
    /// Storage root directory.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List record UUIDs, optionally restricted to one class.
    List {
        #[arg(long)]
        class: Option<String>,
    },
    /// Print a record's data, or its metadata with `--meta`.
    Get {
        uuid: String,
        /// Print the raw JSON data document (the default).
        #[arg(long)]
        raw: bool,
        /// Print metadata instead of data.
        #[arg(long)]
        meta: bool,
    },
    /// Store a record read from a JSON file.
    Put {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        class: String,
        /// Reuse this UUID instead of minting a new one.
        #[arg(long)]
        uuid: Option<String>,
        /// Time-to-live in seconds from now.
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Delete a record.
    Delete {
        uuid: String,
        /// Delete even if the record does not exist or is locked.
        #[arg(long)]
        force: bool,
    },
    /// Read or set a record's expiration.
    Ttl {
        uuid: String,
        /// Set the expiration this many seconds from now; omit to clear it.
        #[arg(long)]
        set: Option<u64>,
    },
    /// Print record and class counts.
    Stats,
    /// Verify every record's checksum, reporting failures.
    Check,
    /// Inspect or change safe-mode.
    Safemode {
        #[arg(long)]
        enable: bool,
        #[arg(long)]
        disable: bool,
        #[arg(long)]
        toggle: bool,
        #[arg(long)]
        status: bool,
    },
    /// Rebuild derived on-disk state.
    Maintenance {
        #[command(subcommand)]
        task: MaintenanceTask,
    },
}

#[derive(Subcommand)]
enum MaintenanceTask {
    /// Recreate the class-listing stub tree from each record's metadata.
    RebuildStubs,
    /// Recreate the sharded directory layout.
    RebuildShards,
}

/// The single safe-mode action requested, resolved from `Safemode`'s four
/// mutually-exclusive flags before reaching `cmd_safemode` (clippy flags
/// functions taking more than three bool parameters, and the flags are
/// mutually exclusive in practice anyway).
enum SafemodeAction {
    Enable,
    Disable,
    Toggle,
    Status,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PersistError>() {
        Some(PersistError::NotFound(_)) => 1,
        Some(_) => 2,
        None => 1,
    }
}

fn run(cli: &Cli) -> Result<()> {
    let storage = Storage::builder(StoreConfig::at(cli.root.clone())).open().context("opening store")?;

    match &cli.command {
        Command::List { class } => cmd_list(&storage, class.as_deref()),
        Command::Get { uuid, raw, meta } => cmd_get(&storage, uuid, *raw, *meta),
        Command::Put { file, class, uuid, ttl } => cmd_put(&storage, file.as_path(), class, uuid.as_deref(), *ttl),
        Command::Delete { uuid, force } => cmd_delete(&storage, uuid, *force),
        Command::Ttl { uuid, set } => cmd_ttl(&storage, uuid, *set),
        Command::Stats => cmd_stats(&storage),
        Command::Check => cmd_check(&storage),
        Command::Safemode { enable, disable, toggle, status: _ } => {
            let action = if *enable {
                SafemodeAction::Enable
            } else if *disable {
                SafemodeAction::Disable
            } else if *toggle {
                SafemodeAction::Toggle
            } else {
                SafemodeAction::Status
            };
            cmd_safemode(&storage, &action)
        }
        Command::Maintenance { task } => cmd_maintenance(&storage, task),
    }
}

fn parse_id(uuid: &str) -> Result<RecordId> {
    RecordId::parse(uuid).with_context(|| format!("invalid uuid: {uuid}"))
}

fn cmd_list(storage: &Storage, class: Option<&str>) -> Result<()> {
    let ids = storage.list(class)?;
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

fn cmd_get(storage: &Storage, uuid: &str, raw: bool, meta: bool) -> Result<()> {
    let id = parse_id(uuid)?;
    if meta && !raw {
        let metadata = storage.load_metadata(id)?;
        let json = serde_json::to_string_pretty(&metadata).context("encoding metadata")?;
        println!("{json}");
        return Ok(());
    }

    let Some(node) = storage.load(id, false)? else {
        bail!("{id} not found or expired");
    };
    let json = record::composite_to_json_public(node.as_ref());
    let text = serde_json::to_string_pretty(&json).context("encoding record")?;
    println!("{text}");
    Ok(())
}

fn cmd_put(storage: &Storage, file: &std::path::Path, class: &str, uuid: Option<&str>, ttl: Option<u64>) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).context("parsing JSON")?;
    let Some(object) = value.as_object() else {
        bail!("{} does not contain a JSON object", file.display());
    };

    let mut node = RawRecord::from_object(class, object);
    let requested_id = uuid.map(parse_id).transpose()?;
    let ttl = ttl.map(Duration::from_secs);
    let id = storage.store(&mut node, requested_id, ttl)?;
    println!("{id}");
    Ok(())
}

fn cmd_delete(storage: &Storage, uuid: &str, force: bool) -> Result<()> {
    let id = parse_id(uuid)?;
    storage.delete(id, force)?;
    println!("deleted {id}");
    Ok(())
}

fn cmd_ttl(storage: &Storage, uuid: &str, set: Option<u64>) -> Result<()> {
    let id = parse_id(uuid)?;
    if let Some(seconds) = set {
        #[allow(clippy::cast_precision_loss)]
        let at = wall_clock_now() + seconds as f64;
        storage.set_expiration(id, Some(at))?;
    }
    match storage.get_expiration(id)? {
        Some(at) => println!("{at}"),
        None => println!("never"),
    }
    Ok(())
}

/// `ttl --set` is relative to wall-clock time; the store's own clock seam
/// is only swapped out in tests, so the CLI reads system time directly
/// rather than threading a clock through the facade.
fn wall_clock_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

fn cmd_stats(storage: &Storage) -> Result<()> {
    let total = storage.count(None)?;
    println!("records: {total}");
    println!("safe_mode: {}", storage.is_safe_mode());
    Ok(())
}

fn cmd_check(storage: &Storage) -> Result<()> {
    let ids = storage.list(None)?;
    let mut failures = 0usize;
    for id in ids {
        // a `None` result here is either a listed-but-expired record or a
        // stub pointing at a record that no longer has data; neither is a
        // corruption finding for `check` to report.
        if let Err(err) = storage.load(id, false) {
            println!("{id}: {err}");
            failures += 1;
        }
    }
    println!("checked, {failures} failure(s)");
    if failures > 0 {
        bail!("{failures} record(s) failed verification");
    }
    Ok(())
}

fn cmd_safemode(storage: &Storage, action: &SafemodeAction) -> Result<()> {
    match action {
        SafemodeAction::Enable => storage.enable_safe_mode()?,
        SafemodeAction::Disable => storage.disable_safe_mode()?,
        SafemodeAction::Toggle if storage.is_safe_mode() => storage.disable_safe_mode()?,
        SafemodeAction::Toggle => storage.enable_safe_mode()?,
        SafemodeAction::Status => {}
    }
    println!("{}", if storage.is_safe_mode() { "enabled" } else { "disabled" });
    Ok(())
}

fn cmd_maintenance(storage: &Storage, task: &MaintenanceTask) -> Result<()> {
    match task {
        MaintenanceTask::RebuildStubs => storage.rebuild_stubs()?,
        MaintenanceTask::RebuildShards => storage.rebuild_shards()?,
    }
    println!("done");
    Ok(())
}
