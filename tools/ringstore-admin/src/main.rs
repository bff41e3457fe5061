//! ringstore-admin: inspection and maintenance CLI for ringstore files.
//!
//! Clap derive subcommands, `colored` status coloring, `tabled` row
//! rendering, a single `anyhow::Result` error surface at the binary
//! boundary. Talks to a local file through the engine directly rather than
//! an HTTP gateway — there is no running daemon to poll here, just a file
//! on disk.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tabled::{Table as TabledTable, Tabled};

use ringstore_core::ring::{mget_cons, OpenSpec, RingHandle};
use ringstore_core::table::Table;
use ringstore_core::{Backend, CreatePerm, Superblock};
use ringstore_sqlite::SqliteBackend;

#[derive(Parser, Debug)]
#[command(name = "ringstore-admin")]
#[command(about = "Inspection and maintenance CLI for ringstore files")]
#[command(version)]
struct Args {
    /// Path to the ringstore file.
    #[arg(short, long)]
    file: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the superblock: version, origin host, generation, ring counter.
    Super,

    /// List every ring in the file's ring directory.
    Rings,

    /// Dump a ring's index rows (seq, time, header hash).
    Index {
        #[arg(long)]
        ring: String,
        #[arg(long, default_value_t = 0)]
        dur: u32,
    },

    /// Read up to `n` samples starting from the ring's oldest sequence.
    Dump {
        #[arg(long)]
        ring: String,
        #[arg(long, default_value_t = 0)]
        dur: u32,
        #[arg(short, long, default_value_t = 20)]
        n: usize,
    },

    /// Consolidate all rings with the given name across durations.
    Cons {
        #[arg(long)]
        ring: String,
        #[arg(long)]
        from: Option<i64>,
        #[arg(long)]
        to: Option<i64>,
    },

    /// Create a ring if it does not already exist.
    CreateRing {
        #[arg(long)]
        ring: String,
        #[arg(long, default_value_t = 0)]
        dur: u32,
        #[arg(long, default_value_t = 0)]
        cap: u32,
        #[arg(long, default_value = "")]
        long: String,
        #[arg(long, default_value = "")]
        about: String,
    },

    /// Destroy a ring and all of its data.
    DestroyRing {
        #[arg(long)]
        ring: String,
        #[arg(long, default_value_t = 0)]
        dur: u32,
    },

    /// Purge up to `n` samples from a ring's oldest end.
    Purge {
        #[arg(long)]
        ring: String,
        #[arg(long, default_value_t = 0)]
        dur: u32,
        #[arg(short, long)]
        n: u64,
    },

    /// Resize a ring's slot capacity (0 = unbounded).
    Resize {
        #[arg(long)]
        ring: String,
        #[arg(long, default_value_t = 0)]
        dur: u32,
        #[arg(long)]
        cap: u32,
    },

    /// Show the on-disk byte footprint of the file.
    Footprint,

    /// Poll a ring's bounds (oldest/youngest) on an interval until Ctrl+C.
    Watch {
        #[arg(long)]
        ring: String,
        #[arg(long, default_value_t = 0)]
        dur: u32,
        #[arg(short, long, default_value_t = 1)]
        interval: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let backend = SqliteBackend::new();

    let result = match &args.command {
        Commands::Super => cmd_super(&backend, &args.file),
        Commands::Rings => cmd_rings(&backend, &args.file),
        Commands::Index { ring, dur } => cmd_index(&backend, &args.file, ring, *dur),
        Commands::Dump { ring, dur, n } => cmd_dump(&backend, &args.file, ring, *dur, *n),
        Commands::Cons { ring, from, to } => cmd_cons(&backend, &args.file, ring, *from, *to),
        Commands::CreateRing {
            ring,
            dur,
            cap,
            long,
            about,
        } => cmd_create_ring(&backend, &args.file, ring, *dur, *cap, long, about),
        Commands::DestroyRing { ring, dur } => cmd_destroy_ring(&backend, &args.file, ring, *dur),
        Commands::Purge { ring, dur, n } => cmd_purge(&backend, &args.file, ring, *dur, *n),
        Commands::Resize { ring, dur, cap } => cmd_resize(&backend, &args.file, ring, *dur, *cap),
        Commands::Footprint => cmd_footprint(&backend, &args.file),
        Commands::Watch { ring, dur, interval } => cmd_watch(&backend, &args.file, ring, *dur, *interval),
    };

    if let Err(e) = &result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
    Ok(())
}

fn open_existing(backend: &SqliteBackend, file: &str, ring: &str, dur: u32) -> Result<RingHandle<SqliteBackend>> {
    RingHandle::open(
        backend,
        &OpenSpec {
            path: file.to_string(),
            perm: CreatePerm::default(),
            ring_name: ring.to_string(),
            long_name: String::new(),
            about: String::new(),
            slot_capacity: 0,
            duration: dur,
            create: false,
        },
    )
    .with_context(|| format!("opening ring {}@{}", ring, dur))
}

fn cmd_super(backend: &SqliteBackend, file: &str) -> Result<()> {
    let desc = backend
        .open(file, CreatePerm::default(), false)
        .with_context(|| format!("opening {}", file))?;
    backend.lock(&desc, ringstore_core::backend::LockMode::Read, "admin_super")?;
    let sb: Superblock = backend.read_super(&desc)?;
    let damaged = backend.is_damaged(&desc)?;
    backend.unlock(&desc)?;
    backend.close(desc)?;

    println!("{}", "Superblock".cyan().bold());
    println!("  Version:     {}", sb.version);
    println!("  Created:     {}", sb.created);
    println!("  Host:        {}", sb.hostname);
    println!("  OS:          {} {}", sb.os_name, sb.os_release);
    println!("  Machine:     {}", sb.machine);
    println!("  Generation:  {}", sb.generation);
    println!("  Ring counter: {}", sb.ring_counter);
    if damaged {
        println!("  Status:      {}", "DAMAGED".red().bold());
    } else {
        println!("  Status:      {}", "ok".green());
    }
    Ok(())
}

#[derive(Tabled)]
struct RingRow {
    #[tabled(rename = "Id")]
    id: u64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Duration")]
    duration: u32,
    #[tabled(rename = "Capacity")]
    capacity: String,
    #[tabled(rename = "Long Name")]
    long_name: String,
}

fn cmd_rings(backend: &SqliteBackend, file: &str) -> Result<()> {
    let desc = backend.open(file, CreatePerm::default(), false)?;
    backend.lock(&desc, ringstore_core::backend::LockMode::Read, "admin_rings")?;
    let dir = backend.read_ringdir(&desc)?;
    backend.unlock(&desc)?;
    backend.close(desc)?;

    println!("{}", "Ring Directory".cyan().bold());
    println!("  Count: {}", dir.entries.len());
    println!();

    if dir.entries.is_empty() {
        println!("  {}", "No rings".yellow());
        return Ok(());
    }

    let rows: Vec<RingRow> = dir
        .entries
        .iter()
        .map(|e| RingRow {
            id: e.id,
            name: e.name.clone(),
            duration: e.duration,
            capacity: if e.slot_capacity == 0 {
                "unbounded".to_string()
            } else {
                e.slot_capacity.to_string()
            },
            long_name: e.long_name.clone(),
        })
        .collect();
    println!("{}", TabledTable::new(rows));
    Ok(())
}

#[derive(Tabled)]
struct IndexRowView {
    #[tabled(rename = "Seq")]
    seq: u64,
    #[tabled(rename = "Time")]
    time: i64,
    #[tabled(rename = "Header Hash")]
    hd_hash: u32,
}

fn cmd_index(backend: &SqliteBackend, file: &str, ring: &str, dur: u32) -> Result<()> {
    let h = open_existing(backend, file, ring, dur)?;
    let ring_id = h.ring_id()?;
    let desc = backend.open(file, CreatePerm::default(), false)?;
    backend.lock(&desc, ringstore_core::backend::LockMode::Read, "admin_index")?;
    let idx = backend.read_index(&desc, ring_id)?;
    backend.unlock(&desc)?;
    backend.close(desc)?;
    h.close(backend)?;

    if idx.is_empty() {
        println!("{}", "No index rows".yellow());
        return Ok(());
    }
    let rows: Vec<IndexRowView> = idx
        .rows
        .iter()
        .map(|r| IndexRowView {
            seq: r.seq,
            time: r.time,
            hd_hash: r.hd_hash,
        })
        .collect();
    println!("{}", TabledTable::new(rows));
    Ok(())
}

fn print_table(table: &Table) {
    println!("{}", table.columns.join("\t").bold());
    for row in &table.rows {
        println!("{}", row.join("\t"));
    }
    println!("({} row(s))", table.rows.len());
}

fn cmd_dump(backend: &SqliteBackend, file: &str, ring: &str, dur: u32, n: usize) -> Result<()> {
    let mut h = open_existing(backend, file, ring, dur)?;
    h.goto_seq(h.oldest().max(0) as u64);
    match h.mget_n(backend, n)? {
        Some(table) => print_table(&table),
        None => println!("{}", "No data".yellow()),
    }
    h.close(backend)?;
    Ok(())
}

fn cmd_cons(backend: &SqliteBackend, file: &str, ring: &str, from: Option<i64>, to: Option<i64>) -> Result<()> {
    match mget_cons(backend, file, ring, from, to)? {
        Some(table) => print_table(&table),
        None => println!("{}", "No data".yellow()),
    }
    Ok(())
}

fn cmd_create_ring(
    backend: &SqliteBackend,
    file: &str,
    ring: &str,
    dur: u32,
    cap: u32,
    long: &str,
    about: &str,
) -> Result<()> {
    let h = RingHandle::open(
        backend,
        &OpenSpec {
            path: file.to_string(),
            perm: CreatePerm::default(),
            ring_name: ring.to_string(),
            long_name: long.to_string(),
            about: about.to_string(),
            slot_capacity: cap,
            duration: dur,
            create: true,
        },
    )?;
    println!(
        "{} ring {}@{} (id {})",
        "Created".green().bold(),
        ring,
        dur,
        h.ring_id()?
    );
    h.close(backend)?;
    Ok(())
}

fn cmd_destroy_ring(backend: &SqliteBackend, file: &str, ring: &str, dur: u32) -> Result<()> {
    RingHandle::destroy(backend, file, ring, dur)?;
    println!("{} ring {}@{}", "Destroyed".red().bold(), ring, dur);
    Ok(())
}

fn cmd_purge(backend: &SqliteBackend, file: &str, ring: &str, dur: u32, n: u64) -> Result<()> {
    let mut h = open_existing(backend, file, ring, dur)?;
    let purged = h.purge(backend, n)?;
    println!("Purged {} sample(s)", purged);
    h.close(backend)?;
    Ok(())
}

fn cmd_resize(backend: &SqliteBackend, file: &str, ring: &str, dur: u32, cap: u32) -> Result<()> {
    let mut h = open_existing(backend, file, ring, dur)?;
    h.resize(backend, cap)?;
    println!(
        "Resized {}@{} to capacity {}",
        ring,
        dur,
        if cap == 0 { "unbounded".to_string() } else { cap.to_string() }
    );
    h.close(backend)?;
    Ok(())
}

fn cmd_footprint(backend: &SqliteBackend, file: &str) -> Result<()> {
    let desc = backend.open(file, CreatePerm::default(), false)?;
    let bytes = backend.footprint(&desc)?;
    backend.close(desc)?;
    println!("{}: {}", "Footprint".cyan().bold(), format_bytes(bytes));
    Ok(())
}

fn cmd_watch(backend: &SqliteBackend, file: &str, ring: &str, dur: u32, interval: u64) -> Result<()> {
    if interval == 0 {
        bail!("interval must be at least 1 second");
    }
    println!(
        "{} ring {}@{} (interval: {}s, Ctrl+C to stop)",
        "Watching".cyan().bold(),
        ring,
        dur,
        interval
    );
    loop {
        let h = open_existing(backend, file, ring, dur)?;
        println!(
            "oldest={} youngest={} live={}",
            h.oldest(),
            h.youngest(),
            (h.youngest() - h.oldest() + 1).max(0)
        );
        h.close(backend)?;
        std::thread::sleep(Duration::from_secs(interval));
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
    }
}
