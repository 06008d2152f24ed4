//! msg-store - Store inspector
//!
//! Opens a file store root, recovers it and prints what it holds. With
//! `--disk-only` the root is only walked for file sizes and nothing is
//! opened.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use msg_store::stats::{StatsCollector, StoreDiskStats};
use msg_store::{FileStore, FileStoreOptions, ServerInfo, Store, StoreLimits};

/// Inspect a msg-store file store root
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Root directory of the store
    root: PathBuf,

    /// JSON file with store limits to recover under (none by default)
    #[arg(short, long)]
    limits: Option<PathBuf>,

    /// JSON file with file store options
    #[arg(short, long)]
    options: Option<PathBuf>,

    /// Only show this channel
    #[arg(short, long)]
    channel: Option<String>,

    /// Report file sizes without opening the store
    #[arg(long)]
    disk_only: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct ChannelReport {
    first_seq: u64,
    last_seq: u64,
    msgs: usize,
    bytes: u64,
    subscriptions: usize,
    pending: usize,
}

#[derive(Debug, Serialize)]
struct StoreReport {
    server: Option<ServerInfo>,
    clients: Vec<String>,
    channels: BTreeMap<String, ChannelReport>,
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing with the MSG_STORE_LOG environment variable, "warn" by default.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("MSG_STORE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.disk_only {
        let stats = StatsCollector::new(&args.root).collect()?;
        print_disk_stats(&stats, args.channel.as_deref());
        return Ok(());
    }

    // Without explicit limits nothing is evicted while recovering.
    let limits = match &args.limits {
        Some(path) => Some(StoreLimits::from_json_file(path)?),
        None => None,
    };
    let options = match &args.options {
        Some(path) => FileStoreOptions::from_json_file(path)?,
        None => FileStoreOptions::default(),
    };

    if !args.root.exists() {
        return Err(format!("no store at {}", args.root.display()).into());
    }
    let mut report = StoreReport {
        server: None,
        clients: Vec::new(),
        channels: BTreeMap::new(),
    };
    let opened = FileStore::open_for_inspection(&args.root, limits.as_ref(), options)?;
    if let Some((store, recovered)) = opened {
        report.server = Some(recovered.info);
        report.clients = recovered.clients.iter().map(|c| c.id().to_string()).collect();
        for (name, subs) in &recovered.subs {
            if args.channel.as_deref().is_some_and(|c| c != name) {
                continue;
            }
            let Some(cs) = store.lookup_channel(name) else {
                continue;
            };
            let (first_seq, last_seq) = cs.msgs.first_and_last_sequence();
            let (msgs, bytes) = cs.msgs.state()?;
            report.channels.insert(
                name.clone(),
                ChannelReport {
                    first_seq,
                    last_seq,
                    msgs,
                    bytes,
                    subscriptions: subs.len(),
                    pending: subs.iter().map(|s| s.pending.len()).sum(),
                },
            );
        }
        store.close()?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &StoreReport) {
    match &report.server {
        Some(info) => println!("cluster: {}", info.cluster_id),
        None => {
            println!("empty store");
            return;
        }
    }
    println!("clients: {}", report.clients.len());
    for (name, ch) in &report.channels {
        println!(
            "{}: msgs={} ({}..{}) size={} subs={} pending={}",
            name,
            ch.msgs,
            ch.first_seq,
            ch.last_seq,
            StoreDiskStats::format_size(ch.bytes),
            ch.subscriptions,
            ch.pending
        );
    }
}

fn print_disk_stats(stats: &StoreDiskStats, only: Option<&str>) {
    println!(
        "server.dat: {}  clients.dat: {}",
        StoreDiskStats::format_size(stats.server_file_size),
        StoreDiskStats::format_size(stats.clients_file_size)
    );
    for (name, ch) in &stats.channels {
        if only.is_some_and(|c| c != name) {
            continue;
        }
        println!(
            "{}: slices={:?} data={} index={} subs={} archived={}",
            name,
            ch.slices,
            StoreDiskStats::format_size(ch.data_size),
            StoreDiskStats::format_size(ch.index_size),
            StoreDiskStats::format_size(ch.subs_size),
            ch.archived_files
        );
    }
    println!("total: {}", StoreDiskStats::format_size(stats.total_size()));
}
