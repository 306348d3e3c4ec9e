//! rbr: read a rekordbox USB export and report what survived

mod config;
mod discover;
mod scan;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rekordbox_core::{Database, Sidecar, Tag, TableType};

use crate::config::Config;
use crate::scan::{DatabaseDump, SidecarDump};

#[derive(Parser)]
#[command(name = "rbr")]
#[command(about = "Read rekordbox USB exports, tolerating damaged files")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// JSON file with reader options (min_page_size, max_chain_steps, strict_page_index)
    #[arg(short, long)]
    options: Option<PathBuf>,

    /// Write the full results as JSON
    #[arg(long)]
    json: Option<PathBuf>,

    /// Write the corruption log as JSON
    #[arg(long)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the database and every analysis file under an export root
    Scan {
        /// USB root, or the export.pdb itself
        root: PathBuf,
    },

    /// List the table directory
    Tables { pdb: PathBuf },

    /// List decoded tracks
    Tracks { pdb: PathBuf },

    /// Print the playlist tree
    Playlists { pdb: PathBuf },

    /// List the sections of one analysis file
    Anlz {
        file: PathBuf,

        /// Only show sections with this tag, e.g. PQTZ
        #[arg(short, long)]
        tag: Option<String>,
    },
}

#[derive(Serialize)]
struct ScanOutput<'a> {
    database: &'a DatabaseDump,
    sidecars: &'a [SidecarDump],
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Logging was already initialised");
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::new(cli.options.as_deref(), cli.json, cli.log)?;

    match cli.command {
        Commands::Scan { root } => run_scan(&root, &config),
        Commands::Tables { pdb } => run_tables(&pdb, &config),
        Commands::Tracks { pdb } => run_tracks(&pdb, &config),
        Commands::Playlists { pdb } => run_playlists(&pdb, &config),
        Commands::Anlz { file, tag } => run_anlz(&file, tag.as_deref(), &config),
    }
}

fn run_scan(root: &Path, config: &Config) -> Result<()> {
    let Some(pdb) = discover::find_database(root) else {
        bail!("no export.pdb found under {:?}", root);
    };
    let dump = scan::read_database(&pdb, config.options.clone())?;

    let sidecar_root = if root.is_dir() { root } else { pdb.parent().unwrap_or(root) };
    let sidecar_paths = discover::find_sidecars(sidecar_root);
    info!("Reading {} analysis files", sidecar_paths.len());
    let sidecars = scan::read_sidecars(&sidecar_paths);

    println!("Database: {}", dump.path.display());
    println!("  Tracks:    {}", dump.tracks.len());
    println!("  Playlists: {}", dump.playlists.len());
    println!("  History:   {}", dump.history.len());
    for (name, entries) in &dump.lookups {
        println!("  {:<10} {}", format!("{}:", name), entries.len());
    }

    let damaged = sidecars.iter().filter(|s| s.error.is_some() || !s.warnings.is_empty()).count();
    println!("Analysis files: {} ({} with problems)", sidecars.len(), damaged);

    print_report_summary(&dump);

    write_json(
        config.json_out.as_deref(),
        &ScanOutput {
            database: &dump,
            sidecars: &sidecars,
        },
    )?;
    write_json(config.log_out.as_deref(), &dump.report)?;
    Ok(())
}

fn run_tables(pdb: &Path, config: &Config) -> Result<()> {
    let db = open_database(pdb, config)?;
    println!(
        "{} pages of {} bytes, sequence {}",
        db.page_count(),
        db.page_size(),
        db.header().sequence
    );
    if db.directory_truncated() {
        warn!("Table directory runs past the first page");
    }

    println!("{:<18} {:>6} {:>6} {:>6}", "TABLE", "FIRST", "LAST", "ROWS");
    for (table, entry) in db.tables() {
        let rows = db.project(*table).value.len();
        let marker = if entry.valid { "" } else { "  (invalid)" };
        println!(
            "{:<18} {:>6} {:>6} {:>6}{}",
            table.to_string(),
            entry.first_page,
            entry.last_page,
            rows,
            marker
        );
    }

    write_json(config.json_out.as_deref(), &db.tables().values().collect::<Vec<_>>())?;
    Ok(())
}

fn run_tracks(pdb: &Path, config: &Config) -> Result<()> {
    let db = open_database(pdb, config)?;
    let tracks = db.tracks();

    for track in &tracks.value {
        println!(
            "{:>6}  {:>6.2} bpm  {:>4}s  {}",
            track.id,
            track.bpm,
            track.duration_seconds,
            track.title
        );
    }
    info!("{} tracks, {} rows skipped", tracks.value.len(), tracks.report.table(TableType::Tracks).corrupt_rows);

    write_json(config.json_out.as_deref(), &tracks.value)?;
    write_json(config.log_out.as_deref(), &tracks.report)?;
    Ok(())
}

fn run_playlists(pdb: &Path, config: &Config) -> Result<()> {
    let db = open_database(pdb, config)?;
    let tree = db.playlists();

    for (depth, node) in tree.value.iter() {
        let indent = "  ".repeat(depth);
        if node.is_folder {
            println!("{}{}/", indent, node.name);
        } else {
            println!("{}{} ({} tracks)", indent, node.name, node.entries.len());
        }
    }

    let stats = tree.report.playlists();
    if stats.corrupt_playlists > 0 || stats.reparented > 0 {
        warn!(
            "{} playlists dropped, {} moved to the root",
            stats.corrupt_playlists, stats.reparented
        );
    }

    write_json(config.json_out.as_deref(), &tree.value)?;
    write_json(config.log_out.as_deref(), &tree.report)?;
    Ok(())
}

fn run_anlz(file: &Path, tag: Option<&str>, config: &Config) -> Result<()> {
    let filter = match tag {
        Some(text) => match Tag::from_str_lossy(text) {
            Some(tag) => Some(tag),
            None => bail!("tag must be four characters, got {:?}", text),
        },
        None => None,
    };

    let sidecar = Sidecar::open_path(file).with_context(|| format!("opening analysis file {:?}", file))?;
    let map = sidecar.read_sections();

    for (tag, sections) in &map.sections {
        if filter.is_some_and(|f| f != *tag) {
            continue;
        }
        for section in sections {
            let marker = if section.truncated { "  (truncated)" } else { "" };
            println!(
                "{}  offset {:>8}  header {:>4}  length {:>8}{}",
                tag, section.offset, section.header_len, section.body_len, marker
            );
        }
    }
    for warning in &map.warnings {
        warn!("{}", warning);
    }

    write_json(config.json_out.as_deref(), &scan::read_sidecar(file))?;
    Ok(())
}

fn open_database(pdb: &Path, config: &Config) -> Result<Database> {
    Database::open_path(pdb, config.options.clone()).with_context(|| format!("opening database {:?}", pdb))
}

fn print_report_summary(dump: &DatabaseDump) {
    let report = &dump.report;
    if report.is_clean() {
        println!("No corruption found");
        return;
    }

    println!("Corruption: {} records skipped", report.corrupt_records());
    for (table, stats) in report.tables() {
        if stats.corrupt_pages == 0 && stats.corrupt_rows == 0 && !stats.partial {
            continue;
        }
        println!(
            "  {:<18} {} bad pages, {} bad rows{}",
            table.to_string(),
            stats.corrupt_pages,
            stats.corrupt_rows,
            if stats.partial { ", partial" } else { "" }
        );
    }
}

fn write_json<T: Serialize + ?Sized>(path: Option<&Path>, value: &T) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let text = serde_json::to_string_pretty(value).context("serialising output")?;
    fs::write(path, text).with_context(|| format!("writing {:?}", path))?;
    info!("Wrote {:?}", path);
    Ok(())
}
