//! CLI for the lanefs storage engine.
//!
//! Provides commands for listing, dumping, inspecting, and recovering lanefs
//! storage roots.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use lanefs::extent::platform_mapper;
use lanefs::{DataType, FsError, FsId, SeriesRange, TransactionalBackend};
use tracing_subscriber::EnvFilter;

/// Host name recorded on the read-only transactions this tool opens.
const CLI_HOST: &str = "lanefs-cli";

/// lanefs: Transactional lane-multiplexed time-series and blob storage CLI.
#[derive(Parser)]
#[command(name = "lanefs", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// List committed series and blob ids under a prefix.
    Ls {
        /// Path to the storage root.
        root: PathBuf,

        /// Id prefix, e.g. "/pa/target/".
        #[arg(default_value = "/")]
        prefix: String,
    },

    /// Write the contents of a blob to stdout.
    CatBlob {
        /// Path to the storage root.
        root: PathBuf,

        /// Blob id.
        id: String,
    },

    /// Print a series over a position range as a pipe string.
    Dump {
        /// Path to the storage root.
        root: PathBuf,

        /// Series id.
        id: String,

        /// First position.
        #[arg(long, default_value = "0")]
        start: i64,

        /// Last position.
        #[arg(long)]
        end: i64,

        /// Element type the series holds.
        #[arg(long, value_enum, default_value = "float")]
        data_type: TypeArg,

        /// Value printed in gap slots.
        #[arg(long, default_value = "0")]
        fill: f64,
    },

    /// Show directory hash occupancy and container extents.
    Inspect {
        /// Path to the storage root.
        root: PathBuf,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Run crash recovery and report what it did.
    Recover {
        /// Path to the storage root.
        root: PathBuf,
    },
}

/// Series element type.
#[derive(Clone, Copy, ValueEnum)]
enum TypeArg {
    /// 32-bit signed integers.
    Int,
    /// 32-bit floats.
    Float,
    /// 64-bit floats.
    Double,
}

impl From<TypeArg> for DataType {
    fn from(arg: TypeArg) -> Self {
        match arg {
            TypeArg::Int => DataType::Int,
            TypeArg::Float => DataType::Float,
            TypeArg::Double => DataType::Double,
        }
    }
}

/// Output format for inspect.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable text.
    Text,
    /// JSON object.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Ls { root, prefix } => cmd_ls(&root, &prefix),
        Commands::CatBlob { root, id } => cmd_cat_blob(&root, &id),
        Commands::Dump {
            root,
            id,
            start,
            end,
            data_type,
            fill,
        } => cmd_dump(&root, &id, start, end, data_type.into(), fill),
        Commands::Inspect { root, format } => cmd_inspect(&root, &format),
        Commands::Recover { root } => cmd_recover(&root),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        // Damaged on-disk state needs offline repair; stop before anything
        // else touches it.
        if e.downcast_ref::<FsError>().is_some_and(FsError::is_corrupt) {
            std::process::abort();
        }
        std::process::exit(1);
    }
}

/// Opens an existing storage root. Opening runs recovery.
fn open_root(root: &Path) -> Result<TransactionalBackend, Box<dyn std::error::Error>> {
    if !root.is_dir() {
        return Err(format!("No storage root at '{}'", root.display()).into());
    }
    Ok(TransactionalBackend::open(root)?)
}

/// Implements `lanefs ls <root> [prefix]`.
fn cmd_ls(root: &Path, prefix: &str) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_root(root)?;
    for id in backend.find_ids(prefix)? {
        println!("{id}");
    }
    Ok(())
}

/// Implements `lanefs cat-blob <root> <id>`.
fn cmd_cat_blob(root: &Path, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    use std::io::Write;

    let id = FsId::parse(id)?;
    let backend = open_root(root)?;
    let txn = backend.begin(CLI_HOST)?;
    let blob = backend.read_blob(txn, &id);
    backend.rollback(txn)?;
    let blob = blob?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&blob.bytes)?;
    stdout.flush()?;
    Ok(())
}

/// Implements `lanefs dump <root> <id> --start --end`.
fn cmd_dump(
    root: &Path,
    id: &str,
    start: i64,
    end: i64,
    data_type: DataType,
    fill: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = FsId::parse(id)?;
    let backend = open_root(root)?;
    let txn = backend.begin(CLI_HOST)?;
    let range = SeriesRange::new(start, end, data_type).with_fill(fill);
    let read = backend.read_time_series(txn, std::slice::from_ref(&id), range);
    backend.rollback(txn)?;

    for series in read? {
        println!("{}", series.to_pipe_string());
    }
    Ok(())
}

/// Implements `lanefs inspect <root>`.
fn cmd_inspect(root: &Path, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_root(root)?;
    let histogram = backend.container_histogram()?;
    let blob_histograms = backend.blob_histograms("/")?;
    let series_count = backend.find_series_ids("/").len();
    let blob_count = backend.find_blob_ids("/")?.len();

    let mapper = platform_mapper();
    let mut containers = Vec::new();
    for path in backend.container_files()? {
        let extents = mapper.extents_of(&path)?;
        let allocated: i64 = extents.iter().map(|e| e.end - e.start + 1).sum();
        let len = std::fs::metadata(&path)?.len();
        containers.push((path, len, extents.len(), allocated));
    }

    match format {
        OutputFormat::Text => {
            println!("Storage root: {}", root.display());
            println!("Series: {series_count}");
            println!("Blobs: {blob_count}");
            println!();
            println!("Container directory occupancy (files per leaf -> leaves):");
            for (files, leaves) in &histogram {
                println!("  {files:>6} -> {leaves}");
            }
            for (hash_root, histogram) in &blob_histograms {
                println!("Blob directory occupancy at {}:", hash_root.display());
                for (files, leaves) in histogram {
                    println!("  {files:>6} -> {leaves}");
                }
            }
            println!();
            println!("Containers: {}", containers.len());
            for (path, len, extent_count, allocated) in &containers {
                println!(
                    "  {} ({}, {extent_count} extents, {} allocated)",
                    path.display(),
                    format_bytes(*len),
                    format_bytes(u64::try_from(*allocated).unwrap_or(0)),
                );
            }
            let total_size = dir_size(root)?;
            println!();
            println!("Total disk usage: {} ({total_size} bytes)", format_bytes(total_size));
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "root": root.display().to_string(),
                "series": series_count,
                "blobs": blob_count,
                "container_histogram": histogram,
                "blob_histograms": blob_histograms
                    .iter()
                    .map(|(hash_root, h)| (hash_root.display().to_string(), h))
                    .collect::<std::collections::BTreeMap<_, _>>(),
                "containers": containers
                    .iter()
                    .map(|(path, len, extent_count, allocated)| serde_json::json!({
                        "path": path.display().to_string(),
                        "len": len,
                        "extents": extent_count,
                        "allocated": allocated,
                    }))
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Implements `lanefs recover <root>`.
fn cmd_recover(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_root(root)?;
    let report = backend.recovery_report();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

/// Recursively calculates directory size.
fn dir_size(path: &Path) -> Result<u64, Box<dyn std::error::Error>> {
    let mut total = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path)?;
            } else {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_parses_with_format() {
        let cli = Cli::try_parse_from(["lanefs", "inspect", "/tmp/store", "--format", "json"]).unwrap();
        match cli.command {
            Commands::Inspect { root, format } => {
                assert_eq!(root, PathBuf::from("/tmp/store"));
                assert!(matches!(format, OutputFormat::Json));
            }
            _ => panic!("expected inspect"),
        }
        assert!(Cli::try_parse_from(["lanefs", "stats", "/tmp/store"]).is_err());
    }

    #[test]
    fn test_dump_requires_end() {
        assert!(Cli::try_parse_from(["lanefs", "dump", "/tmp/store", "/a/b"]).is_err());
        let cli = Cli::try_parse_from(["lanefs", "dump", "/tmp/store", "/a/b", "--end", "9", "--data-type", "int"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Dump { end: 9, data_type: TypeArg::Int, .. }
        ));
    }
}
