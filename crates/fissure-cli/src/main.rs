//! fissure - Crack binary files into declarative data models
//!
//! This tool reads a TOML model description, cracks each input file into
//! it and prints the resulting element tree, event trace or bit positions.

mod model;
mod render;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, ValueEnum};
use fissure_core::{BitStream, Cracker, CrackerConfig, EventLog};
use model::ElementDef;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Crack binary files into declarative data models
#[derive(Parser, Debug)]
#[command(name = "fissure")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    input: InputMode,

    /// TOML description of the data model
    #[arg(short, long)]
    model: PathBuf,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(long, value_enum, default_value = "tree")]
    format: OutputFormat,

    /// Maximum number of inputs to crack in directory mode (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_inputs: usize,

    /// Maximum element nesting depth while cracking
    #[arg(long, default_value = "256")]
    max_depth: usize,

    /// Maximum number of instances per array
    #[arg(long, default_value = "65536")]
    max_array_items: u64,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputMode {
    /// Path to a single file to crack
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to a directory of files to crack
    #[arg(short, long)]
    directory: Option<PathBuf>,
}

/// What to print for each cracked input
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Indented element tree with bit ranges and values
    Tree,
    /// Entered/exited/failed/placed notifications in order
    Events,
    /// One row per entered element: name, begin, end, size
    Positions,
}

/// Tracks inputs already cracked, by content
#[derive(Default)]
struct InputRegistry {
    /// Content hashes of inputs seen so far
    seen: HashSet<String>,
    /// Statistics
    stats: RegistryStats,
}

#[derive(Default)]
struct RegistryStats {
    cracked: usize,
    failed: usize,
    duplicates_skipped: usize,
}

impl InputRegistry {
    fn new() -> Self {
        Self::default()
    }

    /// Compute a short hash of the content (first 16 chars of blake3)
    fn content_hash(content: &[u8]) -> String {
        let hash = blake3::hash(content);
        hash.to_hex()[..16].to_string()
    }

    /// Records `content_hash`, returning false if it was already seen
    fn register(&mut self, content_hash: &str) -> bool {
        if !self.seen.insert(content_hash.to_string()) {
            debug!("Skipping duplicate input (hash: {})", content_hash);
            self.stats.duplicates_skipped += 1;
            return false;
        }
        true
    }

    fn print_summary(&self) {
        info!(
            "Summary: {} cracked, {} failed, {} duplicates skipped",
            self.stats.cracked, self.stats.failed, self.stats.duplicates_skipped
        );
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    let def = ElementDef::load(&cli.model)?;
    debug!("Loaded model '{}' from {}", def.name, cli.model.display());

    // Dispatch based on input mode
    if let Some(ref file) = cli.input.file {
        process_single_file(&cli, &def, file)
    } else if let Some(ref directory) = cli.input.directory {
        process_directory(&cli, &def, directory)
    } else {
        bail!("Either --file or --directory must be specified")
    }
}

/// Crack a single file
fn process_single_file(cli: &Cli, def: &ElementDef, file: &Path) -> Result<()> {
    if !file.exists() {
        bail!("Input file does not exist: {}", file.display());
    }
    if !file.is_file() {
        bail!("Input path is not a file: {}", file.display());
    }

    let mut registry = InputRegistry::new();
    let output = process_input(cli, def, file, &mut registry)?;
    if let Some(output) = output {
        print!("{}", output);
    }
    registry.print_summary();

    Ok(())
}

/// Crack every file under a directory recursively
fn process_directory(cli: &Cli, def: &ElementDef, directory: &Path) -> Result<()> {
    if !directory.exists() {
        bail!("Directory does not exist: {}", directory.display());
    }
    if !directory.is_dir() {
        bail!("Path is not a directory: {}", directory.display());
    }

    info!("Scanning directory: {}", directory.display());

    let mut registry = InputRegistry::new();
    let mut inputs_processed = 0;

    for path in collect_inputs(directory) {
        if cli.max_inputs > 0 && inputs_processed >= cli.max_inputs {
            info!("Reached the limit of {} inputs", cli.max_inputs);
            break;
        }

        debug!("Processing input: {}", path.display());
        match process_input(cli, def, &path, &mut registry) {
            Ok(Some(output)) => {
                println!("==> {}", path.display());
                print!("{}", output);
            }
            Ok(None) => {}
            // Log error but continue with other files
            Err(e) => warn!("Error processing {}: {:#}", path.display(), e),
        }
        inputs_processed += 1;
    }

    info!("Processed {} inputs", inputs_processed);
    registry.print_summary();

    Ok(())
}

/// Regular, non-hidden files under `directory` in walk order
fn collect_inputs(directory: &Path) -> Vec<PathBuf> {
    WalkDir::new(directory)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|path| path.is_file())
        .filter(|path| {
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false);
            if hidden {
                trace!("Skipping hidden file: {}", path.display());
            }
            !hidden
        })
        .collect()
}

/// Cracks one input and renders it, or returns `None` for a duplicate
fn process_input(
    cli: &Cli,
    def: &ElementDef,
    path: &Path,
    registry: &mut InputRegistry,
) -> Result<Option<String>> {
    trace!("Reading {}", path.display());
    let data =
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?;

    trace!("Read {} bytes from {}", data.len(), path.display());

    if !registry.register(&InputRegistry::content_hash(&data)) {
        return Ok(None);
    }

    let mut model = def.build()?;
    let root = model.root();
    let config = CrackerConfig::new()
        .max_depth(cli.max_depth)
        .max_array_items(cli.max_array_items);
    let mut cracker = Cracker::with_config(config);
    let mut log = EventLog::new();
    let mut stream = BitStream::new(&data);

    if let Err(e) = cracker.crack_with(&mut model, root, &mut stream, &mut log) {
        registry.stats.failed += 1;
        return Err(e).with_context(|| format!("Failed to crack: {}", path.display()));
    }
    registry.stats.cracked += 1;

    if stream.remaining_bits() > 0 {
        debug!(
            "{} bits left over after cracking {}",
            stream.remaining_bits(),
            path.display()
        );
    }

    let output = match cli.format {
        OutputFormat::Tree => render::tree(&model, cracker.positions()),
        OutputFormat::Events => render::events(&model, log.events()),
        OutputFormat::Positions => render::positions(&model, cracker.positions()),
    };

    Ok(Some(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MODEL: &str = r#"
name = "Record"
kind = "block"

[[children]]
name = "len"
kind = "number"
bits = 8
relations = [{ kind = "size", of = "body" }]

[[children]]
name = "body"
kind = "string"
"#;

    fn cli_for(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("fissure").chain(args.iter().copied()))
    }

    #[test]
    fn test_input_registry_deduplication() {
        let mut registry = InputRegistry::new();
        let hash = InputRegistry::content_hash(b"\x03abc");

        assert!(registry.register(&hash));
        assert!(!registry.register(&hash));
        assert!(registry.register(&InputRegistry::content_hash(b"\x03abd")));

        assert_eq!(registry.stats.duplicates_skipped, 1);
    }

    #[test]
    fn test_content_hash() {
        let hash1 = InputRegistry::content_hash(b"hello");
        let hash2 = InputRegistry::content_hash(b"hello");
        let hash3 = InputRegistry::content_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_process_input() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("record.bin");
        fs::write(&input, b"\x02hi").unwrap();

        let cli = cli_for(&["--model", "m.toml", "--file", "record.bin"]);
        let def = ElementDef::parse(MODEL).unwrap();
        let mut registry = InputRegistry::new();

        let output = process_input(&cli, &def, &input, &mut registry)
            .unwrap()
            .unwrap();
        assert!(output.contains("body string [8..24]"));
        assert_eq!(registry.stats.cracked, 1);

        // Same bytes again are skipped
        let again = process_input(&cli, &def, &input, &mut registry).unwrap();
        assert!(again.is_none());
        assert_eq!(registry.stats.duplicates_skipped, 1);
    }

    #[test]
    fn test_process_input_failure_counted() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("short.bin");
        fs::write(&input, b"\x09hi").unwrap();

        let cli = cli_for(&["--model", "m.toml", "--file", "short.bin"]);
        let def = ElementDef::parse(MODEL).unwrap();
        let mut registry = InputRegistry::new();

        assert!(process_input(&cli, &def, &input, &mut registry).is_err());
        assert_eq!(registry.stats.failed, 1);
        assert_eq!(registry.stats.cracked, 0);
    }

    #[test]
    fn test_collect_inputs_skips_hidden() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("nested")).unwrap();
        fs::write(temp_dir.path().join("a.bin"), b"a").unwrap();
        fs::write(temp_dir.path().join(".hidden"), b"h").unwrap();
        fs::write(temp_dir.path().join("nested").join("b.bin"), b"b").unwrap();

        let inputs = collect_inputs(temp_dir.path());
        let names: Vec<_> = inputs
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["a.bin", "b.bin"]);
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
