#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use xfv_error::{EXIT_MISMATCH, XfvError};
use xfv_harness::{
    DEFAULT_EXTENT_TOOL, ExtentTool, ReconcileOptions, SnapshotOptions, SubjectMode,
    SystemCommandRunner, artifacts, build_reference_map, extract_agi, extract_region,
    extract_superblock, list_paths, load_snapshot, normalize_extent_map, normalize_index,
    parse_subject_bmap, parse_subject_index, reconcile_extent_maps, reconcile_index,
    run_subject_tool, save_snapshot, validate_agi_fixture, validate_superblock_fixture,
};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "xfv-harness",
    about = "xfv harness: extent reconciliation and fixture management"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record inode and extents of every regular file under a mountpoint.
    Snapshot {
        #[arg(long)]
        mountpoint: PathBuf,
        /// Write the JSON snapshot here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Reference extent tool.
        #[arg(long, env = "XFV_EXTENT_TOOL", default_value = DEFAULT_EXTENT_TOOL)]
        tool: String,
    },
    /// Compare a reference snapshot with the subject tool's bmap listing.
    ReconcileBmap {
        /// Snapshot written by `snapshot`.
        #[arg(long)]
        reference: PathBuf,
        /// Prefix stripped from reference paths.
        #[arg(long)]
        mountpoint: String,
        /// Prefix stripped from subject paths.
        #[arg(long)]
        device: String,
        #[command(flatten)]
        subject: SubjectSource,
        /// Directory for expected/got/diff artifacts.
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
    /// Compare a find-style listing of the mountpoint with the subject's.
    ReconcileIndex {
        #[arg(long)]
        mountpoint: PathBuf,
        #[arg(long)]
        device: String,
        #[command(flatten)]
        subject: SubjectSource,
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
    /// Extract a sparse JSON fixture from an XFS image.
    GenerateFixture {
        image: PathBuf,
        #[command(subcommand)]
        kind: Option<FixtureKind>,
    },
    /// Parse every fixture in a directory.
    CheckFixtures {
        #[arg(long, default_value = "conformance/fixtures")]
        dir: PathBuf,
    },
}

#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct SubjectSource {
    /// Captured subject output.
    #[arg(long)]
    subject_output: Option<PathBuf>,
    /// Subject program, run as `<prog> --bmap|--find <device>`.
    #[arg(long, env = "XFV_SUBJECT_TOOL")]
    subject_tool: Option<String>,
}

#[derive(Subcommand, Clone)]
enum FixtureKind {
    /// The primary superblock (default).
    Superblock,
    /// The AGI of one allocation group.
    Agi { index: u32 },
    /// An arbitrary byte range.
    Region { offset: usize, len: usize },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("XFV_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Exit code of the first `XfvError` in the chain, 1 otherwise.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<XfvError>())
        .map_or(1, XfvError::exit_code)
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Snapshot {
            mountpoint,
            output,
            tool,
        } => snapshot(
            &mountpoint,
            output.as_deref(),
            &SnapshotOptions { extent_tool: tool },
        ),
        Command::ReconcileBmap {
            reference,
            mountpoint,
            device,
            subject,
            artifacts,
        } => reconcile_bmap(
            &reference,
            &ReconcileOptions::new(mountpoint, device),
            &subject,
            artifacts.as_deref(),
        ),
        Command::ReconcileIndex {
            mountpoint,
            device,
            subject,
            artifacts,
        } => {
            let root = std::path::absolute(&mountpoint)
                .with_context(|| format!("resolve {}", mountpoint.display()))?;
            reconcile_listing(
                &root,
                &ReconcileOptions::new(root.to_string_lossy(), device),
                &subject,
                artifacts.as_deref(),
            )
        }
        Command::GenerateFixture { image, kind } => generate_fixture(&image, kind),
        Command::CheckFixtures { dir } => check_fixtures(&dir),
    }
}

fn snapshot(mountpoint: &Path, output: Option<&Path>, options: &SnapshotOptions) -> Result<i32> {
    let tool = ExtentTool::system(options.extent_tool.as_str());
    let map = build_reference_map(mountpoint, &tool)
        .with_context(|| format!("snapshot {}", mountpoint.display()))?;
    match output {
        Some(path) => {
            save_snapshot(&map, path).with_context(|| format!("write {}", path.display()))?;
        }
        None => println!("{}", serde_json::to_string_pretty(&map)?),
    }
    Ok(0)
}

/// Subject listing text, read from a capture or produced by running the tool.
fn subject_text(source: &SubjectSource, mode: SubjectMode, device: &str) -> Result<String> {
    if let Some(path) = &source.subject_output {
        return fs::read_to_string(path).with_context(|| format!("read {}", path.display()));
    }
    let Some(program) = &source.subject_tool else {
        bail!("one of --subject-output or --subject-tool is required");
    };
    run_subject_tool(&SystemCommandRunner, program, mode, device)
        .with_context(|| format!("run {program} {} {device}", mode.flag()))
}

fn reconcile_bmap(
    reference: &Path,
    options: &ReconcileOptions,
    source: &SubjectSource,
    artifacts_dir: Option<&Path>,
) -> Result<i32> {
    let reference_map = load_snapshot(reference)?;
    let text = subject_text(source, SubjectMode::Bmap, &options.device)?;
    let subject_map = parse_subject_bmap(&text)?;

    let report = reconcile_extent_maps(&reference_map, &subject_map, options);

    if let Some(dir) = artifacts_dir {
        let expected = normalize_extent_map(&reference_map, &options.mountpoint);
        let got = normalize_extent_map(&subject_map, &options.device);
        artifacts::write_bmap_artifacts(dir, &expected.files, &got.files, &report)?;
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.passed { 0 } else { EXIT_MISMATCH })
}

fn reconcile_listing(
    mountpoint: &Path,
    options: &ReconcileOptions,
    source: &SubjectSource,
    artifacts_dir: Option<&Path>,
) -> Result<i32> {
    let reference = list_paths(mountpoint)
        .with_context(|| format!("list {}", mountpoint.display()))?;
    let text = subject_text(source, SubjectMode::Find, &options.device)?;
    let subject = parse_subject_index(&text);

    let report = reconcile_index(&reference, &subject, options);

    if let Some(dir) = artifacts_dir {
        let expected = normalize_index(&reference, &options.mountpoint);
        let got = normalize_index(&subject, &options.device);
        artifacts::write_index_artifacts(dir, &expected, &got, &report)?;
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.passed { 0 } else { EXIT_MISMATCH })
}

fn generate_fixture(image_path: &Path, kind: Option<FixtureKind>) -> Result<i32> {
    let image =
        fs::read(image_path).with_context(|| format!("failed to read {}", image_path.display()))?;
    let fixture = match kind.unwrap_or(FixtureKind::Superblock) {
        FixtureKind::Superblock => extract_superblock(&image)?,
        FixtureKind::Agi { index } => extract_agi(&image, index)?,
        FixtureKind::Region { offset, len } => extract_region(&image, offset, len)?,
    };
    println!("{}", serde_json::to_string_pretty(&fixture)?);
    Ok(0)
}

/// Fixtures are recognised by name: `*superblock*.json` and `*agi*.json`.
fn check_fixtures(dir: &Path) -> Result<i32> {
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    paths.sort();

    let mut checked = 0_usize;
    for path in paths {
        let Some(name) = path.file_name().and_then(OsStr::to_str) else {
            continue;
        };
        if !name.ends_with(".json") {
            continue;
        }
        if name.contains("superblock") {
            let sb = validate_superblock_fixture(&path)?;
            println!(
                "{name}: blocksize={} agcount={} label={}",
                sb.blocksize,
                sb.agcount,
                sb.label()
            );
            checked += 1;
        } else if name.contains("agi") {
            let agi = validate_agi_fixture(&path)?;
            println!("{name}: seqno={} count={} free={}", agi.seqno, agi.count, agi.freecount);
            checked += 1;
        }
    }
    if checked == 0 {
        bail!("no fixtures found in {}", dir.display());
    }
    Ok(0)
}
