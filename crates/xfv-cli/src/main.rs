#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use xfv_core::{GroupReport, InspectReport, OpenOptions, XfsImage};
use xfv_error::XfvError;
use xfv_ondisk::{InodeLocation, XfsSuperblock};
use xfv_types::{InodeNumber, InodeParts, magic_as_text};

/// Exit status when at least one allocation group failed to decode.
const EXIT_GROUP_FAILURES: i32 = 2;

#[derive(Parser)]
#[command(name = "xfv", about = "Decode XFS superblock and AGI metadata from a raw device")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the superblock and the AGI of every allocation group.
    Inspect {
        device: PathBuf,
        #[arg(long)]
        json: bool,
        /// Reject superblocks with inconsistent geometry.
        #[arg(long)]
        strict: bool,
    },
    /// Decode an inode number (decimal or 0x-prefixed hex).
    Ino {
        #[arg(value_parser = parse_inode_number)]
        inode: u64,
        /// Also locate the inode using this device's geometry.
        #[arg(long)]
        device: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<XfvError>())
                .map_or(1, XfvError::exit_code);
            std::process::exit(code);
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

fn run() -> Result<i32> {
    match Cli::parse().command {
        Command::Inspect {
            device,
            json,
            strict,
        } => inspect(&device, json, strict),
        Command::Ino {
            inode,
            device,
            json,
        } => ino(inode, device.as_deref(), json),
    }
}

fn parse_inode_number(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|err| format!("invalid inode number {raw:?}: {err}"))
}

// ── inspect ─────────────────────────────────────────────────────────────────

fn inspect(device: &Path, json: bool, strict: bool) -> Result<i32> {
    let options = if strict {
        OpenOptions::strict()
    } else {
        OpenOptions::default()
    };
    let image = XfsImage::open_with_options(device, &options)
        .with_context(|| format!("failed to open {}", device.display()))?;
    info!(device = %device.display(), agcount = image.agcount(), "decoding allocation groups");
    let report = image.inspect();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize inspect report")?
        );
    } else {
        for line in render_report(&report) {
            println!("{line}");
        }
    }

    let failed = report.failed_groups();
    if failed > 0 {
        eprintln!("{failed} of {} allocation groups failed to decode", report.groups.len());
        return Ok(EXIT_GROUP_FAILURES);
    }
    Ok(0)
}

fn render_report(report: &InspectReport) -> Vec<String> {
    let mut lines = render_superblock(&report.superblock);
    for group in &report.groups {
        lines.push(String::new());
        lines.extend(render_group(group));
    }
    lines
}

fn render_superblock(sb: &XfsSuperblock) -> Vec<String> {
    let root = sb.root_inode().decode();
    vec![
        "superblock".to_owned(),
        format!("  magic:          0x{:08X} ({})", sb.magicnum, magic_as_text(sb.magicnum)),
        format!("  version:        {} (versionnum 0x{:04X})", sb.version(), sb.versionnum),
        format!("  block size:     {}", sb.blocksize),
        format!("  sector size:    {}", sb.sectsize),
        format!("  inode size:     {}", sb.inodesize),
        format!("  data blocks:    {}", sb.dblocks),
        format!("  ag count:       {}", sb.agcount),
        format!("  ag blocks:      {}", sb.agblocks),
        format!("  root inode:     {} {root}", sb.rootino),
        format!("  uuid:           {}", sb.uuid_string()),
        format!("  label:          {}", sb.label()),
        format!("  free blocks:    {}", sb.fdblocks),
        format!(
            "  inodes:         {} allocated, {} free, {} used",
            sb.icount,
            sb.ifree,
            sb.used_inodes()
        ),
        format!("  crc:            0x{:08X}", sb.crc),
        format!("  ro_compat:      {}", sb.features_ro_compat),
        format!("  incompat:       {}", sb.features_incompat),
    ]
}

fn render_group(group: &GroupReport) -> Vec<String> {
    let offset = group
        .offset
        .map_or_else(|| "?".to_owned(), |off| off.to_string());
    let mut lines = vec![format!("agi {} @ {offset}", group.agno)];
    if let Some(err) = &group.error {
        lines.push(format!("  error: {err}"));
        return lines;
    }
    let Some(agi) = &group.agi else {
        return lines;
    };
    lines.push(format!("  magic:      0x{:08X} ({})", agi.magicnum, magic_as_text(agi.magicnum)));
    lines.push(format!("  seqno:      {}", agi.seqno));
    lines.push(format!("  length:     {}", agi.length));
    lines.push(format!(
        "  inodes:     {} allocated, {} free",
        agi.count, agi.freecount
    ));
    lines.push(format!("  inobt:      root {} level {}", agi.root, agi.level));
    lines.push(format!(
        "  finobt:     root {} level {}",
        agi.free_root, agi.free_level
    ));
    for (bucket, head) in agi.unlinked_heads() {
        lines.push(format!("  unlinked[{bucket}]: {head}"));
    }
    lines.push(format!("  crc:        0x{:08X}", agi.crc));
    lines
}

// ── ino ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InoOutput {
    inode: u64,
    fixed: InodeParts,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<InodeLocation>,
}

fn ino(inode: u64, device: Option<&Path>, json: bool) -> Result<i32> {
    let number = InodeNumber(inode);
    let location = match device {
        Some(path) => {
            let image = XfsImage::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            Some(image.locate_inode(number)?)
        }
        None => None,
    };
    let output = InoOutput {
        inode,
        fixed: number.decode(),
        location,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize inode output")?
        );
    } else {
        for line in render_ino(&output) {
            println!("{line}");
        }
    }
    Ok(0)
}

fn render_ino(output: &InoOutput) -> Vec<String> {
    let mut lines = vec![
        format!("inode {} (0x{:X})", output.inode, output.inode),
        format!("  fixed layout:  {}", output.fixed),
    ];
    if let Some(loc) = &output.location {
        lines.push(format!(
            "  geometry:      ag {} block {} slot {} at byte {}",
            loc.agno, loc.agbno, loc.slot, loc.byte_offset.0
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfv_ondisk::XfsAgi;
    use xfv_types::{ByteOffset, XFS_SB_MAGIC};

    #[test]
    fn parses_decimal_and_hex_inode_numbers() {
        assert_eq!(parse_inode_number("128"), Ok(128));
        assert_eq!(parse_inode_number("0x80"), Ok(128));
        assert_eq!(parse_inode_number("0X100000000"), Ok(1 << 32));
        assert!(parse_inode_number("-1").is_err());
        assert!(parse_inode_number("0xZZ").is_err());
    }

    #[test]
    fn cli_parses_inspect_flags() {
        let cli = Cli::try_parse_from(["xfv", "inspect", "/dev/sdb", "--json", "--strict"])
            .expect("parse");
        match cli.command {
            Command::Inspect {
                device,
                json,
                strict,
            } => {
                assert_eq!(device, PathBuf::from("/dev/sdb"));
                assert!(json);
                assert!(strict);
            }
            Command::Ino { .. } => panic!("expected inspect"),
        }
    }

    #[test]
    fn cli_parses_ino_with_device() {
        let cli = Cli::try_parse_from(["xfv", "ino", "0x80", "--device", "img"]).expect("parse");
        match cli.command {
            Command::Ino { inode, device, json } => {
                assert_eq!(inode, 128);
                assert_eq!(device, Some(PathBuf::from("img")));
                assert!(!json);
            }
            Command::Inspect { .. } => panic!("expected ino"),
        }
    }

    #[test]
    fn cli_rejects_missing_device() {
        assert!(Cli::try_parse_from(["xfv", "inspect"]).is_err());
    }

    #[test]
    fn superblock_rendering_shows_magic_and_root_parts() {
        let sb = XfsSuperblock {
            magicnum: XFS_SB_MAGIC,
            rootino: 128,
            blocksize: 4096,
            ..XfsSuperblock::default()
        };
        let lines = render_superblock(&sb);
        assert!(lines.iter().any(|l| l.contains("0x58465342 (XFSB)")));
        assert!(lines.iter().any(|l| l.contains("128 (ag=0, block=0, slot=128)")));
        assert!(lines.iter().any(|l| l.contains("block size:     4096")));
    }

    #[test]
    fn failed_group_renders_error_only() {
        let group = GroupReport {
            agno: 3,
            offset: Some(1024),
            agi: None,
            error: Some("bad magic".to_owned()),
        };
        assert_eq!(
            render_group(&group),
            vec!["agi 3 @ 1024".to_owned(), "  error: bad magic".to_owned()]
        );
    }

    #[test]
    fn decoded_group_lists_only_live_unlinked_buckets() {
        let mut agi = XfsAgi {
            seqno: 1,
            count: 64,
            freecount: 61,
            ..XfsAgi::default()
        };
        agi.unlinked[5] = 0x83;
        let group = GroupReport {
            agno: 1,
            offset: Some(1024),
            agi: Some(agi),
            error: None,
        };
        let lines = render_group(&group);
        assert!(lines.contains(&"  unlinked[5]: 131".to_owned()));
        assert_eq!(lines.iter().filter(|l| l.contains("unlinked[")).count(), 1);
        assert!(lines.iter().any(|l| l.contains("64 allocated, 61 free")));
    }

    #[test]
    fn ino_rendering_includes_geometry_when_present() {
        let output = InoOutput {
            inode: 128,
            fixed: InodeNumber(128).decode(),
            location: Some(InodeLocation {
                agno: 0,
                agbno: 16,
                slot: 0,
                byte_offset: ByteOffset(65536),
            }),
        };
        let lines = render_ino(&output);
        assert_eq!(lines[0], "inode 128 (0x80)");
        assert_eq!(lines[1], "  fixed layout:  (ag=0, block=0, slot=128)");
        assert!(lines[2].contains("ag 0 block 16 slot 0 at byte 65536"));
    }
}
