//! Per-run artifact files for post-mortem comparison.

use crate::extent::Extent;
use crate::reconcile::{IndexReport, ReconcileReport};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const EXPECTED_BMAP: &str = "expected_bmap.json";
pub const GOT_BMAP: &str = "got_bmap.json";
pub const BMAP_DIFF: &str = "bmap_diff.json";
pub const EXPECTED_INDEX: &str = "expected_index.txt";
pub const GOT_INDEX: &str = "got_index.txt";
pub const INDEX_DIFF: &str = "index_diff.json";

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    fs::write(path, json).with_context(|| format!("write {}", path.display()))
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fs::write(path, text).with_context(|| format!("write {}", path.display()))
}

/// Write the normalized maps and the report of an extent reconciliation.
pub fn write_bmap_artifacts(
    dir: &Path,
    expected: &BTreeMap<String, Vec<Extent>>,
    got: &BTreeMap<String, Vec<Extent>>,
    report: &ReconcileReport,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("create artifact dir {}", dir.display()))?;
    let paths = vec![dir.join(EXPECTED_BMAP), dir.join(GOT_BMAP), dir.join(BMAP_DIFF)];
    write_json(&paths[0], expected)?;
    write_json(&paths[1], got)?;
    write_json(&paths[2], report)?;
    info!(dir = %dir.display(), "wrote bmap artifacts");
    Ok(paths)
}

/// Write the sorted, normalized listings and the report of an index
/// reconciliation.
pub fn write_index_artifacts(
    dir: &Path,
    expected: &[String],
    got: &[String],
    report: &IndexReport,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("create artifact dir {}", dir.display()))?;
    let paths = vec![
        dir.join(EXPECTED_INDEX),
        dir.join(GOT_INDEX),
        dir.join(INDEX_DIFF),
    ];
    write_lines(&paths[0], expected)?;
    write_lines(&paths[1], got)?;
    write_json(&paths[2], report)?;
    info!(dir = %dir.display(), "wrote index artifacts");
    Ok(paths)
}
