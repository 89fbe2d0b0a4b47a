#![forbid(unsafe_code)]
//! Extent reconciliation and fixture tooling for xfv.
//!
//! The reconciler snapshots a mounted tree with the reference extent tool,
//! parses the subject tool's listings and diffs the two after stripping the
//! mountpoint and device prefixes. The fixture helpers load and produce the
//! sparse JSON images under `conformance/fixtures/`.

pub mod artifacts;
pub mod command;
pub mod extent;
pub mod reconcile;
pub mod snapshot;
pub mod subject;

pub use command::{CommandOutput, CommandRunner, SystemCommandRunner, command_available};
pub use extent::{DEFAULT_EXTENT_TOOL, Extent, ExtentTool, parse_bmap_line, parse_bmap_output};
pub use reconcile::{
    ExtentMismatch, IndexMismatch, IndexReport, NormalizedExtents, PathCollision,
    ReconcileOptions, ReconcileReport, diff_extent_maps, diff_index, normalize_extent_map, normalize_index, normalize_path,
    reconcile_extent_maps, reconcile_index,
};
pub use snapshot::{
    ExtentMap, FileExtents, SnapshotOptions, build_reference_map, list_paths, load_snapshot,
    parse_snapshot, save_snapshot,
};
pub use subject::{SubjectMode, parse_subject_bmap, parse_subject_index, run_subject_tool};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use xfv_ondisk::{XfsAgi, XfsSuperblock};
use xfv_types::{AgNumber, XFS_AGI_SIZE, XFS_SB_SIZE};

// ── Sparse fixtures ─────────────────────────────────────────────────────────

/// A byte image stored as its length plus the non-zero runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseFixture {
    pub size: usize,
    pub writes: Vec<FixtureWrite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureWrite {
    pub offset: usize,
    pub hex: String,
}

/// Zero runs shorter than this stay inside a single write.
const FIXTURE_GAP: usize = 8;

pub fn load_sparse_fixture(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let fixture: SparseFixture = serde_json::from_str(&text)
        .with_context(|| format!("invalid fixture json {}", path.display()))?;
    materialize_fixture(&fixture)
}

/// Expand a sparse fixture into its full byte image.
pub fn materialize_fixture(fixture: &SparseFixture) -> Result<Vec<u8>> {
    let mut bytes = vec![0_u8; fixture.size];
    for write in &fixture.writes {
        let payload = hex::decode(&write.hex)
            .with_context(|| format!("invalid hex at offset {}", write.offset))?;

        let end = write
            .offset
            .checked_add(payload.len())
            .context("fixture offset overflow")?;
        if end > bytes.len() {
            bail!(
                "fixture write out of bounds: offset={} payload={} size={}",
                write.offset,
                payload.len(),
                bytes.len()
            );
        }

        bytes[write.offset..end].copy_from_slice(&payload);
    }

    Ok(bytes)
}

pub fn validate_superblock_fixture(path: &Path) -> Result<XfsSuperblock> {
    let data = load_sparse_fixture(path)?;
    XfsSuperblock::parse(&data)
        .with_context(|| format!("failed superblock parse for fixture {}", path.display()))
}

pub fn validate_agi_fixture(path: &Path) -> Result<XfsAgi> {
    let data = load_sparse_fixture(path)?;
    XfsAgi::parse(&data).with_context(|| format!("failed AGI parse for fixture {}", path.display()))
}

/// Capture `len` bytes at `offset` of `image` as a fixture rooted at 0.
pub fn extract_region(image: &[u8], offset: usize, len: usize) -> Result<SparseFixture> {
    let end = offset.checked_add(len).context("region overflow")?;
    if end > image.len() {
        bail!(
            "region out of bounds: offset={offset} len={len} image={}",
            image.len()
        );
    }
    let region = &image[offset..end];

    let mut writes = Vec::new();
    let mut pos = 0;
    while pos < region.len() {
        if region[pos] == 0 {
            pos += 1;
            continue;
        }
        let start = pos;
        let mut last_nonzero = pos;
        while pos < region.len() && pos - last_nonzero <= FIXTURE_GAP {
            if region[pos] != 0 {
                last_nonzero = pos;
            }
            pos += 1;
        }
        writes.push(FixtureWrite {
            offset: start,
            hex: hex::encode(&region[start..=last_nonzero]),
        });
        pos = last_nonzero + 1;
    }

    Ok(SparseFixture { size: len, writes })
}

/// Fixture of the primary superblock. Fails unless the bytes decode.
pub fn extract_superblock(image: &[u8]) -> Result<SparseFixture> {
    XfsSuperblock::parse(image).context("image does not start with an XFS superblock")?;
    extract_region(image, 0, XFS_SB_SIZE)
}

/// Fixture of allocation group `agno`'s AGI. Fails unless the bytes decode.
pub fn extract_agi(image: &[u8], agno: u32) -> Result<SparseFixture> {
    let sb = XfsSuperblock::parse(image).context("image does not start with an XFS superblock")?;
    if agno >= sb.agcount {
        bail!("allocation group {agno} out of range (agcount={})", sb.agcount);
    }
    let offset = sb
        .agi_offset(AgNumber(agno))
        .context("AGI offset overflows")?
        .to_usize()
        .context("AGI offset does not fit in memory")?;
    let fixture = extract_region(image, offset, XFS_AGI_SIZE)?;
    let agi = XfsAgi::parse(&materialize_fixture(&fixture)?)
        .with_context(|| format!("AGI {agno} does not decode"))?;
    if agi.validate_seqno(AgNumber(agno)).is_err() {
        bail!("AGI {agno} carries seqno {}", agi.seqno);
    }
    Ok(fixture)
}
