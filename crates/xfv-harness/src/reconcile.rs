//! Reference vs. subject reconciliation for extent maps and path indexes.

use crate::extent::Extent;
use crate::snapshot::ExtentMap;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Prefixes stripped from each side before comparing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Prefix of reference paths, normally the mountpoint.
    pub mountpoint: String,
    /// Prefix of subject paths, normally the device identifier.
    pub device: String,
}

impl ReconcileOptions {
    pub fn new(mountpoint: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            device: device.into(),
        }
    }
}

/// Strip `prefix` from `path` and return it rooted at a single `/`.
///
/// The prefix only matches at a component boundary, so `/mnt` strips
/// `/mnt/a` but not `/mnt2/a`. A trailing `/` on the prefix is ignored and
/// the prefix itself normalizes to `/`.
#[must_use]
pub fn normalize_path(path: &str, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let rest = if prefix.is_empty() {
        path
    } else if path == prefix {
        ""
    } else {
        path.strip_prefix(prefix)
            .filter(|rest| rest.starts_with('/'))
            .unwrap_or(path)
    };
    format!("/{}", rest.trim_start_matches('/'))
}

/// An extent map re-keyed by normalized path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedExtents {
    pub files: BTreeMap<String, Vec<Extent>>,
    /// Entries whose normalized path was already taken by an earlier key.
    pub collisions: Vec<PathCollision>,
}

impl NormalizedExtents {
    /// Raw entries, colliding ones included.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.files.len() + self.collisions.len()
    }
}

/// A raw path that normalized onto a path already in the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathCollision {
    pub raw: String,
    pub normalized: String,
    pub extents: Vec<Extent>,
}

/// Drop inode numbers and re-key by normalized path.
///
/// Raw keys are visited in sorted order and the first one to claim a
/// normalized path keeps it. Later claimants are kept aside in
/// `collisions` rather than overwriting.
#[must_use]
pub fn normalize_extent_map(map: &ExtentMap, prefix: &str) -> NormalizedExtents {
    let mut out = NormalizedExtents::default();
    for (raw, file) in map {
        match out.files.entry(normalize_path(raw, prefix)) {
            Entry::Vacant(slot) => {
                slot.insert(file.extents.clone());
            }
            Entry::Occupied(slot) => {
                warn!(raw = %raw, path = %slot.key(), "paths collide after prefix stripping");
                out.collisions.push(PathCollision {
                    raw: raw.clone(),
                    normalized: slot.key().clone(),
                    extents: file.extents.clone(),
                });
            }
        }
    }
    out
}

/// One path whose extents differ. `None` means the side has no such path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentMismatch {
    pub path: String,
    pub expected: Option<Vec<Extent>>,
    pub got: Option<Vec<Extent>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub files_expected: usize,
    pub files_got: usize,
    pub mismatches: Vec<ExtentMismatch>,
    pub passed: bool,
}

/// Compare two normalized maps: identical key sets and identical ordered
/// extent lists per key. Every difference is collected.
#[must_use]
pub fn diff_extent_maps(
    expected: &BTreeMap<String, Vec<Extent>>,
    got: &BTreeMap<String, Vec<Extent>>,
) -> ReconcileReport {
    let keys: BTreeSet<&String> = expected.keys().chain(got.keys()).collect();
    let mismatches: Vec<ExtentMismatch> = keys
        .into_iter()
        .filter_map(|path| {
            let e = expected.get(path);
            let g = got.get(path);
            (e != g).then(|| ExtentMismatch {
                path: path.clone(),
                expected: e.cloned(),
                got: g.cloned(),
            })
        })
        .collect();

    for m in &mismatches {
        warn!(path = %m.path, expected = ?m.expected, got = ?m.got, "extent mismatch");
    }

    ReconcileReport {
        files_expected: expected.len(),
        files_got: got.len(),
        passed: mismatches.is_empty(),
        mismatches,
    }
}

/// Normalize both maps with `options` and diff them. Inode numbers are ignored.
///
/// A key that collides with another after normalization is always a
/// mismatch, reported under its raw path.
#[must_use]
pub fn reconcile_extent_maps(
    reference: &ExtentMap,
    subject: &ExtentMap,
    options: &ReconcileOptions,
) -> ReconcileReport {
    let expected = normalize_extent_map(reference, &options.mountpoint);
    let got = normalize_extent_map(subject, &options.device);
    let mut report = diff_extent_maps(&expected.files, &got.files);

    for c in &expected.collisions {
        report.mismatches.push(ExtentMismatch {
            path: c.raw.clone(),
            expected: Some(c.extents.clone()),
            got: got.files.get(&c.normalized).cloned(),
        });
    }
    for c in &got.collisions {
        report.mismatches.push(ExtentMismatch {
            path: c.raw.clone(),
            expected: expected.files.get(&c.normalized).cloned(),
            got: Some(c.extents.clone()),
        });
    }
    report.files_expected = expected.entry_count();
    report.files_got = got.entry_count();
    report.passed = report.mismatches.is_empty();

    info!(
        files_expected = report.files_expected,
        files_got = report.files_got,
        mismatches = report.mismatches.len(),
        "extent reconciliation finished"
    );
    report
}

// ── Index reconciliation ────────────────────────────────────────────────────

/// One position where the sorted listings disagree. `None` marks the
/// shorter listing running out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMismatch {
    pub expected: Option<String>,
    pub got: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReport {
    pub entries_expected: usize,
    pub entries_got: usize,
    pub mismatches: Vec<IndexMismatch>,
    pub passed: bool,
}

/// Normalize every path against `prefix` and sort.
#[must_use]
pub fn normalize_index(paths: &[String], prefix: &str) -> Vec<String> {
    let mut out: Vec<String> = paths.iter().map(|p| normalize_path(p, prefix)).collect();
    out.sort();
    out
}

/// Position-by-position diff of two already normalized, sorted listings.
#[must_use]
pub fn diff_index(expected: &[String], got: &[String]) -> IndexReport {
    let len = expected.len().max(got.len());
    let mismatches: Vec<IndexMismatch> = (0..len)
        .filter_map(|i| {
            let e = expected.get(i);
            let g = got.get(i);
            (e != g).then(|| IndexMismatch {
                expected: e.cloned(),
                got: g.cloned(),
            })
        })
        .collect();

    IndexReport {
        entries_expected: expected.len(),
        entries_got: got.len(),
        passed: mismatches.is_empty(),
        mismatches,
    }
}

/// Normalize, sort and diff a reference and subject path listing.
#[must_use]
pub fn reconcile_index(
    reference: &[String],
    subject: &[String],
    options: &ReconcileOptions,
) -> IndexReport {
    let expected = normalize_index(reference, &options.mountpoint);
    let got = normalize_index(subject, &options.device);
    let report = diff_index(&expected, &got);
    if !report.passed {
        warn!(mismatches = report.mismatches.len(), "index mismatch");
    }
    info!(
        entries_expected = report.entries_expected,
        entries_got = report.entries_got,
        "index reconciliation finished"
    );
    report
}
