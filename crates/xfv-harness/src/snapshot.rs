//! Reference extent snapshots of a mounted directory tree.

use crate::command::CommandRunner;
use crate::extent::{DEFAULT_EXTENT_TOOL, Extent, ExtentTool};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use xfv_error::{Result, XfvError};

/// Extent information recorded for one regular file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileExtents {
    /// Inode number from file metadata; subject listings do not carry one.
    #[serde(default)]
    pub inode: Option<u64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub extents: Vec<Extent>,
}

/// `null` and `[]` both mean "no extents".
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Extent>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Extent>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Path → extents, ordered by path.
pub type ExtentMap = BTreeMap<String, FileExtents>;

/// Configuration for [`build_reference_map`].
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Program invoked as `<extent_tool> <absolute-path>`.
    pub extent_tool: String,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            extent_tool: DEFAULT_EXTENT_TOOL.to_owned(),
        }
    }
}

/// Walk `root` and record inode and extents for every regular file.
///
/// Symlinks are not followed and directories are not entries. Keys are
/// absolute paths. Directory entries are visited in sorted order.
pub fn build_reference_map<R: CommandRunner>(root: &Path, tool: &ExtentTool<R>) -> Result<ExtentMap> {
    let root = std::path::absolute(root)?;
    let mut files = Vec::new();
    collect_regular_files(&root, &mut files)?;

    let mut map = ExtentMap::new();
    for (path, inode) in files {
        let extents = tool.extents(&path)?;
        map.insert(
            path.to_string_lossy().into_owned(),
            FileExtents {
                inode: Some(inode),
                extents,
            },
        );
    }
    info!(root = %root.display(), files = map.len(), tool = tool.program(), "built reference extent map");
    Ok(map)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn collect_regular_files(dir: &Path, out: &mut Vec<(PathBuf, u64)>) -> Result<()> {
    for path in sorted_entries(dir)? {
        let meta = fs::symlink_metadata(&path)?;
        let file_type = meta.file_type();
        if file_type.is_dir() {
            collect_regular_files(&path, out)?;
        } else if file_type.is_file() {
            out.push((path, meta.ino()));
        } else {
            debug!(path = %path.display(), "skipping non-regular entry");
        }
    }
    Ok(())
}

/// Every path under `root` the way `find <root>` lists them: the root
/// itself, directories, files and any other entry type. Callers sort
/// before comparing.
pub fn list_paths(root: &Path) -> Result<Vec<String>> {
    let root = std::path::absolute(root)?;
    let mut out = vec![root.to_string_lossy().into_owned()];
    collect_all_paths(&root, &mut out)?;
    Ok(out)
}

fn collect_all_paths(dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for path in sorted_entries(dir)? {
        out.push(path.to_string_lossy().into_owned());
        if fs::symlink_metadata(&path)?.file_type().is_dir() {
            collect_all_paths(&path, out)?;
        }
    }
    Ok(())
}

/// Write a snapshot as pretty JSON.
pub fn save_snapshot(map: &ExtentMap, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(map)
        .map_err(|e| XfvError::Parse(format!("serialize snapshot: {e}")))?;
    fs::write(path, json)?;
    Ok(())
}

/// Load a snapshot written by [`save_snapshot`].
pub fn load_snapshot(path: &Path) -> Result<ExtentMap> {
    let text = fs::read_to_string(path)?;
    parse_snapshot(&text).map_err(|e| match e {
        XfvError::Parse(detail) => XfvError::Parse(format!("{}: {detail}", path.display())),
        other => other,
    })
}

pub fn parse_snapshot(text: &str) -> Result<ExtentMap> {
    serde_json::from_str(text).map_err(|e| XfvError::Parse(format!("invalid snapshot json: {e}")))
}
