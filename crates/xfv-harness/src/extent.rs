//! Reference extent extraction: run `xfs_bmap <file>` and parse its text.

use crate::command::{CommandRunner, SystemCommandRunner};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use xfv_error::{Result, XfvError};

/// Default reference extent tool.
pub const DEFAULT_EXTENT_TOOL: &str = "xfs_bmap";

/// One contiguous mapping of file offsets to device blocks.
///
/// All four values are in 512-byte units, inclusive at both ends, as
/// `xfs_bmap` prints them. Serialized as `[start_offset, end_offset,
/// start_block, end_block]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "[u64; 4]", into = "[u64; 4]")]
pub struct Extent {
    pub start_offset: u64,
    pub end_offset: u64,
    pub start_block: u64,
    pub end_block: u64,
}

impl Extent {
    #[must_use]
    pub fn new(start_offset: u64, end_offset: u64, start_block: u64, end_block: u64) -> Self {
        Self {
            start_offset,
            end_offset,
            start_block,
            end_block,
        }
    }
}

impl From<[u64; 4]> for Extent {
    fn from([a, b, c, d]: [u64; 4]) -> Self {
        Self::new(a, b, c, d)
    }
}

impl From<Extent> for [u64; 4] {
    fn from(e: Extent) -> Self {
        [e.start_offset, e.end_offset, e.start_block, e.end_block]
    }
}

impl std::fmt::Display for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}..{}]: {}..{}",
            self.start_offset, self.end_offset, self.start_block, self.end_block
        )
    }
}

/// Split `"<a>..<b>"` into two integers.
fn parse_range(text: &str) -> Option<(u64, u64)> {
    let (lo, hi) = text.trim().split_once("..")?;
    Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?))
}

/// Parse one `xfs_bmap` extent line: `<index>: [<a>..<b>]: <c>..<d>`.
///
/// Returns `None` for anything else: the path header, `hole` lines, blank
/// lines.
#[must_use]
pub fn parse_bmap_line(line: &str) -> Option<Extent> {
    let (index, rest) = line.trim().split_once(':')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let rest = rest.trim_start().strip_prefix('[')?;
    let (offsets, blocks) = rest.split_once("]:")?;
    let (start_offset, end_offset) = parse_range(offsets)?;
    let (start_block, end_block) = parse_range(blocks)?;
    Some(Extent::new(start_offset, end_offset, start_block, end_block))
}

/// Every extent line of an `xfs_bmap` listing, in output order.
#[must_use]
pub fn parse_bmap_output(text: &str) -> Vec<Extent> {
    text.lines().filter_map(parse_bmap_line).collect()
}

/// The reference extent tool bound to a command runner.
#[derive(Debug, Clone)]
pub struct ExtentTool<R = SystemCommandRunner> {
    program: String,
    runner: R,
}

impl ExtentTool<SystemCommandRunner> {
    #[must_use]
    pub fn system(program: impl Into<String>) -> Self {
        Self::new(program, SystemCommandRunner)
    }
}

impl Default for ExtentTool<SystemCommandRunner> {
    fn default() -> Self {
        Self::system(DEFAULT_EXTENT_TOOL)
    }
}

impl<R: CommandRunner> ExtentTool<R> {
    pub fn new(program: impl Into<String>, runner: R) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Extents of the file at `path`, in file-offset order.
    ///
    /// A file without data yields an empty list. A non-zero exit from the
    /// tool is `XfvError::ExtentToolFailure`.
    pub fn extents(&self, path: &Path) -> Result<Vec<Extent>> {
        let output = self.runner.run(&self.program, &[path.as_os_str()])?;
        if !output.success() {
            return Err(XfvError::ExtentToolFailure {
                path: path.display().to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_owned(),
            });
        }
        let extents = parse_bmap_output(&output.stdout);
        debug!(path = %path.display(), count = extents.len(), "parsed extents");
        Ok(extents)
    }
}
