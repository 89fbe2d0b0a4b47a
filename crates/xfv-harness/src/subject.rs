//! Parsers for the subject tool's `--bmap` and `--find` listings.
//!
//! The bmap listing is a flat YAML mapping written by hand:
//!
//! ```text
//! '/dev/nvme0n1/a.bin':
//! - [0, 7, 96, 103]
//! '/dev/nvme0n1/empty': ~
//! ```
//!
//! Entries the subject cannot classify are announced with a
//! `# UNKNOWN(<name>)` marker that is not newline terminated, so it may
//! prefix the next record on the same line. `<name>` is a raw directory
//! entry name: it may contain `)` or quotes but never `/`.

use crate::command::CommandRunner;
use crate::extent::Extent;
use crate::snapshot::{ExtentMap, FileExtents};
use std::ffi::OsStr;
use tracing::debug;
use xfv_error::{Result, XfvError};

const UNKNOWN_MARKER: &str = "# UNKNOWN(";

/// Remove any number of leading `# UNKNOWN(...)` markers.
///
/// Every record after a marker is an absolute path, quoted or not, so the
/// markers end at the last `)` before the first `/`. A marker with no `)`
/// there is left in place.
fn strip_unknown_markers(line: &str) -> &str {
    let Some(rest) = line.strip_prefix(UNKNOWN_MARKER) else {
        return line;
    };
    let names = rest.find('/').map_or(rest, |slash| &rest[..slash]);
    match names.rfind(')') {
        Some(close) => &rest[close + 1..],
        None => line,
    }
}

fn parse_error(line_no: usize, detail: &str) -> XfvError {
    XfvError::Parse(format!("subject output line {line_no}: {detail}"))
}

/// Split a quoted key line into the unescaped key and what follows the colon.
fn parse_key_line(line: &str) -> Option<(String, &str)> {
    let quote = line.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let terminator = format!("{quote}:");
    let close = line.rfind(&terminator)?;
    if close == 0 {
        return None;
    }
    let raw = &line[1..close];
    let key = if quote == '\'' {
        raw.replace("''", "'")
    } else {
        raw.replace("\\\"", "\"").replace("\\\\", "\\")
    };
    Some((key, &line[close + terminator.len()..]))
}

/// Parse `[a, b, c, d]`.
fn parse_extent_list(text: &str) -> Option<Extent> {
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?;
    let values = inner
        .split(',')
        .map(|v| v.trim().parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    let [a, b, c, d]: [u64; 4] = values.try_into().ok()?;
    Some(Extent::new(a, b, c, d))
}

/// Parse a subject `--bmap` listing into an extent map keyed by the paths
/// exactly as printed (device prefix included).
pub fn parse_subject_bmap(text: &str) -> Result<ExtentMap> {
    let mut map = ExtentMap::new();
    // Key currently accepting `- [...]` lines.
    let mut open_key: Option<String> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_unknown_markers(raw_line.trim_end());
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(item) = trimmed.strip_prefix('-') {
            let Some(key) = open_key.as_ref() else {
                return Err(parse_error(line_no, "extent without a preceding path"));
            };
            let extent = parse_extent_list(item)
                .ok_or_else(|| parse_error(line_no, "expected `- [a, b, c, d]`"))?;
            if let Some(entry) = map.get_mut(key) {
                entry.extents.push(extent);
            }
            continue;
        }

        let (key, value) = parse_key_line(trimmed)
            .ok_or_else(|| parse_error(line_no, "expected a quoted path followed by `:`"))?;
        if map.contains_key(&key) {
            return Err(parse_error(line_no, &format!("duplicate path {key}")));
        }
        map.insert(key.clone(), FileExtents::default());

        match value.trim() {
            "" => open_key = Some(key),
            "~" | "null" | "[]" => open_key = None,
            other => {
                return Err(parse_error(
                    line_no,
                    &format!("unexpected value after path: {other}"),
                ));
            }
        }
    }

    Ok(map)
}

/// Which listing the subject tool is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectMode {
    Bmap,
    Find,
}

impl SubjectMode {
    #[must_use]
    pub fn flag(self) -> &'static str {
        match self {
            Self::Bmap => "--bmap",
            Self::Find => "--find",
        }
    }
}

/// Run `<program> --bmap|--find <device>` and return its stdout.
///
/// A non-zero exit is `XfvError::SubjectToolFailure`.
pub fn run_subject_tool<R: CommandRunner>(
    runner: &R,
    program: &str,
    mode: SubjectMode,
    device: &str,
) -> Result<String> {
    debug!(program, mode = mode.flag(), device, "running subject tool");
    let output = runner.run(program, &[OsStr::new(mode.flag()), OsStr::new(device)])?;
    if !output.success() {
        return Err(XfvError::SubjectToolFailure {
            program: program.to_owned(),
            mode: mode.flag().to_owned(),
            status: output.status,
            stderr: output.stderr.trim().to_owned(),
        });
    }
    Ok(output.stdout)
}

/// Parse a subject `--find` listing: one path per line.
#[must_use]
pub fn parse_subject_index(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| strip_unknown_markers(line.trim_end()))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_owned)
        .collect()
}
