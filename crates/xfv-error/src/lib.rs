#![forbid(unsafe_code)]
//! Error types for xfv.
//!
//! # Error Taxonomy
//!
//! xfv uses the same two-layer model throughout:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `xfv-types` | Byte-level violations detected while decoding a slice |
//! | Runtime | `XfvError` | `xfv-error` (this crate) | Errors surfaced by the CLI, the harness and library callers |
//!
//! `xfv-error` does not depend on `xfv-types`. The conversion from
//! `ParseError` to `XfvError` lives in `xfv-core`, which knows the device
//! offset and allocation group being decoded and attaches them.
//!
//! | Failure | `XfvError` variant | Exit code |
//! |---------|--------------------|-----------|
//! | Superblock magic mismatch or truncated superblock | `MalformedSuperblock` | 2 |
//! | AGI magic/seqno mismatch or truncated AGI | `MalformedGroupHeader` | 2 |
//! | Device too short for a fixed-size read | `ShortRead` | 5 |
//! | Reference extent command exited non-zero | `ExtentToolFailure` | 3 |
//! | Subject tool exited non-zero | `SubjectToolFailure` | 3 |
//! | Malformed snapshot, subject output or fixture | `Parse` | 4 |
//! | Geometry invariant violated, AG index out of range | `InvalidGeometry` | 6 |
//! | OS I/O error | `Io` | 5 |
//!
//! A reconciliation that finds differences is not an error. It produces a
//! report with a non-empty mismatch list, and the binaries exit with 1.

use thiserror::Error;

/// Exit code used by the binaries when a reconciliation reports mismatches.
pub const EXIT_MISMATCH: i32 = 1;

#[derive(Debug, Error)]
pub enum XfvError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrong magic or truncated read while decoding the primary superblock.
    #[error("malformed superblock at byte {offset}: {detail}")]
    MalformedSuperblock { offset: u64, detail: String },

    /// Wrong magic, wrong sequence number or truncated read for one AGI.
    ///
    /// Fatal to that group only; callers decoding every group keep going.
    #[error("malformed AGI for allocation group {agno} at byte {offset}: {detail}")]
    MalformedGroupHeader {
        agno: u32,
        offset: u64,
        detail: String,
    },

    /// The device ended before a fixed-size read could be satisfied.
    #[error("short read at byte {offset}: needed {needed} bytes, device has {available}")]
    ShortRead {
        offset: u64,
        needed: u64,
        available: u64,
    },

    /// The reference extent tool failed for one file.
    #[error("extent tool failed for {path} (status {}): {stderr}", status_text(*.status))]
    ExtentToolFailure {
        path: String,
        status: Option<i32>,
        stderr: String,
    },

    /// The subject tool failed while dumping its bmap or index listing.
    #[error("subject tool {program} {mode} failed (status {}): {stderr}", status_text(*.status))]
    SubjectToolFailure {
        program: String,
        mode: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Snapshot, subject output or fixture text could not be understood.
    #[error("parse error: {0}")]
    Parse(String),
}

fn status_text(status: Option<i32>) -> String {
    status.map_or_else(|| "killed by signal".to_owned(), |code| code.to_string())
}

impl XfvError {
    /// Process exit code for this error. Exhaustive on purpose.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MalformedSuperblock { .. } | Self::MalformedGroupHeader { .. } => 2,
            Self::ExtentToolFailure { .. } | Self::SubjectToolFailure { .. } => 3,
            Self::Parse(_) => 4,
            Self::Io(_) | Self::ShortRead { .. } => 5,
            Self::InvalidGeometry(_) => 6,
        }
    }

    /// Whether this error is a decode failure of on-disk metadata.
    #[must_use]
    pub fn is_malformed_metadata(&self) -> bool {
        matches!(
            self,
            Self::MalformedSuperblock { .. } | Self::MalformedGroupHeader { .. }
        )
    }
}

/// Result alias using `XfvError`.
pub type Result<T> = std::result::Result<T, XfvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_cover_all_variants() {
        let cases: Vec<(XfvError, i32)> = vec![
            (XfvError::Io(std::io::Error::other("test")), 5),
            (
                XfvError::MalformedSuperblock {
                    offset: 0,
                    detail: "bad magic".into(),
                },
                2,
            ),
            (
                XfvError::MalformedGroupHeader {
                    agno: 1,
                    offset: 1024,
                    detail: "bad magic".into(),
                },
                2,
            ),
            (
                XfvError::ShortRead {
                    offset: 4096,
                    needed: 512,
                    available: 4100,
                },
                5,
            ),
            (
                XfvError::ExtentToolFailure {
                    path: "/mnt/a".into(),
                    status: Some(1),
                    stderr: String::new(),
                },
                3,
            ),
            (
                XfvError::SubjectToolFailure {
                    program: "xal".into(),
                    mode: "--bmap".into(),
                    status: Some(134),
                    stderr: "abort".into(),
                },
                3,
            ),
            (XfvError::InvalidGeometry("agcount=0".into()), 6),
            (XfvError::Parse("line 3".into()), 4),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.exit_code(), *expected, "wrong exit code for {error:?}");
            assert_ne!(error.exit_code(), EXIT_MISMATCH);
        }
    }

    #[test]
    fn display_formatting() {
        let err = XfvError::MalformedSuperblock {
            offset: 0,
            detail: "invalid magic".into(),
        };
        assert_eq!(
            err.to_string(),
            "malformed superblock at byte 0: invalid magic"
        );

        let err = XfvError::MalformedGroupHeader {
            agno: 2,
            offset: 2_098_176,
            detail: "seqno 7 does not match index".into(),
        };
        assert_eq!(
            err.to_string(),
            "malformed AGI for allocation group 2 at byte 2098176: seqno 7 does not match index"
        );

        let err = XfvError::ExtentToolFailure {
            path: "/mnt/x.bin".into(),
            status: Some(1),
            stderr: "no such file".into(),
        };
        assert_eq!(
            err.to_string(),
            "extent tool failed for /mnt/x.bin (status 1): no such file"
        );

        let err = XfvError::ExtentToolFailure {
            path: "/mnt/x.bin".into(),
            status: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("killed by signal"));

        let err = XfvError::SubjectToolFailure {
            program: "xal".into(),
            mode: "--find".into(),
            status: Some(2),
            stderr: "cannot open /dev/d".into(),
        };
        assert_eq!(
            err.to_string(),
            "subject tool xal --find failed (status 2): cannot open /dev/d"
        );
    }

    #[test]
    fn malformed_metadata_classification() {
        assert!(
            XfvError::MalformedSuperblock {
                offset: 0,
                detail: String::new()
            }
            .is_malformed_metadata()
        );
        assert!(!XfvError::Parse(String::new()).is_malformed_metadata());
    }
}
