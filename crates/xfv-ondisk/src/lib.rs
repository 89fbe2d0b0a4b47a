#![forbid(unsafe_code)]
//! On-disk format parsing for XFS metadata.
//!
//! Pure parsing crate with no I/O. Turns byte slices into the primary
//! superblock and the per-group AGI header, and writes them back out.
//! Geometry math that only needs the superblock (AGI placement, inode
//! location) lives here as well.

pub mod xfs;

pub use xfs::{
    InodeLocation, XFS_AGI_CRC_OFFSET, XFS_SB_CRC_OFFSET, XFS_SB_VERSION_5,
    XfsAgi, XfsIncompatFeatures, XfsRoCompatFeatures, XfsSuperblock,
};
