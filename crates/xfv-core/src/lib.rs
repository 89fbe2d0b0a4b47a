#![forbid(unsafe_code)]
//! Device-level XFS metadata decoding.
//!
//! `XfsImage` ties a [`ByteDevice`] to its decoded primary superblock and
//! reads allocation-group inode headers on demand. This is also where
//! parse-layer errors pick up the device offset and group number they
//! occurred at.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};
use xfv_block::{ByteDevice, FileByteDevice};
use xfv_error::{Result, XfvError};
use xfv_ondisk::{InodeLocation, XfsAgi, XfsSuperblock};
use xfv_types::{
    AgNumber, ByteOffset, InodeNumber, InodeParts, ParseError, XFS_AGI_SIZE, XFS_SB_READ_LEN,
};

/// Options controlling how an image is opened.
///
/// Geometry validation is off by default so damaged images still decode as
/// far as the superblock allows. Turn it on when downstream offsets must be
/// trusted.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Run `XfsSuperblock::validate_geometry` after parsing.
    pub validate_geometry: bool,
}

impl OpenOptions {
    #[must_use]
    pub fn strict() -> Self {
        Self {
            validate_geometry: true,
        }
    }
}

/// An opened XFS image: device handle plus decoded primary superblock.
pub struct XfsImage {
    superblock: XfsSuperblock,
    dev: Box<dyn ByteDevice>,
}

impl std::fmt::Debug for XfsImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XfsImage")
            .field("superblock", &self.superblock)
            .field("dev_len", &self.dev.len_bytes())
            .finish()
    }
}

impl XfsImage {
    /// Open the device or image file at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    /// Open and reject superblocks whose geometry is inconsistent.
    pub fn open_strict(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::strict())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        Self::from_device(Box::new(dev), options)
    }

    /// Decode the superblock from an already-opened device.
    ///
    /// Reads up to the first 4096 bytes. Devices shorter than the superblock
    /// structure are reported as a malformed superblock.
    pub fn from_device(dev: Box<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        let len = dev.len_bytes();
        let read_len = XFS_SB_READ_LEN.min(usize::try_from(len).unwrap_or(usize::MAX));
        debug!(dev_len = len, read_len, "reading primary superblock");
        let head = dev.read_vec(0, read_len)?;

        let superblock =
            XfsSuperblock::parse(&head).map_err(|e| superblock_error(&e, ByteOffset::ZERO))?;
        if options.validate_geometry {
            superblock
                .validate_geometry()
                .map_err(|e| superblock_error(&e, ByteOffset::ZERO))?;
        }
        debug!(
            agcount = superblock.agcount,
            agblocks = superblock.agblocks,
            blocksize = superblock.blocksize,
            sectsize = superblock.sectsize,
            "decoded superblock"
        );

        Ok(Self { superblock, dev })
    }

    #[must_use]
    pub fn superblock(&self) -> &XfsSuperblock {
        &self.superblock
    }

    #[must_use]
    pub fn agcount(&self) -> u32 {
        self.superblock.agcount
    }

    /// Device offset of the AGI for group `agno`, checked against `agcount`.
    pub fn agi_offset(&self, agno: AgNumber) -> Result<ByteOffset> {
        if agno.0 >= self.superblock.agcount {
            return Err(XfvError::InvalidGeometry(format!(
                "allocation group {agno} out of range (agcount={})",
                self.superblock.agcount
            )));
        }
        self.superblock.agi_offset(agno).ok_or_else(|| {
            XfvError::InvalidGeometry(format!("AGI offset for allocation group {agno} overflows"))
        })
    }

    /// Read and decode the AGI of allocation group `agno`.
    ///
    /// The header's sequence number must equal `agno`.
    pub fn read_agi(&self, agno: AgNumber) -> Result<XfsAgi> {
        let offset = self.agi_offset(agno)?;
        debug!(agno = agno.0, offset = offset.0, "reading AGI");
        let bytes = self.dev.read_vec(offset.0, XFS_AGI_SIZE)?;

        let agi = XfsAgi::parse(&bytes).map_err(|e| group_error(&e, agno, offset))?;
        if agi.validate_seqno(agno).is_err() {
            return Err(XfvError::MalformedGroupHeader {
                agno: agno.0,
                offset: offset.0,
                detail: format!("seqno {} does not match index {agno}", agi.seqno),
            });
        }
        Ok(agi)
    }

    /// Read every group's AGI in ascending order.
    ///
    /// One result per group; a failure on one group does not stop the rest.
    pub fn read_all_agis(&self) -> Vec<(AgNumber, Result<XfsAgi>)> {
        (0..self.superblock.agcount)
            .map(AgNumber)
            .map(|agno| {
                let result = self.read_agi(agno);
                if let Err(err) = &result {
                    warn!(agno = agno.0, error = %err, "AGI decode failed");
                }
                (agno, result)
            })
            .collect()
    }

    /// Locate an inode with this image's geometry.
    pub fn locate_inode(&self, ino: InodeNumber) -> Result<InodeLocation> {
        self.superblock.locate_inode(ino).ok_or_else(|| {
            XfvError::InvalidGeometry(format!("inode {ino} cannot be located with this geometry"))
        })
    }

    /// Decode the superblock and every AGI into a serializable report.
    #[must_use]
    pub fn inspect(&self) -> InspectReport {
        let groups = self
            .read_all_agis()
            .into_iter()
            .map(|(agno, result)| {
                let offset = self.superblock.agi_offset(agno).map(|o| o.0);
                match result {
                    Ok(agi) => GroupReport {
                        agno: agno.0,
                        offset,
                        agi: Some(agi),
                        error: None,
                    },
                    Err(err) => GroupReport {
                        agno: agno.0,
                        offset,
                        agi: None,
                        error: Some(err.to_string()),
                    },
                }
            })
            .collect();

        InspectReport {
            superblock: self.superblock.clone(),
            uuid: self.superblock.uuid_string(),
            label: self.superblock.label(),
            root_inode: self.superblock.root_inode().decode(),
            groups,
        }
    }
}

/// Everything `inspect` decodes, in a JSON-friendly shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectReport {
    pub superblock: XfsSuperblock,
    pub uuid: String,
    pub label: String,
    pub root_inode: InodeParts,
    pub groups: Vec<GroupReport>,
}

impl InspectReport {
    #[must_use]
    pub fn failed_groups(&self) -> usize {
        self.groups.iter().filter(|g| g.error.is_some()).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupReport {
    pub agno: u32,
    pub offset: Option<u64>,
    pub agi: Option<XfsAgi>,
    pub error: Option<String>,
}

// ── ParseError → XfvError ───────────────────────────────────────────────────

/// Convert a superblock `ParseError` into the runtime taxonomy.
///
/// Magic and length failures are malformed metadata; field-level failures
/// come from geometry validation.
fn superblock_error(e: &ParseError, offset: ByteOffset) -> XfvError {
    match e {
        ParseError::InvalidMagic { .. } | ParseError::InsufficientData { .. } => {
            XfvError::MalformedSuperblock {
                offset: offset.0,
                detail: e.to_string(),
            }
        }
        ParseError::InvalidField { field, reason } => {
            XfvError::InvalidGeometry(format!("{field}: {reason}"))
        }
        ParseError::IntegerConversion { .. } => XfvError::InvalidGeometry(e.to_string()),
    }
}

fn group_error(e: &ParseError, agno: AgNumber, offset: ByteOffset) -> XfvError {
    XfvError::MalformedGroupHeader {
        agno: agno.0,
        offset: offset.0,
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfv_block::MemoryByteDevice;
    use xfv_types::{XFS_AGI_MAGIC, XFS_SB_MAGIC};

    const BLOCK: u32 = 4096;
    const AGBLOCKS: u32 = 16;

    fn superblock(agcount: u32) -> XfsSuperblock {
        XfsSuperblock {
            magicnum: XFS_SB_MAGIC,
            blocksize: BLOCK,
            dblocks: u64::from(agcount * AGBLOCKS),
            agblocks: AGBLOCKS,
            agcount,
            rootino: 128,
            versionnum: 0xB4A5,
            sectsize: 512,
            inodesize: 512,
            inopblock: 8,
            blocklog: 12,
            sectlog: 9,
            inodelog: 9,
            inopblog: 3,
            agblklog: 4,
            icount: 64,
            ifree: 60,
            ..XfsSuperblock::default()
        }
    }

    /// A full image: primary superblock plus a valid AGI in every group.
    fn image(agcount: u32) -> MemoryByteDevice {
        let sb = superblock(agcount);
        let len = usize::try_from(u64::from(agcount * AGBLOCKS * BLOCK)).expect("fits");
        let mut dev = MemoryByteDevice::zeroed(len);
        dev.write_at(0, &sb.encode());
        for agno in 0..agcount {
            let offset = sb.agi_offset(AgNumber(agno)).expect("offset").0;
            let agi = XfsAgi {
                seqno: agno,
                length: AGBLOCKS,
                count: 64,
                freecount: 60,
                ..XfsAgi::default()
            };
            dev.write_at(usize::try_from(offset).expect("fits"), &agi.encode());
        }
        dev
    }

    fn open(dev: MemoryByteDevice) -> Result<XfsImage> {
        XfsImage::from_device(Box::new(dev), &OpenOptions::default())
    }

    #[test]
    fn four_groups_decode() {
        let img = open(image(4)).expect("open");
        assert_eq!(img.agcount(), 4);
        assert_eq!(img.superblock().blocksize, 4096);

        let all = img.read_all_agis();
        assert_eq!(all.len(), 4);
        for (idx, (agno, result)) in all.iter().enumerate() {
            assert_eq!(agno.0 as usize, idx);
            let agi = result.as_ref().expect("agi decodes");
            assert_eq!(agi.seqno, agno.0);
            assert_eq!(agi.magicnum, XFS_AGI_MAGIC);
        }
    }

    #[test]
    fn bad_superblock_magic_is_malformed() {
        let mut dev = image(2);
        dev.write_at(0, b"XFSC");
        let err = open(dev).expect_err("bad magic");
        assert!(matches!(err, XfvError::MalformedSuperblock { offset: 0, .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn tiny_device_is_malformed_superblock() {
        let dev = MemoryByteDevice::new(superblock(1).encode()[..100].to_vec());
        let err = open(dev).expect_err("truncated");
        assert!(err.is_malformed_metadata(), "{err:?}");
    }

    #[test]
    fn device_of_exactly_superblock_length_opens() {
        let dev = MemoryByteDevice::new(superblock(1).encode());
        let img = open(dev).expect("288 bytes is enough");
        // The AGI lies beyond the end.
        assert!(matches!(
            img.read_agi(AgNumber(0)),
            Err(XfvError::ShortRead { offset: 1024, .. })
        ));
    }

    #[test]
    fn strict_open_checks_geometry() {
        let mut sb = superblock(2);
        sb.blocklog = 11;
        let dev = MemoryByteDevice::new(sb.encode());
        assert!(open(dev.clone()).is_ok());
        let err = XfsImage::from_device(Box::new(dev), &OpenOptions::strict())
            .expect_err("strict rejects");
        assert!(matches!(err, XfvError::InvalidGeometry(_)));
    }

    #[test]
    fn out_of_range_group_is_geometry_error() {
        let img = open(image(2)).expect("open");
        assert!(matches!(
            img.read_agi(AgNumber(2)),
            Err(XfvError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn wrong_seqno_is_malformed_group() {
        let sb = superblock(3);
        let mut dev = image(3);
        let offset = sb.agi_offset(AgNumber(1)).expect("offset").0;
        let wrong = XfsAgi {
            seqno: 7,
            ..XfsAgi::default()
        };
        dev.write_at(usize::try_from(offset).expect("fits"), &wrong.encode());

        let img = open(dev).expect("open");
        match img.read_agi(AgNumber(1)) {
            Err(XfvError::MalformedGroupHeader {
                agno,
                offset: at,
                detail,
            }) => {
                assert_eq!(agno, 1);
                assert_eq!(at, offset);
                assert!(detail.contains("seqno 7"), "{detail}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn one_bad_group_does_not_stop_the_others() {
        let sb = superblock(4);
        let mut dev = image(4);
        let offset = sb.agi_offset(AgNumber(2)).expect("offset").0;
        dev.write_at(usize::try_from(offset).expect("fits"), b"XAGF");

        let img = open(dev).expect("open");
        let results = img.read_all_agis();
        assert_eq!(results.len(), 4);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_ok());
        assert!(matches!(
            results[2].1,
            Err(XfvError::MalformedGroupHeader { agno: 2, .. })
        ));
        assert!(results[3].1.is_ok());

        let report = img.inspect();
        assert_eq!(report.failed_groups(), 1);
        assert!(report.groups[2].agi.is_none());
        assert!(
            report.groups[2]
                .error
                .as_deref()
                .is_some_and(|e| e.contains("XAGF"))
        );
    }

    #[test]
    fn truncated_last_group_is_short_read() {
        let dev = image(4);
        let mut bytes = dev.into_inner();
        // Cut the image just inside the last AGI.
        let sb = superblock(4);
        let last = sb.agi_offset(AgNumber(3)).expect("offset").0;
        bytes.truncate(usize::try_from(last).expect("fits") + 100);

        let img = open(MemoryByteDevice::new(bytes)).expect("open");
        let results = img.read_all_agis();
        assert!(results[..3].iter().all(|(_, r)| r.is_ok()));
        match &results[3].1 {
            Err(XfvError::ShortRead {
                offset, needed, ..
            }) => {
                assert_eq!(*offset, last);
                assert_eq!(*needed, XFS_AGI_SIZE as u64);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn inspect_report_serializes() {
        let img = open(image(2)).expect("open");
        let report = img.inspect();
        assert_eq!(
            report.root_inode,
            InodeParts {
                ag: 0,
                block: 0,
                slot: 128
            }
        );
        assert_eq!(report.groups[1].offset, Some(u64::from(AGBLOCKS * BLOCK) + 1024));
        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["superblock"]["agcount"], 2);
        assert_eq!(json["root_inode"], serde_json::json!({"ag": 0, "block": 0, "slot": 128}));
        assert_eq!(json["groups"][0]["agi"]["seqno"], 0);
        assert!(json["groups"][0]["error"].is_null());
    }

    #[test]
    fn locate_inode_through_image() {
        let img = open(image(2)).expect("open");
        // agblklog=4, inopblog=3: inode 128 is the first slot of AG 1.
        let loc = img.locate_inode(InodeNumber(128)).expect("locate");
        assert_eq!((loc.agno, loc.agbno, loc.slot), (1, 0, 0));
        assert_eq!(loc.byte_offset, ByteOffset(u64::from(AGBLOCKS * BLOCK)));
    }
}
