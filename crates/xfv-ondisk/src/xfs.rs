#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use xfv_types::{
    AgNumber, BlockSize, ByteOffset, InodeNumber, NULLAGINO, ParseError, SectorSize,
    XFS_AGI_MAGIC, XFS_AGI_SIZE, XFS_AGI_UNLINKED_BUCKETS, XFS_LABEL_MAX, XFS_SB_MAGIC,
    XFS_SB_SIZE, decode_uuid, read_be_u16, read_be_u32, read_be_u64, read_fixed, read_le_u32,
    read_u8, trim_nul_padded,
};

/// Low nibble of `sb_versionnum`.
pub const XFS_SB_VERSION_NUMBITS: u16 = 0x000F;
pub const XFS_SB_VERSION_5: u16 = 5;

/// Offset of `sb_crc` within the superblock.
pub const XFS_SB_CRC_OFFSET: usize = 224;
/// Offset of `agi_crc` within the AGI.
pub const XFS_AGI_CRC_OFFSET: usize = 312;

// ── XFS feature flags ──────────────────────────────────────────────────────

/// Read-only compatible features (`sb_features_ro_compat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct XfsRoCompatFeatures(pub u32);

impl XfsRoCompatFeatures {
    pub const FINOBT: Self = Self(1 << 0);
    pub const RMAPBT: Self = Self(1 << 1);
    pub const REFLINK: Self = Self(1 << 2);
    pub const INOBTCNT: Self = Self(1 << 3);

    const KNOWN: &[(u32, &'static str)] = &[
        (Self::FINOBT.0, "FINOBT"),
        (Self::RMAPBT.0, "RMAPBT"),
        (Self::REFLINK.0, "REFLINK"),
        (Self::INOBTCNT.0, "INOBTCNT"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    #[must_use]
    pub fn unknown_bits(self) -> u32 {
        unknown_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for XfsRoCompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.describe(), self.unknown_bits())
    }
}

/// Incompatible features (`sb_features_incompat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct XfsIncompatFeatures(pub u32);

impl XfsIncompatFeatures {
    pub const FTYPE: Self = Self(1 << 0);
    pub const SPINODES: Self = Self(1 << 1);
    pub const META_UUID: Self = Self(1 << 2);
    pub const BIGTIME: Self = Self(1 << 3);
    pub const NEEDSREPAIR: Self = Self(1 << 4);
    pub const NREXT64: Self = Self(1 << 5);
    pub const EXCHRANGE: Self = Self(1 << 6);
    pub const PARENT: Self = Self(1 << 7);
    pub const METADIR: Self = Self(1 << 8);

    const KNOWN: &[(u32, &'static str)] = &[
        (Self::FTYPE.0, "FTYPE"),
        (Self::SPINODES.0, "SPINODES"),
        (Self::META_UUID.0, "META_UUID"),
        (Self::BIGTIME.0, "BIGTIME"),
        (Self::NEEDSREPAIR.0, "NEEDSREPAIR"),
        (Self::NREXT64.0, "NREXT64"),
        (Self::EXCHRANGE.0, "EXCHRANGE"),
        (Self::PARENT.0, "PARENT"),
        (Self::METADIR.0, "METADIR"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    #[must_use]
    pub fn unknown_bits(self) -> u32 {
        unknown_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for XfsIncompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.describe(), self.unknown_bits())
    }
}

fn describe_flags(bits: u32, known: &[(u32, &'static str)]) -> Vec<&'static str> {
    known
        .iter()
        .filter(|(mask, _)| bits & mask != 0)
        .map(|(_, name)| *name)
        .collect()
}

fn unknown_flags(bits: u32, known: &[(u32, &'static str)]) -> u32 {
    let known_mask = known.iter().fold(0_u32, |acc, (mask, _)| acc | mask);
    bits & !known_mask
}

fn format_flags(
    f: &mut std::fmt::Formatter<'_>,
    names: Vec<&'static str>,
    unknown: u32,
) -> std::fmt::Result {
    if names.is_empty() && unknown == 0 {
        return write!(f, "(none)");
    }
    write!(f, "{}", names.join("|"))?;
    if unknown != 0 {
        if !names.is_empty() {
            write!(f, "|")?;
        }
        write!(f, "0x{unknown:X}")?;
    }
    Ok(())
}

// ── Superblock ─────────────────────────────────────────────────────────────

/// The primary XFS superblock, decoded field-for-field.
///
/// Every field sits at a fixed offset in a packed 288-byte record. All
/// multi-byte fields are big-endian except `crc`, which XFS stores
/// little-endian.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct XfsSuperblock {
    // ── Identity ─────────────────────────────────────────────────────────
    pub magicnum: u32,
    pub uuid: [u8; 16],
    pub fname: [u8; XFS_LABEL_MAX],
    pub versionnum: u16,
    pub meta_uuid: [u8; 16],

    // ── Geometry ─────────────────────────────────────────────────────────
    pub blocksize: u32,
    pub dblocks: u64,
    pub rblocks: u64,
    pub rextents: u64,
    pub logstart: u64,
    pub rextsize: u32,
    pub agblocks: u32,
    pub agcount: u32,
    pub rbmblocks: u32,
    pub logblocks: u32,
    pub sectsize: u16,
    pub inodesize: u16,
    pub inopblock: u16,
    pub blocklog: u8,
    pub sectlog: u8,
    pub inodelog: u8,
    pub inopblog: u8,
    pub agblklog: u8,
    pub rextslog: u8,
    pub inprogress: u8,
    pub imax_pct: u8,
    pub inoalignmt: u32,
    pub unit: u32,
    pub width: u32,
    pub dirblklog: u8,
    pub logsectlog: u8,
    pub logsectsize: u16,
    pub logsunit: u32,
    pub spino_align: u32,

    // ── Well-known inodes ────────────────────────────────────────────────
    pub rootino: u64,
    pub rbmino: u64,
    pub rsumino: u64,
    pub uquotino: u64,
    pub gquotino: u64,
    pub pquotino: u64,
    pub metadirino: u64,

    // ── Counters ─────────────────────────────────────────────────────────
    pub icount: u64,
    pub ifree: u64,
    pub fdblocks: u64,
    pub frextents: u64,

    // ── Flags & features ─────────────────────────────────────────────────
    pub qflags: u16,
    pub flags: u8,
    pub shared_vn: u8,
    pub features2: u32,
    pub bad_features2: u32,
    pub features_compat: u32,
    pub features_ro_compat: XfsRoCompatFeatures,
    pub features_incompat: XfsIncompatFeatures,
    pub features_log_incompat: u32,

    // ── Realtime groups ──────────────────────────────────────────────────
    pub rgcount: u32,
    pub rgextents: u32,
    pub rgblklog: u8,

    // ── Integrity ────────────────────────────────────────────────────────
    pub crc: u32,
    pub lsn: u64,
}

impl XfsSuperblock {
    /// Decode a superblock from the first bytes of a device.
    ///
    /// Fails with `InsufficientData` when `bytes` is shorter than the
    /// structure and with `InvalidMagic` when the tag is not `XFSB`.
    /// Geometry is not checked here; see [`Self::validate_geometry`].
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < XFS_SB_SIZE {
            return Err(ParseError::InsufficientData {
                needed: XFS_SB_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let magicnum = read_be_u32(bytes, 0)?;
        if magicnum != XFS_SB_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: XFS_SB_MAGIC,
                actual: magicnum,
            });
        }

        Ok(Self {
            // Identity
            magicnum,
            uuid: read_fixed::<16>(bytes, 32)?,
            fname: read_fixed::<XFS_LABEL_MAX>(bytes, 108)?,
            versionnum: read_be_u16(bytes, 100)?,
            meta_uuid: read_fixed::<16>(bytes, 248)?,

            // Geometry
            blocksize: read_be_u32(bytes, 4)?,
            dblocks: read_be_u64(bytes, 8)?,
            rblocks: read_be_u64(bytes, 16)?,
            rextents: read_be_u64(bytes, 24)?,
            logstart: read_be_u64(bytes, 48)?,
            rextsize: read_be_u32(bytes, 80)?,
            agblocks: read_be_u32(bytes, 84)?,
            agcount: read_be_u32(bytes, 88)?,
            rbmblocks: read_be_u32(bytes, 92)?,
            logblocks: read_be_u32(bytes, 96)?,
            sectsize: read_be_u16(bytes, 102)?,
            inodesize: read_be_u16(bytes, 104)?,
            inopblock: read_be_u16(bytes, 106)?,
            blocklog: read_u8(bytes, 120)?,
            sectlog: read_u8(bytes, 121)?,
            inodelog: read_u8(bytes, 122)?,
            inopblog: read_u8(bytes, 123)?,
            agblklog: read_u8(bytes, 124)?,
            rextslog: read_u8(bytes, 125)?,
            inprogress: read_u8(bytes, 126)?,
            imax_pct: read_u8(bytes, 127)?,
            inoalignmt: read_be_u32(bytes, 180)?,
            unit: read_be_u32(bytes, 184)?,
            width: read_be_u32(bytes, 188)?,
            dirblklog: read_u8(bytes, 192)?,
            logsectlog: read_u8(bytes, 193)?,
            logsectsize: read_be_u16(bytes, 194)?,
            logsunit: read_be_u32(bytes, 196)?,
            spino_align: read_be_u32(bytes, 228)?,

            // Well-known inodes
            rootino: read_be_u64(bytes, 56)?,
            rbmino: read_be_u64(bytes, 64)?,
            rsumino: read_be_u64(bytes, 72)?,
            uquotino: read_be_u64(bytes, 160)?,
            gquotino: read_be_u64(bytes, 168)?,
            pquotino: read_be_u64(bytes, 232)?,
            metadirino: read_be_u64(bytes, 264)?,

            // Counters
            icount: read_be_u64(bytes, 128)?,
            ifree: read_be_u64(bytes, 136)?,
            fdblocks: read_be_u64(bytes, 144)?,
            frextents: read_be_u64(bytes, 152)?,

            // Flags & features
            qflags: read_be_u16(bytes, 176)?,
            flags: read_u8(bytes, 178)?,
            shared_vn: read_u8(bytes, 179)?,
            features2: read_be_u32(bytes, 200)?,
            bad_features2: read_be_u32(bytes, 204)?,
            features_compat: read_be_u32(bytes, 208)?,
            features_ro_compat: XfsRoCompatFeatures(read_be_u32(bytes, 212)?),
            features_incompat: XfsIncompatFeatures(read_be_u32(bytes, 216)?),
            features_log_incompat: read_be_u32(bytes, 220)?,

            // Realtime groups
            rgcount: read_be_u32(bytes, 272)?,
            rgextents: read_be_u32(bytes, 276)?,
            rgblklog: read_u8(bytes, 280)?,

            // Integrity
            crc: read_le_u32(bytes, XFS_SB_CRC_OFFSET)?,
            lsn: read_be_u64(bytes, 240)?,
        })
    }

    /// Write every decoded field back to its on-disk offset.
    ///
    /// The trailing 7 pad bytes are written as zero.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; XFS_SB_SIZE];
        let w = &mut out;

        put_be_u32(w, 0, self.magicnum);
        put_be_u32(w, 4, self.blocksize);
        put_be_u64(w, 8, self.dblocks);
        put_be_u64(w, 16, self.rblocks);
        put_be_u64(w, 24, self.rextents);
        put_bytes(w, 32, &self.uuid);
        put_be_u64(w, 48, self.logstart);
        put_be_u64(w, 56, self.rootino);
        put_be_u64(w, 64, self.rbmino);
        put_be_u64(w, 72, self.rsumino);
        put_be_u32(w, 80, self.rextsize);
        put_be_u32(w, 84, self.agblocks);
        put_be_u32(w, 88, self.agcount);
        put_be_u32(w, 92, self.rbmblocks);
        put_be_u32(w, 96, self.logblocks);
        put_be_u16(w, 100, self.versionnum);
        put_be_u16(w, 102, self.sectsize);
        put_be_u16(w, 104, self.inodesize);
        put_be_u16(w, 106, self.inopblock);
        put_bytes(w, 108, &self.fname);
        put_bytes(
            w,
            120,
            &[
                self.blocklog,
                self.sectlog,
                self.inodelog,
                self.inopblog,
                self.agblklog,
                self.rextslog,
                self.inprogress,
                self.imax_pct,
            ],
        );
        put_be_u64(w, 128, self.icount);
        put_be_u64(w, 136, self.ifree);
        put_be_u64(w, 144, self.fdblocks);
        put_be_u64(w, 152, self.frextents);
        put_be_u64(w, 160, self.uquotino);
        put_be_u64(w, 168, self.gquotino);
        put_be_u16(w, 176, self.qflags);
        put_bytes(w, 178, &[self.flags, self.shared_vn]);
        put_be_u32(w, 180, self.inoalignmt);
        put_be_u32(w, 184, self.unit);
        put_be_u32(w, 188, self.width);
        put_bytes(w, 192, &[self.dirblklog, self.logsectlog]);
        put_be_u16(w, 194, self.logsectsize);
        put_be_u32(w, 196, self.logsunit);
        put_be_u32(w, 200, self.features2);
        put_be_u32(w, 204, self.bad_features2);
        put_be_u32(w, 208, self.features_compat);
        put_be_u32(w, 212, self.features_ro_compat.0);
        put_be_u32(w, 216, self.features_incompat.0);
        put_be_u32(w, 220, self.features_log_incompat);
        put_le_u32(w, XFS_SB_CRC_OFFSET, self.crc);
        put_be_u32(w, 228, self.spino_align);
        put_be_u64(w, 232, self.pquotino);
        put_be_u64(w, 240, self.lsn);
        put_bytes(w, 248, &self.meta_uuid);
        put_be_u64(w, 264, self.metadirino);
        put_be_u32(w, 272, self.rgcount);
        put_be_u32(w, 276, self.rgextents);
        put_bytes(w, 280, &[self.rgblklog]);

        out
    }

    /// Filesystem label, trimmed at the first NUL.
    #[must_use]
    pub fn label(&self) -> String {
        trim_nul_padded(&self.fname)
    }

    #[must_use]
    pub fn uuid_string(&self) -> String {
        decode_uuid(&self.uuid)
    }

    #[must_use]
    pub fn root_inode(&self) -> InodeNumber {
        InodeNumber(self.rootino)
    }

    /// Allocated inodes that are in use.
    #[must_use]
    pub fn used_inodes(&self) -> u64 {
        self.icount.saturating_sub(self.ifree)
    }

    #[must_use]
    pub fn version(&self) -> u16 {
        self.versionnum & XFS_SB_VERSION_NUMBITS
    }

    /// Version 5 superblocks carry CRCs, UUID copies and LSNs in all metadata.
    #[must_use]
    pub fn has_crc(&self) -> bool {
        self.version() == XFS_SB_VERSION_5
    }

    #[must_use]
    pub fn has_incompat(&self, flag: XfsIncompatFeatures) -> bool {
        self.features_incompat.contains(flag)
    }

    #[must_use]
    pub fn has_ro_compat(&self, flag: XfsRoCompatFeatures) -> bool {
        self.features_ro_compat.contains(flag)
    }

    /// Check the invariants the rest of the decoder relies on.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        let block_size = BlockSize::new(self.blocksize)?;
        if u32::from(self.blocklog) != block_size.shift() {
            return Err(ParseError::InvalidField {
                field: "sb_blocklog",
                reason: "does not match sb_blocksize",
            });
        }

        let sector_size = SectorSize::new(self.sectsize)?;
        if u32::from(self.sectlog) != sector_size.shift() {
            return Err(ParseError::InvalidField {
                field: "sb_sectlog",
                reason: "does not match sb_sectsize",
            });
        }
        if u32::from(self.sectsize) > self.blocksize {
            return Err(ParseError::InvalidField {
                field: "sb_sectsize",
                reason: "larger than sb_blocksize",
            });
        }

        if self.agcount == 0 {
            return Err(ParseError::InvalidField {
                field: "sb_agcount",
                reason: "cannot be zero",
            });
        }
        if self.agblocks == 0 {
            return Err(ParseError::InvalidField {
                field: "sb_agblocks",
                reason: "cannot be zero",
            });
        }

        // The last group may be short, but by less than one full group.
        let agblocks = u64::from(self.agblocks);
        let full = u64::from(self.agcount)
            .checked_mul(agblocks)
            .ok_or(ParseError::IntegerConversion {
                field: "sb_agcount * sb_agblocks",
            })?;
        let all_but_last = full - agblocks;
        if self.dblocks > full || self.dblocks <= all_but_last {
            return Err(ParseError::InvalidField {
                field: "sb_dblocks",
                reason: "inconsistent with sb_agcount * sb_agblocks",
            });
        }

        Ok(())
    }

    /// Byte offset of allocation group `agno`'s first block.
    #[must_use]
    pub fn ag_start_offset(&self, agno: AgNumber) -> Option<ByteOffset> {
        ByteOffset(u64::from(agno.0))
            .checked_mul(u64::from(self.agblocks))?
            .checked_mul(u64::from(self.blocksize))
    }

    /// Byte offset of the AGI of allocation group `agno`.
    ///
    /// Each group starts with a sector holding a superblock copy, then a
    /// sector holding the AGF; the AGI follows those two sectors.
    #[must_use]
    pub fn agi_offset(&self, agno: AgNumber) -> Option<ByteOffset> {
        self.ag_start_offset(agno)?
            .checked_add(2 * u64::from(self.sectsize))
    }

    /// Locate an inode using the superblock's `agblklog` and `inopblog`.
    ///
    /// Returns `None` when the geometry makes the shifts meaningless or the
    /// offset overflows.
    #[must_use]
    pub fn locate_inode(&self, ino: InodeNumber) -> Option<InodeLocation> {
        let agino_bits = u32::from(self.agblklog) + u32::from(self.inopblog);
        if agino_bits >= 64 {
            return None;
        }
        let agno = ino.0 >> agino_bits;
        let agbno = (ino.0 >> self.inopblog) & low_mask(self.agblklog);
        let slot = ino.0 & low_mask(self.inopblog);

        let block = agno
            .checked_mul(u64::from(self.agblocks))?
            .checked_add(agbno)?;
        let byte_offset = block
            .checked_mul(u64::from(self.blocksize))?
            .checked_add(slot.checked_mul(u64::from(self.inodesize))?)?;

        Some(InodeLocation {
            agno: u32::try_from(agno).ok()?,
            agbno: u32::try_from(agbno).ok()?,
            slot: u32::try_from(slot).ok()?,
            byte_offset: ByteOffset(byte_offset),
        })
    }
}

fn low_mask(bits: u8) -> u64 {
    1_u64.checked_shl(u32::from(bits)).map_or(u64::MAX, |v| v - 1)
}

/// Where an inode lives, decoded with real superblock geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeLocation {
    pub agno: u32,
    pub agbno: u32,
    pub slot: u32,
    pub byte_offset: ByteOffset,
}

// ── Allocation-group inode header ──────────────────────────────────────────

/// AGI: the per-group inode management header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfsAgi {
    pub magicnum: u32,
    pub versionnum: u32,
    pub seqno: u32,
    pub length: u32,
    pub count: u32,
    pub root: u32,
    pub level: u32,
    pub freecount: u32,
    pub newino: u32,
    pub dirino: u32,
    /// Heads of the unlinked-inode hash buckets; `NULLAGINO` when empty.
    pub unlinked: Vec<u32>,
    pub uuid: [u8; 16],
    pub crc: u32,
    pub pad32: u32,
    pub lsn: u64,
    pub free_root: u32,
    pub free_level: u32,
    pub iblocks: u32,
    pub fblocks: u32,
}

impl Default for XfsAgi {
    fn default() -> Self {
        Self {
            magicnum: XFS_AGI_MAGIC,
            versionnum: 1,
            seqno: 0,
            length: 0,
            count: 0,
            root: 0,
            level: 0,
            freecount: 0,
            newino: NULLAGINO,
            dirino: NULLAGINO,
            unlinked: vec![NULLAGINO; XFS_AGI_UNLINKED_BUCKETS],
            uuid: [0; 16],
            crc: 0,
            pad32: 0,
            lsn: 0,
            free_root: 0,
            free_level: 0,
            iblocks: 0,
            fblocks: 0,
        }
    }
}

impl XfsAgi {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < XFS_AGI_SIZE {
            return Err(ParseError::InsufficientData {
                needed: XFS_AGI_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let magicnum = read_be_u32(bytes, 0)?;
        if magicnum != XFS_AGI_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: XFS_AGI_MAGIC,
                actual: magicnum,
            });
        }

        let unlinked = (0..XFS_AGI_UNLINKED_BUCKETS)
            .map(|bucket| read_be_u32(bytes, 40 + bucket * 4))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            magicnum,
            versionnum: read_be_u32(bytes, 4)?,
            seqno: read_be_u32(bytes, 8)?,
            length: read_be_u32(bytes, 12)?,
            count: read_be_u32(bytes, 16)?,
            root: read_be_u32(bytes, 20)?,
            level: read_be_u32(bytes, 24)?,
            freecount: read_be_u32(bytes, 28)?,
            newino: read_be_u32(bytes, 32)?,
            dirino: read_be_u32(bytes, 36)?,
            unlinked,
            uuid: read_fixed::<16>(bytes, 296)?,
            crc: read_le_u32(bytes, XFS_AGI_CRC_OFFSET)?,
            pad32: read_be_u32(bytes, 316)?,
            lsn: read_be_u64(bytes, 320)?,
            free_root: read_be_u32(bytes, 328)?,
            free_level: read_be_u32(bytes, 332)?,
            iblocks: read_be_u32(bytes, 336)?,
            fblocks: read_be_u32(bytes, 340)?,
        })
    }

    /// Write every decoded field back to its on-disk offset.
    ///
    /// Buckets missing from `unlinked` are written as `NULLAGINO`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; XFS_AGI_SIZE];
        let w = &mut out;

        put_be_u32(w, 0, self.magicnum);
        put_be_u32(w, 4, self.versionnum);
        put_be_u32(w, 8, self.seqno);
        put_be_u32(w, 12, self.length);
        put_be_u32(w, 16, self.count);
        put_be_u32(w, 20, self.root);
        put_be_u32(w, 24, self.level);
        put_be_u32(w, 28, self.freecount);
        put_be_u32(w, 32, self.newino);
        put_be_u32(w, 36, self.dirino);
        for bucket in 0..XFS_AGI_UNLINKED_BUCKETS {
            let head = self.unlinked.get(bucket).copied().unwrap_or(NULLAGINO);
            put_be_u32(w, 40 + bucket * 4, head);
        }
        put_bytes(w, 296, &self.uuid);
        put_le_u32(w, XFS_AGI_CRC_OFFSET, self.crc);
        put_be_u32(w, 316, self.pad32);
        put_be_u64(w, 320, self.lsn);
        put_be_u32(w, 328, self.free_root);
        put_be_u32(w, 332, self.free_level);
        put_be_u32(w, 336, self.iblocks);
        put_be_u32(w, 340, self.fblocks);

        out
    }

    /// The sequence number must equal the group's ordinal position.
    pub fn validate_seqno(&self, agno: AgNumber) -> Result<(), ParseError> {
        if self.seqno != agno.0 {
            return Err(ParseError::InvalidField {
                field: "agi_seqno",
                reason: "does not match allocation group index",
            });
        }
        Ok(())
    }

    /// Inodes allocated in this group that are in use.
    #[must_use]
    pub fn used_inodes(&self) -> u32 {
        self.count.saturating_sub(self.freecount)
    }

    /// Non-empty unlinked buckets as `(bucket, head agino)`.
    pub fn unlinked_heads(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.unlinked
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, head)| *head != NULLAGINO)
    }

    #[must_use]
    pub fn uuid_string(&self) -> String {
        decode_uuid(&self.uuid)
    }
}

// ── Field writers ──────────────────────────────────────────────────────────

fn put_bytes(out: &mut [u8], offset: usize, bytes: &[u8]) {
    out[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn put_be_u16(out: &mut [u8], offset: usize, value: u16) {
    put_bytes(out, offset, &value.to_be_bytes());
}

fn put_be_u32(out: &mut [u8], offset: usize, value: u32) {
    put_bytes(out, offset, &value.to_be_bytes());
}

fn put_be_u64(out: &mut [u8], offset: usize, value: u64) {
    put_bytes(out, offset, &value.to_be_bytes());
}

fn put_le_u32(out: &mut [u8], offset: usize, value: u32) {
    put_bytes(out, offset, &value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// A 4-AG, 4K-block, 512-byte-sector superblock shaped like mkfs.xfs output.
    fn sample_superblock() -> XfsSuperblock {
        let mut fname = [0_u8; XFS_LABEL_MAX];
        fname[..7].copy_from_slice(b"scratch");
        XfsSuperblock {
            magicnum: XFS_SB_MAGIC,
            blocksize: 4096,
            dblocks: 262_144,
            uuid: [
                0x3e, 0x1f, 0x4a, 0x2b, 0x9c, 0x0d, 0x4e, 0x5f, 0xa6, 0x07, 0x18, 0x29, 0x3a,
                0x4b, 0x5c, 0x6d,
            ],
            logstart: 131_078,
            rootino: 128,
            rbmino: 129,
            rsumino: 130,
            rextsize: 1,
            agblocks: 65_536,
            agcount: 4,
            logblocks: 16_384,
            versionnum: 0xB4A5,
            sectsize: 512,
            inodesize: 512,
            inopblock: 8,
            fname,
            blocklog: 12,
            sectlog: 9,
            inodelog: 9,
            inopblog: 3,
            agblklog: 16,
            imax_pct: 25,
            icount: 64,
            ifree: 61,
            fdblocks: 245_000,
            inoalignmt: 4,
            logsectsize: 0,
            features2: 0x18A,
            bad_features2: 0x18A,
            features_ro_compat: XfsRoCompatFeatures(0x0F),
            features_incompat: XfsIncompatFeatures(0x2B),
            crc: 0xDEAD_BEEF,
            spino_align: 4,
            lsn: 0x0000_0001_0000_0002,
            ..XfsSuperblock::default()
        }
    }

    fn superblock_block(sb: &XfsSuperblock) -> Vec<u8> {
        let mut block = sb.encode();
        block.resize(4096, 0);
        block
    }

    #[test]
    fn parse_four_ag_block() {
        let block = superblock_block(&sample_superblock());
        assert_eq!(&block[..4], b"XFSB");

        let sb = XfsSuperblock::parse(&block).expect("parse superblock");
        assert_eq!(sb.agcount, 4);
        assert_eq!(sb.agblocks, 65_536);
        assert_eq!(sb.blocksize, 4096);
        assert_eq!(sb.sectsize, 512);
        assert_eq!(sb.rootino, 128);
        assert_eq!(sb.label(), "scratch");
        assert_eq!(sb.uuid_string(), "3e1f4a2b-9c0d-4e5f-a607-18293a4b5c6d");
        assert_eq!(sb.used_inodes(), 3);
        assert_eq!(sb.version(), XFS_SB_VERSION_5);
        assert!(sb.has_crc());
        sb.validate_geometry().expect("geometry");
    }

    #[test]
    fn field_offsets_match_layout() {
        let block = superblock_block(&sample_superblock());
        assert_eq!(&block[4..8], &4096_u32.to_be_bytes());
        assert_eq!(&block[56..64], &128_u64.to_be_bytes());
        assert_eq!(&block[84..88], &65_536_u32.to_be_bytes());
        assert_eq!(&block[88..92], &4_u32.to_be_bytes());
        assert_eq!(&block[102..104], &512_u16.to_be_bytes());
        assert_eq!(&block[108..115], b"scratch");
        assert_eq!(block[120], 12);
        assert_eq!(block[124], 16);
        assert_eq!(&block[216..220], &0x2B_u32.to_be_bytes());
    }

    #[test]
    fn checksum_is_little_endian() {
        let block = superblock_block(&sample_superblock());
        assert_eq!(&block[224..228], &[0xEF, 0xBE, 0xAD, 0xDE]);
        let sb = XfsSuperblock::parse(&block).expect("parse");
        assert_eq!(sb.crc, 0xDEAD_BEEF);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut block = superblock_block(&sample_superblock());
        block[..4].copy_from_slice(b"XFSC");
        assert_eq!(
            XfsSuperblock::parse(&block),
            Err(ParseError::InvalidMagic {
                expected: XFS_SB_MAGIC,
                actual: 0x5846_5343,
            })
        );
    }

    #[test]
    fn rejects_truncated_buffer() {
        let block = superblock_block(&sample_superblock());
        assert_eq!(
            XfsSuperblock::parse(&block[..200]),
            Err(ParseError::InsufficientData {
                needed: XFS_SB_SIZE,
                offset: 0,
                actual: 200,
            })
        );
        // Exactly the structure length is enough.
        assert!(XfsSuperblock::parse(&block[..XFS_SB_SIZE]).is_ok());
    }

    #[test]
    fn geometry_rejects_bad_sizes() {
        let mut sb = sample_superblock();
        sb.blocksize = 3000;
        assert!(matches!(
            sb.validate_geometry(),
            Err(ParseError::InvalidField {
                field: "sb_blocksize",
                ..
            })
        ));

        let mut sb = sample_superblock();
        sb.sectsize = 768;
        assert!(matches!(
            sb.validate_geometry(),
            Err(ParseError::InvalidField {
                field: "sb_sectsize",
                ..
            })
        ));

        let mut sb = sample_superblock();
        sb.blocklog = 11;
        assert!(matches!(
            sb.validate_geometry(),
            Err(ParseError::InvalidField {
                field: "sb_blocklog",
                ..
            })
        ));
    }

    #[test]
    fn geometry_allows_short_last_group() {
        let mut sb = sample_superblock();
        sb.dblocks = 3 * 65_536 + 1;
        sb.validate_geometry().expect("one block in the last AG");

        sb.dblocks = 3 * 65_536;
        assert!(matches!(
            sb.validate_geometry(),
            Err(ParseError::InvalidField {
                field: "sb_dblocks",
                ..
            })
        ));

        sb.dblocks = 4 * 65_536 + 1;
        assert!(sb.validate_geometry().is_err());

        sb.dblocks = 262_144;
        sb.agcount = 0;
        assert!(matches!(
            sb.validate_geometry(),
            Err(ParseError::InvalidField {
                field: "sb_agcount",
                ..
            })
        ));
    }

    #[test]
    fn agi_offsets_skip_two_sectors() {
        let sb = sample_superblock();
        assert_eq!(sb.agi_offset(AgNumber(0)), Some(ByteOffset(1024)));
        assert_eq!(
            sb.agi_offset(AgNumber(1)),
            Some(ByteOffset(65_536 * 4096 + 1024))
        );
        assert_eq!(
            sb.agi_offset(AgNumber(3)),
            Some(ByteOffset(3 * 65_536 * 4096 + 1024))
        );
    }

    #[test]
    fn feature_flags_describe() {
        let sb = sample_superblock();
        assert_eq!(
            sb.features_incompat.describe(),
            vec!["FTYPE", "SPINODES", "BIGTIME", "NREXT64"]
        );
        assert!(sb.has_incompat(XfsIncompatFeatures::FTYPE));
        assert!(!sb.has_incompat(XfsIncompatFeatures::META_UUID));
        assert!(sb.has_ro_compat(XfsRoCompatFeatures::REFLINK));
        assert_eq!(
            sb.features_ro_compat.to_string(),
            "FINOBT|RMAPBT|REFLINK|INOBTCNT"
        );
        assert_eq!(
            XfsIncompatFeatures(0x1 | 0x8000).to_string(),
            "FTYPE|0x8000"
        );
        assert_eq!(XfsIncompatFeatures(0).to_string(), "(none)");
    }

    #[test]
    fn locate_inode_uses_geometry() {
        let sb = sample_superblock();
        let root = sb.locate_inode(InodeNumber(128)).expect("root");
        // inopblog=3: slot is the low 3 bits, block the next 16.
        assert_eq!(root.agno, 0);
        assert_eq!(root.agbno, 16);
        assert_eq!(root.slot, 0);
        assert_eq!(root.byte_offset, ByteOffset(16 * 4096));

        // agno 2, agbno 5, slot 3
        let ino = (2_u64 << 19) | (5 << 3) | 3;
        let loc = sb.locate_inode(InodeNumber(ino)).expect("loc");
        assert_eq!((loc.agno, loc.agbno, loc.slot), (2, 5, 3));
        assert_eq!(
            loc.byte_offset,
            ByteOffset((2 * 65_536 + 5) * 4096 + 3 * 512)
        );
    }

    fn sample_agi(seqno: u32) -> XfsAgi {
        let mut agi = XfsAgi {
            seqno,
            length: 65_536,
            count: 64,
            root: 3,
            level: 1,
            freecount: 61,
            newino: 128,
            uuid: sample_superblock().uuid,
            crc: 0x0102_0304,
            lsn: 0x0000_0001_0000_0010,
            free_root: 4,
            free_level: 1,
            iblocks: 1,
            fblocks: 1,
            ..XfsAgi::default()
        };
        agi.unlinked[5] = 0x0000_0083;
        agi
    }

    #[test]
    fn agi_parse_and_fields() {
        let bytes = sample_agi(2).encode();
        assert_eq!(&bytes[..4], b"XAGI");
        assert_eq!(&bytes[312..316], &[0x04, 0x03, 0x02, 0x01]);

        let agi = XfsAgi::parse(&bytes).expect("agi");
        assert_eq!(agi.seqno, 2);
        assert_eq!(agi.root, 3);
        assert_eq!(agi.level, 1);
        assert_eq!(agi.used_inodes(), 3);
        assert_eq!(agi.crc, 0x0102_0304);
        assert_eq!(agi.unlinked.len(), XFS_AGI_UNLINKED_BUCKETS);
        assert_eq!(agi.unlinked_heads().collect::<Vec<_>>(), vec![(5, 0x83)]);
        assert!(agi.validate_seqno(AgNumber(2)).is_ok());
        assert!(agi.validate_seqno(AgNumber(1)).is_err());
    }

    #[test]
    fn agi_rejects_superblock_magic() {
        let mut bytes = sample_agi(0).encode();
        bytes[..4].copy_from_slice(&XFS_SB_MAGIC.to_be_bytes());
        assert!(matches!(
            XfsAgi::parse(&bytes),
            Err(ParseError::InvalidMagic {
                expected: XFS_AGI_MAGIC,
                ..
            })
        ));
        assert!(matches!(
            XfsAgi::parse(&bytes[..100]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    proptest! {
        #[test]
        fn superblock_decode_encode_reproduces_bytes(
            body in proptest::collection::vec(any::<u8>(), XFS_SB_SIZE)
        ) {
            let mut bytes = body;
            bytes[..4].copy_from_slice(&XFS_SB_MAGIC.to_be_bytes());
            let sb = XfsSuperblock::parse(&bytes).expect("magic is valid");
            let encoded = sb.encode();
            // Everything except the 7 trailing pad bytes is decoded.
            prop_assert_eq!(&encoded[..281], &bytes[..281]);
            prop_assert!(encoded[281..].iter().all(|b| *b == 0));
        }

        #[test]
        fn agi_decode_encode_reproduces_bytes(
            body in proptest::collection::vec(any::<u8>(), XFS_AGI_SIZE)
        ) {
            let mut bytes = body;
            bytes[..4].copy_from_slice(&XFS_AGI_MAGIC.to_be_bytes());
            let agi = XfsAgi::parse(&bytes).expect("magic is valid");
            prop_assert_eq!(agi.encode(), bytes);
        }

        #[test]
        fn agi_offsets_increase_and_clear_superblock(
            agcount in 1_u32..64,
            agblocks in 1_u32..1_000_000,
            blocklog in 9_u32..17,
            sectlog in 9_u32..13,
        ) {
            let sb = XfsSuperblock {
                magicnum: XFS_SB_MAGIC,
                blocksize: 1 << blocklog,
                sectsize: 1 << sectlog,
                agcount,
                agblocks,
                ..XfsSuperblock::default()
            };
            let mut previous: Option<ByteOffset> = None;
            for agno in 0..agcount {
                let offset = sb.agi_offset(AgNumber(agno)).expect("no overflow");
                prop_assert!(offset.0 >= u64::from(sb.sectsize));
                if let Some(prev) = previous {
                    prop_assert!(offset > prev);
                }
                previous = Some(offset);
            }
        }
    }
}
