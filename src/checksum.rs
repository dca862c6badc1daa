//! Sampled CRC32 probes of a basis volume.
//!
//! The sender hashes runs of the basis at the blocks it is about to
//! describe; the receiver recomputes the same hashes on its local basis
//! before touching anything, which catches a broken incremental chain
//! without shipping the basis contents.

use std::{fmt, ops::Range};

use log::{debug, info};
use serde::Serialize;

use crate::{
    blkdev::SECTOR_SIZE,
    delta::DeltaEntry,
    device::DeviceOps,
    error::{ConsistencyError, Error, Result},
    utils::SimpleProgress,
};

pub(crate) const HASH_TYPE_CRC32: &str = "CRC32";

/// How much of the basis is sampled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub(crate) enum DetectLevel {
    /// No hashes.
    #[default]
    Off = 0,
    /// The leading block of the first island only.
    Head = 1,
    /// The leading block of every island.
    Sparse = 2,
    /// Every block of every island.
    Full = 3,
}

impl TryFrom<u8> for DetectLevel {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(DetectLevel::Off),
            1 => Ok(DetectLevel::Head),
            2 => Ok(DetectLevel::Sparse),
            3 => Ok(DetectLevel::Full),
            v => Err(format!("detect level must be 0 to 3, got {v}")),
        }
    }
}

impl From<DetectLevel> for u8 {
    fn from(level: DetectLevel) -> Self {
        level as u8
    }
}

impl fmt::Display for DetectLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Digest of a contiguous byte range of the basis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct BlockHash {
    /// In sectors.
    pub offset: u64,
    /// In sectors.
    pub length: u64,
    pub hash_type: String,
    /// Lower-case hex.
    pub value: String,
}

impl BlockHash {
    /// The hashed bytes; None if the sector numbers overflow.
    pub fn byte_range(&self) -> Option<Range<u64>> {
        let start = self.offset.checked_mul(SECTOR_SIZE)?;
        let end = start.checked_add(self.length.checked_mul(SECTOR_SIZE)?)?;
        Some(start..end)
    }
}

/// Maximal runs of index-adjacent entries, as index ranges into `entries`.
pub(crate) fn islands(entries: &[DeltaEntry]) -> Vec<Range<usize>> {
    let mut result = Vec::new();
    let mut start = 0;
    for i in 1..=entries.len() {
        let adjacent =
            i < entries.len() && entries[i].origin_block == entries[i - 1].origin_block + 1;
        if !adjacent {
            result.push(start..i);
            start = i;
        }
    }
    result
}

/// Hashes the basis device at the islands of `entries`.
///
/// Entries at or past the end of the basis (a target that has grown) have
/// nothing to compare against and are left out.
pub(crate) fn sample(
    ops: &mut DeviceOps,
    block_size: u64,
    entries: &[DeltaEntry],
    level: DetectLevel,
) -> Result<Vec<BlockHash>> {
    if level == DetectLevel::Off {
        return Ok(Vec::new());
    }

    let basis_blocks = ops.size() / block_size;
    let inside = entries.partition_point(|e| e.origin_block < basis_blocks);
    if inside < entries.len() {
        debug!(
            "{} blocks past the end of the basis are not sampled",
            entries.len() - inside
        );
    }
    let entries = &entries[..inside];

    let islands = islands(entries);
    info!(
        "Sampling basis at level {} over {} islands",
        level,
        islands.len()
    );
    let mut pb = SimpleProgress::new(islands.len() as u64);
    let mut hashes = Vec::new();
    for (n, island) in islands.iter().enumerate() {
        pb.update(n as u64);

        let first = entries[island.start].origin_block;
        let blocks = match level {
            DetectLevel::Full => island.len() as u64,
            _ => 1,
        };
        let crc = ops.checksum_range(first * block_size, blocks * block_size)?;
        let hash = BlockHash {
            offset: first * block_size / SECTOR_SIZE,
            length: blocks * block_size / SECTOR_SIZE,
            hash_type: HASH_TYPE_CRC32.to_string(),
            value: format!("{crc:x}"),
        };
        debug!("Basis hash {:?}", hash);
        hashes.push(hash);

        if level == DetectLevel::Head {
            break;
        }
    }
    pb.finish();
    Ok(hashes)
}

/// Recomputes every hash against the local basis.
///
/// An empty list always passes.
pub(crate) fn verify(ops: &mut DeviceOps, hashes: &[BlockHash]) -> Result<()> {
    if hashes.is_empty() {
        return Ok(());
    }
    info!("Verifying {} basis hashes", hashes.len());

    let mut pb = SimpleProgress::new(hashes.len() as u64);
    for (n, hash) in hashes.iter().enumerate() {
        pb.update(n as u64);

        if hash.hash_type != HASH_TYPE_CRC32 {
            return Err(Error::scheme(format!(
                "unsupported basis hash type {}",
                hash.hash_type
            )));
        }
        let range = hash.byte_range().ok_or_else(|| {
            Error::scheme(format!(
                "basis hash {:X} {:X} out of range",
                hash.offset, hash.length
            ))
        })?;
        if range.end > ops.size() {
            return Err(ConsistencyError::VolumeTooSmall {
                actual: ops.size(),
                required: range.end,
            }
            .into());
        }
        let crc = ops.checksum_range(range.start, range.end - range.start)?;
        let actual = format!("{crc:x}");
        if !actual.eq_ignore_ascii_case(&hash.value) {
            return Err(ConsistencyError::BasisMismatch {
                offset: hash.offset,
                length: hash.length,
                expected: hash.value.clone(),
                actual,
            }
            .into());
        }
    }
    pb.finish();
    info!("Basis hashes match");
    Ok(())
}
