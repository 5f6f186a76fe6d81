//! Fork database persistence.
//!
//! The fork database round-trips through a single versioned file: an
//! 8-byte header (magic number and format version, both little-endian)
//! followed by the SBOR encoding of the snapshot. Files with an unknown
//! magic or a version outside the supported range are rejected at open.

use instafin_types::{BlockHeaderState, BlockId};
use sbor::prelude::*;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

/// Magic number identifying a fork database file ("FKDB").
pub const FORK_DB_MAGIC: u32 = 0x464b_4442;

/// Oldest file format version this build can read.
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Newest file format version this build can read (and the one it writes).
pub const MAX_SUPPORTED_VERSION: u32 = 1;

/// On-disk form of the fork database.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ForkDbSnapshot {
    /// The root block header state.
    pub root: BlockHeaderState,
    /// Every other node, in ascending block-number order so each block's
    /// parent precedes it.
    pub blocks: Vec<BlockHeaderState>,
    /// Id of the head at the time of the snapshot.
    pub head_id: BlockId,
}

/// Errors reading or writing the fork database file.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Filesystem failure.
    #[error("fork database I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file does not start with the fork database magic number.
    #[error("not a fork database file: bad magic {found:#010x}")]
    BadMagic {
        /// The magic number actually found.
        found: u32,
    },

    /// The file's format version is outside the supported range.
    #[error("unsupported fork database version {version} (supported: {min}..={max})")]
    UnsupportedVersion {
        /// Version found in the file.
        version: u32,
        /// Oldest supported version.
        min: u32,
        /// Newest supported version.
        max: u32,
    },

    /// The payload failed to decode.
    #[error("corrupt fork database payload: {0}")]
    Codec(String),
}

/// Write a snapshot to `path`, replacing any existing file.
pub fn write_snapshot(path: &Path, snapshot: &ForkDbSnapshot) -> Result<(), PersistenceError> {
    let payload =
        sbor::basic_encode(snapshot).map_err(|e| PersistenceError::Codec(format!("{e:?}")))?;

    let mut file = fs::File::create(path)?;
    file.write_all(&FORK_DB_MAGIC.to_le_bytes())?;
    file.write_all(&MAX_SUPPORTED_VERSION.to_le_bytes())?;
    file.write_all(&payload)?;
    file.sync_all()?;
    Ok(())
}

/// Read a snapshot from `path`.
pub fn read_snapshot(path: &Path) -> Result<ForkDbSnapshot, PersistenceError> {
    let mut file = fs::File::open(path)?;

    let mut word = [0u8; 4];
    file.read_exact(&mut word)?;
    let magic = u32::from_le_bytes(word);
    if magic != FORK_DB_MAGIC {
        return Err(PersistenceError::BadMagic { found: magic });
    }

    file.read_exact(&mut word)?;
    let version = u32::from_le_bytes(word);
    if !(MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&version) {
        return Err(PersistenceError::UnsupportedVersion {
            version,
            min: MIN_SUPPORTED_VERSION,
            max: MAX_SUPPORTED_VERSION,
        });
    }

    let mut payload = Vec::new();
    file.read_to_end(&mut payload)?;
    sbor::basic_decode(&payload).map_err(|e| PersistenceError::Codec(format!("{e:?}")))
}
