//! Error types for the UBI layer

use thiserror::Error;

use crate::nand::NandError;

pub type Result<T> = std::result::Result<T, UbiError>;

/// Errors returned by UBI operations
#[derive(Debug, Error)]
pub enum UbiError {
    /// The flash itself reported a failure
    #[error("flash error: {0}")]
    Io(#[from] NandError),

    /// The data could not be corrected by the ECC, even after retrying
    #[error("uncorrectable ECC error in PEB {pnum}")]
    Uncorrectable { pnum: u32 },

    /// A PEB failed the torture test and must not be used again
    #[error("PEB {pnum} failed the torture test: {reason}")]
    Torture { pnum: u32, reason: &'static str },

    /// An EC header exists but describes a different flash layout
    #[error("PEB {pnum} has an EC header for a different layout")]
    Layout { pnum: u32 },

    #[error("no free physical eraseblocks")]
    NoSpace,

    #[error("not enough physical eraseblocks: {needed} needed, {available} available")]
    NotEnoughPebs { needed: u32, available: u32 },

    #[error("UBI device is read-only")]
    ReadOnly,

    #[error("volume {0} does not exist")]
    NoVolume(u32),

    #[error("volume {0} already exists")]
    VolumeExists(u32),

    #[error("LEB {lnum} is out of range for volume {vol_id}")]
    LebRange { vol_id: u32, lnum: u32 },

    /// A byte range that is misaligned or extends past the end of the LEB
    #[error("bad range: offset {offset}, length {len}")]
    Range { offset: usize, len: usize },

    /// Data may only be appended to a mapped LEB; anything else has to go through atomic change
    #[error("LEB {vol_id}:{lnum} was already written at offset {offset}")]
    AlreadyWritten { vol_id: u32, lnum: u32, offset: usize },

    #[error("LEB {vol_id}:{lnum} is already mapped")]
    AlreadyMapped { vol_id: u32, lnum: u32 },

    /// Static volumes are only written through whole-volume updates
    #[error("volume {0} is static")]
    StaticVolume(u32),

    #[error("erase counter of PEB {pnum} overflowed")]
    EcOverflow { pnum: u32 },

    #[error("too many erroneous PEBs ({0})")]
    TooManyErroneous(usize),

    #[error(transparent)]
    Attach(#[from] AttachError),

    /// An internal consistency check failed
    #[error("self-check failed: {0}")]
    SelfCheck(String),

    /// The background worker is shutting down and takes no new work
    #[error("UBI device is shutting down")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UbiError {
    /// Does this error mean the PEB involved is physically failing?
    pub fn is_media_failure(&self) -> bool {
        match self {
            Self::Io(err) => err.is_media_failure(),
            Self::Torture { .. } => true,
            _ => false,
        }
    }

    /// Is it worth trying the same thing again later?
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(err) if err.is_transient())
    }
}

/// Reasons the medium could not be attached
#[derive(Debug, Error)]
pub enum AttachError {
    #[error(
        "PEBs {first} and {second} both hold LEB {vol_id}:{lnum} with sequence number {sqnum}"
    )]
    DuplicateSqnum {
        vol_id: u32,
        lnum: u32,
        sqnum: u64,
        first: u32,
        second: u32,
    },

    #[error("inconsistent VID header for volume {vol_id} in PEB {pnum}")]
    InconsistentVolume { vol_id: u32, pnum: u32 },

    #[error("{corrupted} PEBs are corrupted (limit {limit})")]
    TooManyCorrupted { corrupted: usize, limit: usize },

    #[error("flash contains non-UBI data ({maybe_bad} PEBs may be bad)")]
    NotUbi { maybe_bad: usize },

    #[error("erase counter {ec} of PEB {pnum} is too large")]
    EcTooLarge { pnum: u32, ec: u64 },
}

/// How an attempt to copy an LEB for wear-leveling or scrubbing ended, when it did not succeed
#[derive(Debug, Error)]
pub enum MoveError {
    /// The LEB was unmapped, its volume removed, or someone else wants it: nothing was changed
    #[error("move cancelled by a concurrent operation")]
    CancelRace,

    #[error("could not read the source PEB")]
    SourceRead,

    #[error("could not write the target PEB")]
    TargetWrite,

    #[error("bitflips when reading back the target PEB")]
    TargetBitflips,

    /// Something transient got in the way; try the same source again later
    #[error("move should be retried")]
    Retry,

    #[error(transparent)]
    Failed(#[from] UbiError),
}
