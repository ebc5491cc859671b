//! Abstractions and code to access NAND flash

use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod mtd;
mod sim;

pub use sim::{Faults, SimNand};

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;

    /// The length of this buffer once trailing erased bytes are dropped, rounded up to a multiple
    /// of `align` (but never past the end of the buffer)
    fn data_len(&self, align: usize) -> usize;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }

    fn data_len(&self, align: usize) -> usize {
        let used = self
            .iter()
            .rposition(|&x| x != 0xFF)
            .map_or(0, |last| last + 1);
        std::cmp::min(self.len(), used.div_ceil(align) * align)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// The number of bytes in one eraseblock
    pub fn block_size(&self) -> usize {
        self.pages_per_block as usize * self.bytes_per_page
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
        })
    }
}

/// What the ECC engine had to say about a read that otherwise completed
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Copy, Clone)]
pub enum EccStatus {
    /// No bitflips were seen
    Clean,

    /// Bitflips were seen and corrected; the data is good, but the block is degrading
    Corrected,

    /// The ECC could not correct the data; the buffer holds whatever the device returned
    Uncorrectable,
}

impl EccStatus {
    /// Combine the status of two reads, keeping the worse one
    pub fn worst(self, other: Self) -> Self {
        std::cmp::max(self, other)
    }
}

/// Errors reported by a NAND device
#[derive(Debug, Error)]
pub enum NandError {
    #[error("block {0} out of range")]
    OutOfRange(u32),

    #[error("block {block}, page range {start}..{end} out of bounds")]
    PageRange { block: u32, start: u32, end: u32 },

    #[error("buffer length {0} not a multiple of the page size")]
    Unaligned(usize),

    #[error("write to block {block} page {page}, which was already written")]
    Rewrite { block: u32, page: u32 },

    #[error("block {0} is marked bad")]
    BadBlock(u32),

    #[error("program failure on block {block}, page {page}")]
    ProgramFailed { block: u32, page: u32 },

    #[error("erase failure on block {0}")]
    EraseFailed(u32),

    #[error("this NAND cannot mark blocks bad")]
    Unsupported,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NandError {
    /// Whether the error indicates the medium itself failed (as opposed to a misuse of the API)
    pub fn is_media_failure(&self) -> bool {
        match self {
            Self::ProgramFailed { .. } | Self::EraseFailed(_) | Self::BadBlock(_) => true,
            Self::Io(err) => err.kind() != std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }

    /// Whether simply trying the same operation again might succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == std::io::ErrorKind::Interrupted)
    }
}

/// Represents a NAND flash device
///
/// All methods take `&self`: implementations serialize access to each block internally, so that
/// several threads may work on different blocks at once.
pub trait Nand: Send + Sync {
    /// Get the layout of the NAND
    fn layout(&self) -> NandLayout;

    /// Read an integral number of pages, starting at the specified page
    ///
    /// An uncorrectable ECC error is not an `Err`: `content` is still filled, and the status tells
    /// the caller how far to trust it.
    fn read(&self, block: u32, start_page: u32, content: &mut [u8]) -> Result<EccStatus, NandError>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Note that `start_page` must be greater than any previously-written page, or in other words,
    /// writing a page makes it and all skipped pages nonwritable. This is to comply with the
    /// sequential-write requirements of certain MLC NANDs.
    fn program(&self, block: u32, start_page: u32, content: &[u8]) -> Result<(), NandError>;

    /// Erase a block, making all pages writable again
    fn erase(&self, block: u32) -> Result<(), NandError>;

    /// Is the block marked bad?
    fn is_bad(&self, block: u32) -> Result<bool, NandError>;

    /// Marks the block as bad; it cannot be read, written or erased afterward.
    fn mark_bad(&self, block: u32) -> Result<(), NandError>;

    /// Whether this device can mark blocks bad at all
    fn bad_allowed(&self) -> bool {
        true
    }
}

impl<T: Nand + ?Sized> Nand for Arc<T> {
    fn layout(&self) -> NandLayout {
        (**self).layout()
    }
    fn read(&self, block: u32, start_page: u32, content: &mut [u8]) -> Result<EccStatus, NandError> {
        (**self).read(block, start_page, content)
    }
    fn program(&self, block: u32, start_page: u32, content: &[u8]) -> Result<(), NandError> {
        (**self).program(block, start_page, content)
    }
    fn erase(&self, block: u32) -> Result<(), NandError> {
        (**self).erase(block)
    }
    fn is_bad(&self, block: u32) -> Result<bool, NandError> {
        (**self).is_bad(block)
    }
    fn mark_bad(&self, block: u32) -> Result<(), NandError> {
        (**self).mark_bad(block)
    }
    fn bad_allowed(&self) -> bool {
        (**self).bad_allowed()
    }
}

#[test]
fn test_parse_layout() -> anyhow::Result<()> {
    let layout: NandLayout = "1024x64x2048".parse()?;
    assert_eq!(
        layout,
        NandLayout {
            blocks: 1024,
            pages_per_block: 64,
            bytes_per_page: 2048,
        }
    );
    assert_eq!(layout.block_size(), 128 * 1024);
    assert!("1024x64".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_data_len() {
    let mut buf = vec![0xFFu8; 64];
    assert_eq!(buf.data_len(16), 0);
    buf[0] = 0;
    assert_eq!(buf.data_len(16), 16);
    buf[16] = 0;
    assert_eq!(buf.data_len(16), 32);
    buf[63] = 0;
    assert_eq!(buf.data_len(16), 64);
    assert_eq!(buf[..60].data_len(16), 32);
    buf[59] = 0;
    assert_eq!(buf[..60].data_len(16), 60);
}
