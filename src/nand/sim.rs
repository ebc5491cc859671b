//! A simulated in-memory NAND flash, for testing purposes
//!
//! Besides plain storage, the simulator can inject faults into individual blocks and cut the
//! power after a given number of program/erase operations. Taking a [SimNand::snapshot] after a
//! power cut gives the medium a fresh attach would see after a reboot.

use std::io::{Read, Write};

use parking_lot::{Mutex, MutexGuard};

use super::{EccStatus, Nand, NandError, NandLayout, PageUtil};

/// Faults that can be injected into one block of a [SimNand]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Faults {
    /// Reads report corrected bitflips; a successful erase clears this
    pub bitflips: bool,

    /// Reads report an uncorrectable ECC error (the stored data is still returned)
    pub uncorrectable: bool,

    /// Every program operation fails without writing anything
    pub program: bool,

    /// Every erase operation fails without erasing anything
    pub erase: bool,
}

/// A simulated in-memory NAND flash
#[derive(Debug)]
pub struct SimNand {
    blocks: Box<[Mutex<SimBlock>]>,
    layout: NandLayout,

    /// Whether blocks can be marked bad
    bad_allowed: bool,

    /// When armed, the number of page programs/erases left before the power "goes out"
    power: Mutex<Option<u64>>,
}

/// A block of SimNand
#[derive(Debug, Clone)]
struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// How many bytes per page
    page_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,

    /// How many times this block was successfully erased
    erase_count: u64,

    faults: Faults,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = (0..layout.blocks)
            .map(|_| Mutex::new(SimBlock::new(layout)))
            .collect();

        Self {
            blocks,
            layout,
            bad_allowed: true,
            power: Mutex::new(None),
        }
    }

    /// Simulate a device that has no way of marking blocks bad
    pub fn without_bad_blocks(mut self) -> Self {
        self.bad_allowed = false;
        self
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in self.blocks.iter_mut() {
            let block = block.get_mut();
            read.read_exact(&mut buf)?;
            block.data.clear();
            block.marked_bad = false;
            for (page, chunk) in buf.chunks(block.page_size).enumerate() {
                block.write_page(page as u32, chunk)?;
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in self.blocks.iter() {
            let block = block.lock();
            if block.marked_bad {
                buf.fill(0xBD);
            } else {
                for (page, chunk) in buf.chunks_mut(block.page_size).enumerate() {
                    block.read_page(page as u32, chunk);
                }
            }

            write.write_all(&buf)?;
        }

        Ok(())
    }

    /// Replace the faults injected into a block
    pub fn set_faults(&self, block: u32, faults: Faults) {
        if let Some(block) = self.blocks.get(block as usize) {
            block.lock().faults = faults;
        }
    }

    /// Remove every fault injected into a block
    pub fn clear_faults(&self, block: u32) {
        self.set_faults(block, Faults::default())
    }

    /// Let exactly `ops` more page programs (or erases) through, and fail all of them afterward
    pub fn cut_power_after(&self, ops: u64) {
        *self.power.lock() = Some(ops);
    }

    /// How many times the block has been erased since this simulator was created
    pub fn erase_count(&self, block: u32) -> u64 {
        self.blocks
            .get(block as usize)
            .map_or(0, |block| block.lock().erase_count)
    }

    /// Flip every bit of one stored byte, as a way of simulating silent corruption
    pub fn flip_byte(&self, block: u32, offset: usize) {
        if let Some(block) = self.blocks.get(block as usize) {
            let mut block = block.lock();
            if block.data.len() <= offset {
                block.data.resize(offset + 1, 0xFF);
            }
            block.data[offset] ^= 0xFF;
        }
    }

    /// Copy the medium as it is right now, as if the device was power-cycled: faults are gone and
    /// the power is back on.
    pub fn snapshot(&self) -> SimNand {
        let blocks = self
            .blocks
            .iter()
            .map(|block| {
                let mut block = block.lock().clone();
                block.faults = Faults::default();
                Mutex::new(block)
            })
            .collect();

        Self {
            blocks,
            layout: self.layout,
            bad_allowed: self.bad_allowed,
            power: Mutex::new(None),
        }
    }

    fn block(&self, index: u32) -> Result<MutexGuard<'_, SimBlock>, NandError> {
        self.blocks
            .get(index as usize)
            .map(|x| x.lock())
            .ok_or(NandError::OutOfRange(index))
    }

    /// Consume one operation from the power budget; false means the power is out
    fn has_power(&self) -> bool {
        match &mut *self.power.lock() {
            None => true,
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
        }
    }

    fn check_range(&self, block: u32, start_page: u32, bytes: usize) -> Result<(), NandError> {
        if bytes % self.layout.bytes_per_page != 0 {
            return Err(NandError::Unaligned(bytes));
        }
        let end = start_page + (bytes / self.layout.bytes_per_page) as u32;
        if end > self.layout.pages_per_block {
            return Err(NandError::PageRange {
                block,
                start: start_page,
                end,
            });
        }
        Ok(())
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            page_size: layout.bytes_per_page,
            marked_bad: false,
            erase_count: 0,
            faults: Faults::default(),
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> Result<(), NandError> {
        let begin = index as usize * self.page_size;

        // Writing fully-erased content is a no-op.
        if content.is_erased() {
            return Ok(());
        }

        if begin < self.data.len() {
            return Err(NandError::Rewrite {
                block: 0,
                page: index,
            });
        }

        self.data.resize(begin, 0xFF);
        self.data.extend_from_slice(content);
        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) {
        let begin = index as usize * self.page_size;

        match self.data.get(begin..) {
            Some(rest) if rest.len() >= self.page_size => {
                content.copy_from_slice(&rest[..self.page_size])
            }
            Some(rest) => {
                content[..rest.len()].copy_from_slice(rest);
                content[rest.len()..].fill(0xFF);
            }
            None => content.fill(0xFF),
        }
    }
}

impl Nand for SimNand {
    fn layout(&self) -> NandLayout {
        self.layout
    }

    fn read(&self, block: u32, start_page: u32, content: &mut [u8]) -> Result<EccStatus, NandError> {
        self.check_range(block, start_page, content.len())?;
        let blk = self.block(block)?;
        if blk.marked_bad {
            return Err(NandError::BadBlock(block));
        }

        for (page, chunk) in (start_page..).zip(content.chunks_mut(self.layout.bytes_per_page)) {
            blk.read_page(page, chunk);
        }

        Ok(match blk.faults {
            Faults {
                uncorrectable: true,
                ..
            } => EccStatus::Uncorrectable,
            Faults { bitflips: true, .. } => EccStatus::Corrected,
            _ => EccStatus::Clean,
        })
    }

    fn program(&self, block: u32, start_page: u32, content: &[u8]) -> Result<(), NandError> {
        self.check_range(block, start_page, content.len())?;
        let mut blk = self.block(block)?;
        if blk.marked_bad {
            return Err(NandError::BadBlock(block));
        }

        for (page, chunk) in (start_page..).zip(content.chunks(self.layout.bytes_per_page)) {
            if blk.faults.program || !self.has_power() {
                return Err(NandError::ProgramFailed { block, page });
            }
            blk.write_page(page, chunk).map_err(|err| match err {
                NandError::Rewrite { page, .. } => NandError::Rewrite { block, page },
                err => err,
            })?;
        }

        Ok(())
    }

    fn erase(&self, block: u32) -> Result<(), NandError> {
        let mut blk = self.block(block)?;
        if blk.marked_bad {
            return Err(NandError::BadBlock(block));
        }
        if blk.faults.erase || !self.has_power() {
            return Err(NandError::EraseFailed(block));
        }

        blk.data.clear();
        blk.erase_count += 1;
        blk.faults.bitflips = false;
        Ok(())
    }

    fn is_bad(&self, block: u32) -> Result<bool, NandError> {
        Ok(self.block(block)?.marked_bad)
    }

    fn mark_bad(&self, block: u32) -> Result<(), NandError> {
        if !self.bad_allowed {
            return Err(NandError::Unsupported);
        }
        let mut blk = self.block(block)?;
        if !self.has_power() {
            return Err(NandError::Io(std::io::Error::other("power lost")));
        }
        blk.data.clear();
        blk.marked_bad = true;
        Ok(())
    }

    fn bad_allowed(&self) -> bool {
        self.bad_allowed
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
};

#[test]
fn test_sim_block() {
    let nand = SimNand::new(TEST_LAYOUT);
    assert!(!nand.is_bad(0).unwrap());
    assert!(!nand.is_bad(TEST_LAYOUT.blocks - 1).unwrap());
    assert!(nand.is_bad(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let nand = SimNand::new(TEST_LAYOUT);
    nand.mark_bad(0).unwrap();
    assert!(nand.is_bad(0).unwrap());
    assert!(nand.erase(0).is_err());

    let nand = SimNand::new(TEST_LAYOUT).without_bad_blocks();
    assert!(matches!(nand.mark_bad(0), Err(NandError::Unsupported)));
}

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
    let mut data_out = data_in.clone();

    nand.program(0, 2, &data_in)?;
    assert!(nand.program(0, 1, &data_in).is_err());

    nand.read(0, 1, &mut data_out)?;
    assert!(data_out.is_erased());

    assert_eq!(nand.read(0, 2, &mut data_out)?, EccStatus::Clean);
    assert_eq!(data_out, data_in);

    nand.read(0, 3, &mut data_out)?;
    assert!(data_out.is_erased());

    nand.erase(0)?;
    nand.program(0, 1, &data_in)?;
    assert_eq!(nand.erase_count(0), 1);

    Ok(())
}

#[test]
fn test_sim_load() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut std::io::repeat(0x55u8))?;

    let mut buf = vec![0u8; TEST_LAYOUT.block_size()];
    nand.read(0, 0, &mut buf)?;
    assert!(buf.iter().all(|&x| x == 0x55u8));

    let mut saved = Vec::new();
    nand.save(&mut saved)?;
    assert_eq!(saved.len(), TEST_LAYOUT.block_size() * TEST_LAYOUT.blocks as usize);

    Ok(())
}

#[test]
fn test_sim_faults() -> anyhow::Result<()> {
    let nand = SimNand::new(TEST_LAYOUT);
    let page = vec![0x11u8; TEST_LAYOUT.bytes_per_page];
    let mut buf = page.clone();

    nand.program(1, 0, &page)?;
    nand.set_faults(
        1,
        Faults {
            bitflips: true,
            ..Default::default()
        },
    );
    assert_eq!(nand.read(1, 0, &mut buf)?, EccStatus::Corrected);
    assert_eq!(buf, page);

    nand.set_faults(
        1,
        Faults {
            uncorrectable: true,
            program: true,
            erase: true,
            ..Default::default()
        },
    );
    assert_eq!(nand.read(1, 0, &mut buf)?, EccStatus::Uncorrectable);
    assert!(matches!(
        nand.program(1, 1, &page),
        Err(NandError::ProgramFailed { block: 1, page: 1 })
    ));
    assert!(matches!(nand.erase(1), Err(NandError::EraseFailed(1))));

    nand.clear_faults(1);
    nand.set_faults(
        1,
        Faults {
            bitflips: true,
            ..Default::default()
        },
    );
    nand.erase(1)?;
    assert_eq!(nand.read(1, 0, &mut buf)?, EccStatus::Clean);

    Ok(())
}

#[test]
fn test_sim_power_cut() -> anyhow::Result<()> {
    let nand = SimNand::new(TEST_LAYOUT);
    let pages = vec![0x22u8; TEST_LAYOUT.bytes_per_page * 3];

    nand.cut_power_after(2);
    assert!(nand.program(2, 0, &pages).is_err());
    assert!(nand.erase(3).is_err());

    let rebooted = nand.snapshot();
    let mut buf = vec![0u8; pages.len()];
    rebooted.read(2, 0, &mut buf)?;
    assert_eq!(buf[..2 * TEST_LAYOUT.bytes_per_page], pages[..2 * TEST_LAYOUT.bytes_per_page]);
    assert!(buf[2 * TEST_LAYOUT.bytes_per_page..].is_erased());
    rebooted.erase(3)?;

    Ok(())
}
