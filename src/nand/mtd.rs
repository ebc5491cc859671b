//! NAND abstraction layer implementation over the Linux MTD subsystem

use super::{EccStatus, Nand, NandError, NandLayout};

use anyhow::bail;
use parking_lot::Mutex;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,

    /// ECC statistics are device-wide, so reads that look at them are serialized
    ecc_lock: Mutex<()>,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self {
            file,
            layout,
            ecc_lock: Mutex::new(()),
        })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Compute the offset of the first byte of a block
    fn base(&self, block: u32) -> u64 {
        self.layout.block_size() as u64 * u64::from(block)
    }

    /// Ensure that the byte count and starting page range is valid, and compute the /dev/mtdX
    /// offset for the page
    fn offset_for(&self, block: u32, start_page: u32, bytes: usize) -> Result<u64, NandError> {
        if block >= self.layout.blocks {
            return Err(NandError::OutOfRange(block));
        }
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

        Ok(self.base(block) + (self.layout.bytes_per_page as u64 * u64::from(start_page)))
    }

    fn ecc_stats(&self) -> Result<ioctl::mtd_ecc_stats, NandError> {
        let stats = unsafe {
            let mut stats = MaybeUninit::<ioctl::mtd_ecc_stats>::uninit();
            ioctl::eccgetstats(self.file.as_raw_fd(), stats.as_mut_ptr())
                .map_err(std::io::Error::from)?;
            stats.assume_init()
        };
        Ok(stats)
    }
}

impl Nand for MtdNand {
    fn layout(&self) -> NandLayout {
        self.layout
    }

    fn read(&self, block: u32, start_page: u32, content: &mut [u8]) -> Result<EccStatus, NandError> {
        let offset = self.offset_for(block, start_page, content.len())?;

        let _guard = self.ecc_lock.lock();
        let before = self.ecc_stats()?;
        let status = match self.file.read_exact_at(content, offset) {
            Ok(()) => EccStatus::Clean,
            Err(err) if err.raw_os_error() == Some(nix::libc::EUCLEAN) => EccStatus::Corrected,
            Err(err) if err.raw_os_error() == Some(nix::libc::EBADMSG) => EccStatus::Uncorrectable,
            Err(err) => return Err(err.into()),
        };
        let after = self.ecc_stats()?;

        let counted = if after.failed != before.failed {
            EccStatus::Uncorrectable
        } else if after.corrected != before.corrected {
            EccStatus::Corrected
        } else {
            EccStatus::Clean
        };

        Ok(status.worst(counted))
    }

    fn program(&self, block: u32, start_page: u32, content: &[u8]) -> Result<(), NandError> {
        let offset = self.offset_for(block, start_page, content.len())?;
        self.file
            .write_all_at(content, offset)
            .map_err(|err| match err.raw_os_error() {
                Some(nix::libc::EIO) => NandError::ProgramFailed {
                    block,
                    page: start_page,
                },
                _ => err.into(),
            })
    }

    fn erase(&self, block: u32) -> Result<(), NandError> {
        let erase_info = ioctl::erase_info_user {
            start: self.offset_for(block, 0, 0)? as u32,
            length: self.layout.block_size() as u32,
        };
        unsafe { ioctl::memerase(self.file.as_raw_fd(), &erase_info) }
            .map(|_| ())
            .map_err(|errno| match errno {
                nix::errno::Errno::EIO => NandError::EraseFailed(block),
                errno => std::io::Error::from(errno).into(),
            })
    }

    fn is_bad(&self, block: u32) -> Result<bool, NandError> {
        let block_base = self.offset_for(block, 0, 0)?;
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base) }
            .map_err(std::io::Error::from)?;
        Ok(bad != 0)
    }

    fn mark_bad(&self, block: u32) -> Result<(), NandError> {
        let block_base = self.offset_for(block, 0, 0)?;
        unsafe { ioctl::memsetbadblock(self.file.as_raw_fd(), &block_base) }
            .map_err(std::io::Error::from)?;
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(mut self) -> anyhow::Result<NandLayout> {
            if self.writesize == 1 {
                // Hack for debugging on mtdram devices
                self.writesize = 64;
            }

            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            let blocks = self.size / self.erasesize;
            let pages_per_block = self.erasesize / self.writesize;
            let bytes_per_page = self.writesize as usize;

            Ok(NandLayout {
                blocks,
                pages_per_block,
                bytes_per_page,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    #[repr(C)]
    pub struct mtd_ecc_stats {
        pub corrected: u32,
        pub failed: u32,
        pub badblocks: u32,
        pub bbtblocks: u32,
    }
    ioctl_read!(eccgetstats, MTD_IOC_MAGIC, 18, mtd_ecc_stats);
}
