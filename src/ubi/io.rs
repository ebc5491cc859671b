//! The UBI I/O layer: where the headers and data live inside a PEB, how header reads are
//! classified, and how PEBs are erased (and tortured).
//!
//! Every PEB starts with the EC header in page 0, followed by the VID header in page 1. LEB data
//! begins at page 2 and runs to the end of the PEB.

use retry::{delay::Fixed, retry, OperationResult};
use tracing::{debug, error, warn};

use super::error::{Result, UbiError};
use super::headers::{Ec, Vid, UBI_HDR_SIZE};
use crate::nand::{EccStatus, Nand, NandError, PageUtil};

/// How many times an I/O operation is tried before the failure is taken seriously
pub const UBI_IO_RETRIES: usize = 3;

/// The patterns written by the torture test
const TORTURE_PATTERNS: [u8; 3] = [0xA5, 0x5A, 0x00];

/// The outcome of reading an EC or VID header
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum HdrStatus<T> {
    /// A valid header
    Valid(T),

    /// A valid header, but the ECC had to correct bitflips (or gave up, yet the CRC still matches)
    Corrected(T),

    /// Nothing but 0xFF bytes
    Empty,

    /// Nothing but 0xFF bytes, but the ECC complained
    EmptyBitflips,

    /// Something is there, but it's not a valid header
    Bad,

    /// Not a valid header, and the ECC reported an uncorrectable error
    BadEbadmsg,
}

impl<T> HdrStatus<T> {
    /// The header, if one was found
    pub fn header(&self) -> Option<&T> {
        match self {
            Self::Valid(hdr) | Self::Corrected(hdr) => Some(hdr),
            _ => None,
        }
    }

    /// Classify the bytes of a header area
    fn classify(bytes: &[u8], ecc: EccStatus, decode: impl FnOnce(&[u8]) -> Option<T>) -> Self {
        match (decode(bytes), ecc) {
            (Some(hdr), EccStatus::Clean) => Self::Valid(hdr),
            // Even an uncorrectable read with a matching CRC is trusted, but the PEB gets scrubbed
            (Some(hdr), _) => Self::Corrected(hdr),
            (None, EccStatus::Clean) if bytes.is_erased() => Self::Empty,
            (None, _) if bytes.is_erased() => Self::EmptyBitflips,
            (None, EccStatus::Uncorrectable) => Self::BadEbadmsg,
            (None, _) => Self::Bad,
        }
    }
}

/// UBI's view of the flash: PEBs made of headers and an LEB data area
#[derive(Debug)]
pub struct UbiIo<N> {
    nand: N,

    /// The number of PEBs (= NAND blocks)
    pub peb_count: u32,

    /// The minimal I/O unit (= NAND page size)
    pub min_io_size: usize,

    /// Byte offset of the VID header within a PEB
    pub vid_hdr_offset: usize,

    /// Byte offset of the LEB data within a PEB
    pub leb_start: usize,

    /// Bytes of LEB data per PEB
    pub leb_size: usize,

    /// The size of the whole PEB
    pub peb_size: usize,

    /// Whether PEBs can be marked bad
    pub bad_allowed: bool,
}

impl<N: Nand> UbiIo<N> {
    pub fn new(nand: N) -> Result<Self> {
        let layout = nand.layout();
        if layout.pages_per_block < 3 {
            return Err(anyhow::anyhow!("need at least 3 pages per block").into());
        }
        if layout.bytes_per_page < UBI_HDR_SIZE {
            return Err(anyhow::anyhow!("pages must hold at least {UBI_HDR_SIZE} bytes").into());
        }

        let min_io_size = layout.bytes_per_page;
        let bad_allowed = nand.bad_allowed();
        Ok(Self {
            nand,
            peb_count: layout.blocks,
            min_io_size,
            vid_hdr_offset: min_io_size,
            leb_start: 2 * min_io_size,
            leb_size: layout.block_size() - 2 * min_io_size,
            peb_size: layout.block_size(),
            bad_allowed,
        })
    }

    /// The prototype EC header for this layout
    pub fn ec_prototype(&self, image_seq: u32) -> Ec {
        Ec {
            ec: 0,
            vid_hdr_offset: self.vid_hdr_offset as u32,
            data_offset: self.leb_start as u32,
            image_seq,
        }
    }

    /// Read `buf.len()` bytes from `offset` within the PEB, which need not be page aligned
    ///
    /// Uncorrectable reads are retried; if the ECC keeps failing, the data is returned anyway and
    /// the status says so.
    pub fn read(&self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<EccStatus> {
        let page_size = self.min_io_size;
        let first_page = offset / page_size;
        let end_page = (offset + buf.len()).div_ceil(page_size);
        if end_page * page_size > self.peb_size {
            return Err(UbiError::Range {
                offset,
                len: buf.len(),
            });
        }
        if buf.is_empty() {
            return Ok(EccStatus::Clean);
        }

        let mut pages = vec![0u8; (end_page - first_page) * page_size];
        let result = retry(Fixed::from_millis(0).take(UBI_IO_RETRIES), || {
            match self.nand.read(pnum, first_page as u32, &mut pages) {
                Ok(EccStatus::Uncorrectable) => OperationResult::Retry(None),
                Ok(status) => OperationResult::Ok(status),
                Err(err) if err.is_transient() => OperationResult::Retry(Some(err)),
                Err(err) => OperationResult::Err(Some(err)),
            }
        });

        let status = match result {
            Ok(status) => status,
            Err(err) => match err.error {
                None => {
                    warn!(
                        "uncorrectable ECC error reading {} bytes from PEB {pnum}:{offset}",
                        buf.len()
                    );
                    EccStatus::Uncorrectable
                }
                Some(err) => {
                    error!("error reading PEB {pnum}:{offset}: {err}");
                    return Err(err.into());
                }
            },
        };

        let skip = offset - first_page * page_size;
        buf.copy_from_slice(&pages[skip..skip + buf.len()]);
        Ok(status)
    }

    /// Write `data` at a page-aligned `offset`; the tail of the last page is padded with 0xFF
    pub fn write(&self, pnum: u32, offset: usize, data: &[u8]) -> Result<()> {
        let page_size = self.min_io_size;
        let padded = data.len().div_ceil(page_size) * page_size;
        if offset % page_size != 0 || offset + padded > self.peb_size {
            return Err(UbiError::Range {
                offset,
                len: data.len(),
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let page = (offset / page_size) as u32;
        let result = if padded == data.len() {
            self.nand.program(pnum, page, data)
        } else {
            let mut pages = vec![0xFFu8; padded];
            pages[..data.len()].copy_from_slice(data);
            self.nand.program(pnum, page, &pages)
        };

        result.map_err(|err| {
            error!("error writing {} bytes to PEB {pnum}:{offset}: {err}", data.len());
            err.into()
        })
    }

    /// Read from the LEB data area of a PEB
    pub fn read_data(&self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<EccStatus> {
        self.read(pnum, self.leb_start + offset, buf)
    }

    /// Write to the LEB data area of a PEB
    pub fn write_data(&self, pnum: u32, offset: usize, data: &[u8]) -> Result<()> {
        self.write(pnum, self.leb_start + offset, data)
    }

    /// Is the whole LEB data area still erased? Bitflips count as "erased", since they are the
    /// likely result of an interrupted erasure.
    pub fn data_area_erased(&self, pnum: u32) -> Result<bool> {
        let mut buf = vec![0u8; self.leb_size];
        Ok(match self.read_data(pnum, 0, &mut buf)? {
            EccStatus::Clean => buf.is_erased(),
            _ => true,
        })
    }

    pub fn read_ec_hdr(&self, pnum: u32) -> Result<HdrStatus<Ec>> {
        let mut buf = vec![0u8; UBI_HDR_SIZE];
        let ecc = self.read(pnum, 0, &mut buf)?;
        let status = HdrStatus::classify(&buf, ecc, Ec::decode);

        if let HdrStatus::Valid(ec) | HdrStatus::Corrected(ec) = status {
            if ec.vid_hdr_offset as usize != self.vid_hdr_offset
                || ec.data_offset as usize != self.leb_start
            {
                error!(
                    "PEB {pnum}: VID header offset {} / data offset {} do not match the layout",
                    ec.vid_hdr_offset, ec.data_offset
                );
                return Err(UbiError::Layout { pnum });
            }
        }

        Ok(status)
    }

    pub fn read_vid_hdr(&self, pnum: u32) -> Result<HdrStatus<Vid>> {
        let mut buf = vec![0u8; UBI_HDR_SIZE];
        let ecc = self.read(pnum, self.vid_hdr_offset, &mut buf)?;
        Ok(HdrStatus::classify(&buf, ecc, Vid::decode))
    }

    pub fn write_ec_hdr(&self, pnum: u32, ec: Ec) -> Result<()> {
        let mut buf = vec![0u8; self.min_io_size];
        ec.encode(&mut buf)?;
        self.write_hdr(pnum, 0, &buf)
    }

    pub fn write_vid_hdr(&self, pnum: u32, vid: Vid) -> Result<()> {
        let mut buf = vec![0u8; self.min_io_size];
        vid.encode(&mut buf)?;
        self.write_hdr(pnum, self.vid_hdr_offset, &buf)
    }

    /// Header writes are only retried on transient errors; a failed program is final
    fn write_hdr(&self, pnum: u32, offset: usize, page: &[u8]) -> Result<()> {
        let page_num = (offset / self.min_io_size) as u32;
        retry(Fixed::from_millis(0).take(UBI_IO_RETRIES), || {
            match self.nand.program(pnum, page_num, page) {
                Ok(()) => OperationResult::Ok(()),
                Err(err) if err.is_transient() => OperationResult::Retry(err),
                Err(err) => OperationResult::Err(err),
            }
        })
        .map_err(|err| {
            error!("error writing header to PEB {pnum}:{offset}: {}", err.error);
            err.error.into()
        })
    }

    /// Erase a PEB, optionally torturing it first; returns the number of erasures performed so
    /// the caller can advance the erase counter.
    pub fn sync_erase(&self, pnum: u32, torture: bool) -> Result<u64> {
        let mut erasures = 0;
        if torture {
            erasures += self.torture_peb(pnum)?;
        }

        self.do_sync_erase(pnum)?;
        Ok(erasures + 1)
    }

    fn do_sync_erase(&self, pnum: u32) -> Result<()> {
        debug!("erase PEB {pnum}");
        retry(Fixed::from_millis(0).take(UBI_IO_RETRIES), || {
            self.nand.erase(pnum)
        })
        .map_err(|err| {
            error!("cannot erase PEB {pnum}: {}", err.error);
            err.error.into()
        })
    }

    /// Erase the PEB and write/verify each test pattern across all of it; returns the number of
    /// erasures performed
    fn torture_peb(&self, pnum: u32) -> Result<u64> {
        debug!("run torture test for PEB {pnum}");
        let mut buf = vec![0u8; self.peb_size];

        for (i, &pattern) in TORTURE_PATTERNS.iter().enumerate() {
            self.do_sync_erase(pnum)?;

            // An erased PEB must read back as all 0xFF without the ECC getting involved
            let ecc = self.read(pnum, 0, &mut buf)?;
            if ecc != EccStatus::Clean {
                error!("read problems on freshly erased PEB {pnum}, must be bad");
                return Err(UbiError::Torture {
                    pnum,
                    reason: "bitflips after erase",
                });
            }
            if !buf.is_erased() {
                error!("erased PEB {pnum}, but a non-0xFF byte found");
                return Err(UbiError::Torture {
                    pnum,
                    reason: "not erased",
                });
            }

            buf.fill(pattern);
            self.write(pnum, 0, &buf).map_err(|err| match err {
                UbiError::Io(NandError::ProgramFailed { .. }) => UbiError::Torture {
                    pnum,
                    reason: "write failure",
                },
                err => err,
            })?;

            let ecc = self.read(pnum, 0, &mut buf)?;
            if ecc != EccStatus::Clean || buf.iter().any(|&x| x != pattern) {
                error!("pattern {pattern:#04x} checking failed for PEB {pnum}");
                return Err(UbiError::Torture {
                    pnum,
                    reason: "pattern mismatch",
                });
            }
            debug!("PEB {pnum} passed torture pass {}", i + 1);
        }

        Ok(TORTURE_PATTERNS.len() as u64)
    }

    /// Is the PEB marked bad? Devices without bad-block support never have bad PEBs.
    pub fn is_bad(&self, pnum: u32) -> Result<bool> {
        if !self.bad_allowed {
            return Ok(false);
        }
        Ok(self.nand.is_bad(pnum)?)
    }

    pub fn mark_bad(&self, pnum: u32) -> Result<()> {
        Ok(self.nand.mark_bad(pnum)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{Faults, NandLayout, SimNand};
    use std::sync::Arc;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 4,
        pages_per_block: 8,
        bytes_per_page: 64,
    };

    fn io() -> anyhow::Result<(Arc<SimNand>, UbiIo<Arc<SimNand>>)> {
        let nand = Arc::new(SimNand::new(TEST_LAYOUT));
        let io = UbiIo::new(nand.clone())?;
        Ok((nand, io))
    }

    #[test]
    fn test_layout() -> anyhow::Result<()> {
        let (_, io) = io()?;
        assert_eq!(io.leb_start, 128);
        assert_eq!(io.leb_size, 6 * 64);
        assert_eq!(io.peb_count, 4);

        let tiny = SimNand::new(NandLayout {
            blocks: 4,
            pages_per_block: 2,
            bytes_per_page: 64,
        });
        assert!(UbiIo::new(tiny).is_err());
        Ok(())
    }

    #[test]
    fn test_headers() -> anyhow::Result<()> {
        let (nand, io) = io()?;

        assert_eq!(io.read_ec_hdr(0)?, HdrStatus::Empty);
        assert_eq!(io.read_vid_hdr(0)?, HdrStatus::Empty);

        let ec = io.ec_prototype(7).ec(42);
        let vid = Vid::new(1, 2).sqnum(3);
        io.write_ec_hdr(0, ec)?;
        io.write_vid_hdr(0, vid)?;
        assert_eq!(io.read_ec_hdr(0)?, HdrStatus::Valid(ec));
        assert_eq!(io.read_vid_hdr(0)?, HdrStatus::Valid(vid));

        nand.set_faults(
            0,
            Faults {
                bitflips: true,
                ..Default::default()
            },
        );
        assert_eq!(io.read_ec_hdr(0)?, HdrStatus::Corrected(ec));
        assert_eq!(io.read_vid_hdr(1)?, HdrStatus::Empty);

        nand.clear_faults(0);
        nand.flip_byte(0, io.vid_hdr_offset + 9);
        assert_eq!(io.read_vid_hdr(0)?, HdrStatus::Bad);

        nand.set_faults(
            0,
            Faults {
                uncorrectable: true,
                ..Default::default()
            },
        );
        assert_eq!(io.read_vid_hdr(0)?, HdrStatus::BadEbadmsg);
        assert_eq!(io.read_ec_hdr(0)?, HdrStatus::Corrected(ec));

        // A header for some other layout is refused outright
        let foreign = Ec {
            vid_hdr_offset: 512,
            ..ec
        };
        io.write_ec_hdr(1, foreign)?;
        assert!(matches!(io.read_ec_hdr(1), Err(UbiError::Layout { pnum: 1 })));

        Ok(())
    }

    #[test]
    fn test_unaligned_io() -> anyhow::Result<()> {
        let (_, io) = io()?;

        let data: Vec<u8> = (0..100).collect();
        io.write_data(2, 64, &data)?;
        assert!(io.write_data(2, 10, &data).is_err());

        let mut buf = vec![0u8; 30];
        io.read_data(2, 64 + 50, &mut buf)?;
        assert_eq!(buf, data[50..80]);

        let mut buf = vec![0u8; 64];
        io.read_data(2, 64 + 100, &mut buf)?;
        assert!(buf[..28].is_erased());

        assert!(!io.data_area_erased(2)?);
        assert!(io.data_area_erased(3)?);
        Ok(())
    }

    #[test]
    fn test_torture() -> anyhow::Result<()> {
        let (nand, io) = io()?;

        io.write_data(1, 0, &[0u8; 64])?;
        assert_eq!(io.sync_erase(1, false)?, 1);
        assert_eq!(io.sync_erase(1, true)?, 4);
        assert_eq!(nand.erase_count(1), 5);
        assert!(io.data_area_erased(1)?);

        nand.set_faults(
            1,
            Faults {
                program: true,
                ..Default::default()
            },
        );
        let err = io.sync_erase(1, true).unwrap_err();
        assert!(err.is_media_failure(), "{err}");

        nand.set_faults(
            1,
            Faults {
                erase: true,
                ..Default::default()
            },
        );
        let err = io.sync_erase(1, false).unwrap_err();
        assert!(matches!(err, UbiError::Io(NandError::EraseFailed(1))));
        Ok(())
    }
}
