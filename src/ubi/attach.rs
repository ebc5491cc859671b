//! This module rebuilds UBI's picture of the flash at attach time: every PEB is classified (from a
//! full scan, or from a fastmap summary through the same interface) and, where several PEBs claim
//! the same LEB, the authoritative one is picked.
//!
//! The result, [AttachInfo], is consumed once by the WL and EBA initialization.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, error, info, warn};

use super::config::UbiConfig;
use super::error::{AttachError, Result};
use super::headers::{Ec, Vid, VolType};
use super::io::{HdrStatus, UbiIo};
use super::{UBI_INTERNAL_VOL_START, UBI_MAX_ERASECOUNTER};
use crate::nand::{EccStatus, Nand};

/// What a single PEB looked like when its headers were read
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum PebScan {
    /// The PEB is marked bad, and cannot be accessed
    Bad,

    /// The state of both headers; the VID header is reported `Empty` if the EC header was
    Headers { ec: HdrStatus<Ec>, vid: HdrStatus<Vid> },
}

impl PebScan {
    /// Read the headers of one PEB and characterize them
    pub fn scan_peb<N: Nand>(io: &UbiIo<N>, pnum: u32) -> Result<Self> {
        if io.is_bad(pnum)? {
            return Ok(Self::Bad);
        }

        let ec = io.read_ec_hdr(pnum)?;
        let vid = match ec {
            // Nothing was ever written after an empty EC header
            HdrStatus::Empty | HdrStatus::EmptyBitflips => HdrStatus::Empty,
            _ => io.read_vid_hdr(pnum)?,
        };

        Ok(Self::Headers { ec, vid })
    }
}

/// A compact on-flash summary of the PEB states, which can stand in for a full scan
pub trait Fastmap {
    /// Produce one record per PEB, indexed by PEB number, or `None` if no usable summary exists
    fn load(&self, peb_count: u32) -> Option<Vec<PebScan>>;
}

/// Read the headers of every PEB, reporting progress as it goes
pub fn scan_all<N: Nand>(io: &UbiIo<N>) -> Result<Vec<PebScan>> {
    let rpt = howudoin::new()
        .label("Scanning PEBs")
        .set_len(u64::from(io.peb_count));

    // Grr, try_collect() isn't stable yet, so:
    let mut scans = Vec::with_capacity(io.peb_count as usize);
    for pnum in 0..io.peb_count {
        scans.push(PebScan::scan_peb(io, pnum)?);
        rpt.inc();
    }

    rpt.close();

    Ok(scans)
}

/// A PEB on one of the attach lists (free, erase, corrupted, alien)
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct AttachedPeb {
    pub pnum: u32,

    /// The erase counter; `None` while unknown, replaced by the mean once the scan is complete
    pub ec: Option<u64>,

    /// For erase-list PEBs: torture before reuse. Otherwise: bitflips were seen.
    pub scrub: bool,
}

/// A PEB holding an LEB
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct AttachedLeb {
    pub pnum: u32,
    pub ec: Option<u64>,

    /// Bitflips were seen, so the data should be moved elsewhere
    pub scrub: bool,

    pub vid: Vid,
}

/// Everything found on the flash about one volume
#[derive(Debug, Default, Clone)]
pub struct AttachedVolume {
    pub vol_id: u32,
    pub vol_type: VolType,

    /// For static volumes, the number of LEBs holding data
    pub used_ebs: u32,

    pub data_pad: u32,

    /// The highest LEB number seen
    pub highest_lnum: u32,

    /// The data size recorded for the LEB with the highest number
    pub last_data_size: u32,

    pub lebs: BTreeMap<u32, AttachedLeb>,
}

impl AttachedVolume {
    fn insert(&mut self, leb: AttachedLeb) {
        if self.lebs.is_empty() || leb.vid.lnum >= self.highest_lnum {
            self.highest_lnum = leb.vid.lnum;
            self.last_data_size = leb.vid.data_size;
        }
        self.lebs.insert(leb.vid.lnum, leb);
    }
}

/// The outcome of the attach scan
#[derive(Debug, Default)]
pub struct AttachInfo {
    pub volumes: BTreeMap<u32, AttachedVolume>,

    /// Erased PEBs with a valid EC header, ready for use
    pub free: Vec<AttachedPeb>,

    /// PEBs that must be erased before use
    pub erase: Vec<AttachedPeb>,

    /// PEBs whose VID header is corrupted but which hold data; preserved, and not used
    pub corrupted: Vec<AttachedPeb>,

    /// PEBs of internal volumes that nobody here understands; preserved, and not used
    pub alien: Vec<AttachedPeb>,

    /// PEBs marked bad
    pub bad: Vec<u32>,

    pub peb_count: u32,
    pub bad_peb_count: usize,
    pub empty_peb_count: usize,

    /// PEBs where both headers were unreadable
    pub maybe_bad_peb_count: usize,

    pub min_ec: u64,
    pub max_ec: u64,
    pub mean_ec: u64,
    ec_sum: u64,
    ec_count: u64,

    /// The highest sequence number seen in any VID header
    pub max_sqnum: u64,

    /// The most common image sequence number among the EC headers
    pub image_seq: u32,
    image_seqs: HashMap<u32, usize>,

    /// The flash contained nothing but erased PEBs
    pub is_empty: bool,

    /// The PEB records came from a fastmap summary rather than a full scan
    pub from_fastmap: bool,
}

/// How two PEBs claiming the same LEB compare
#[derive(Debug, Eq, PartialEq)]
struct Verdict {
    /// The second PEB is the authoritative one
    second_newer: bool,

    /// Bitflips were seen while checking the winner's data
    bitflips: bool,

    /// The loser's data CRC was checked and found wrong
    corrupted: bool,
}

impl AttachInfo {
    /// Classify every PEB and resolve LEB ownership, using the fastmap summary when one is
    /// available and describes every PEB
    pub fn attach<N: Nand>(
        io: &UbiIo<N>,
        fastmap: Option<&dyn Fastmap>,
        config: &UbiConfig,
    ) -> Result<Self> {
        let summary = fastmap
            .and_then(|fastmap| fastmap.load(io.peb_count))
            .filter(|scans| {
                let usable = scans.len() == io.peb_count as usize;
                if !usable {
                    warn!(
                        "fastmap describes {} PEBs instead of {}, falling back to a full scan",
                        scans.len(),
                        io.peb_count
                    );
                }
                usable
            });

        let from_fastmap = summary.is_some();
        let scans = match summary {
            Some(scans) => {
                info!("attaching by fastmap");
                scans
            }
            None => scan_all(io)?,
        };

        let mut ai = Self {
            peb_count: io.peb_count,
            min_ec: u64::MAX,
            from_fastmap,
            ..Default::default()
        };
        for (pnum, scan) in (0..).zip(scans) {
            ai.add_peb(io, pnum, scan)?;
        }
        ai.late_analysis(config)?;

        info!(
            "attached {} PEBs: {} volumes, {} free, {} to erase, {} corrupted, {} bad",
            ai.peb_count,
            ai.volumes.len(),
            ai.free.len(),
            ai.erase.len(),
            ai.corrupted.len(),
            ai.bad_peb_count
        );
        info!(
            "min EC {}, max EC {}, mean EC {}, max sqnum {}",
            ai.min_ec, ai.max_ec, ai.mean_ec, ai.max_sqnum
        );

        Ok(ai)
    }

    /// Account for one PEB
    fn add_peb<N: Nand>(&mut self, io: &UbiIo<N>, pnum: u32, scan: PebScan) -> Result<()> {
        let (ec_hdr, vid_hdr) = match scan {
            PebScan::Bad => {
                self.bad.push(pnum);
                self.bad_peb_count += 1;
                return Ok(());
            }
            PebScan::Headers { ec, vid } => (ec, vid),
        };

        let mut bitflips = false;
        let mut ec_err = false;
        let ec = match ec_hdr {
            HdrStatus::Valid(ec) => Some(ec),
            HdrStatus::Corrected(ec) => {
                bitflips = true;
                Some(ec)
            }
            HdrStatus::Empty | HdrStatus::EmptyBitflips => {
                // Erased, or never used: the erase counter is unknown
                self.empty_peb_count += 1;
                self.erase.push(AttachedPeb {
                    pnum,
                    ec: None,
                    scrub: ec_hdr == HdrStatus::EmptyBitflips,
                });
                return Ok(());
            }
            HdrStatus::Bad | HdrStatus::BadEbadmsg => {
                // Maybe an erasure was interrupted; the VID header decides
                ec_err = true;
                bitflips = true;
                None
            }
        };

        if let Some(ec) = ec {
            if ec.ec > UBI_MAX_ERASECOUNTER {
                error!("erase counter overflow at PEB {pnum}, EC {}", ec.ec);
                return Err(AttachError::EcTooLarge { pnum, ec: ec.ec }.into());
            }
            self.ec_sum += ec.ec;
            self.ec_count += 1;
            self.min_ec = std::cmp::min(self.min_ec, ec.ec);
            self.max_ec = std::cmp::max(self.max_ec, ec.ec);
            *self.image_seqs.entry(ec.image_seq).or_insert(0) += 1;
        }
        let ec = ec.map(|ec| ec.ec);

        let vid = match vid_hdr {
            HdrStatus::Valid(vid) => vid,
            HdrStatus::Corrected(vid) => {
                bitflips = true;
                vid
            }
            HdrStatus::Empty if !ec_err && !bitflips => {
                self.free.push(AttachedPeb {
                    pnum,
                    ec,
                    scrub: false,
                });
                return Ok(());
            }
            HdrStatus::Empty | HdrStatus::EmptyBitflips => {
                self.erase.push(AttachedPeb {
                    pnum,
                    ec,
                    scrub: false,
                });
                return Ok(());
            }
            HdrStatus::Bad | HdrStatus::BadEbadmsg => {
                if vid_hdr == HdrStatus::BadEbadmsg && ec_hdr == HdrStatus::BadEbadmsg {
                    self.maybe_bad_peb_count += 1;
                }

                if ec_err || io.data_area_erased(pnum)? {
                    // Both headers gone means an interrupted erasure, and a corrupted VID header
                    // with no data behind it means an interrupted VID header write: either way
                    // there is nothing worth keeping.
                    self.erase.push(AttachedPeb {
                        pnum,
                        ec,
                        scrub: true,
                    });
                } else {
                    warn!("corrupted VID header at PEB {pnum}, but the data area is not empty");
                    self.corrupted.push(AttachedPeb {
                        pnum,
                        ec,
                        scrub: false,
                    });
                }
                return Ok(());
            }
        };

        if ec_err {
            warn!("valid VID header but corrupted EC header at PEB {pnum}");
        }

        if vid.vol_id >= UBI_INTERNAL_VOL_START {
            info!("PEB {pnum} belongs to internal volume {:#x}, preserving it", vid.vol_id);
            self.alien.push(AttachedPeb { pnum, ec, scrub: false });
            return Ok(());
        }

        self.add_to_volume(io, pnum, ec, vid, bitflips)
    }

    /// Insert an LEB-carrying PEB into its volume, resolving collisions
    fn add_to_volume<N: Nand>(
        &mut self,
        io: &UbiIo<N>,
        pnum: u32,
        ec: Option<u64>,
        vid: Vid,
        bitflips: bool,
    ) -> Result<()> {
        let Vid { vol_id, lnum, .. } = vid;
        debug!(
            "PEB {pnum}, LEB {vol_id}:{lnum}, EC {ec:?}, sqnum {}, bitflips {bitflips}",
            vid.sqnum
        );
        self.max_sqnum = std::cmp::max(self.max_sqnum, vid.sqnum);

        let av = self.volumes.entry(vol_id).or_insert_with(|| AttachedVolume {
            vol_id,
            vol_type: vid.vol_type,
            used_ebs: vid.used_ebs,
            data_pad: vid.data_pad,
            ..Default::default()
        });

        let consistent = av.vol_type == vid.vol_type
            && av.data_pad == vid.data_pad
            && (vid.vol_type == VolType::Dynamic
                || (av.used_ebs == vid.used_ebs && lnum < vid.used_ebs));
        if !consistent {
            error!("inconsistent VID header at PEB {pnum}: {vid:?}");
            return Err(AttachError::InconsistentVolume { vol_id, pnum }.into());
        }

        let new = AttachedLeb {
            pnum,
            ec,
            scrub: bitflips,
            vid,
        };
        let Some(old) = av.lebs.get(&lnum).copied() else {
            av.insert(new);
            return Ok(());
        };

        debug!(
            "LEB {vol_id}:{lnum} found in PEBs {} (sqnum {}) and {pnum} (sqnum {})",
            old.pnum, old.vid.sqnum, vid.sqnum
        );
        let verdict = compare_lebs(io, &old, &new)?;
        let (mut winner, loser) = match verdict.second_newer {
            true => (new, old),
            false => (old, new),
        };
        winner.scrub |= verdict.bitflips;

        self.erase.push(AttachedPeb {
            pnum: loser.pnum,
            ec: loser.ec,
            scrub: verdict.corrupted,
        });
        if let Some(av) = self.volumes.get_mut(&vol_id) {
            av.insert(winner);
        }

        Ok(())
    }

    /// Checks and fix-ups that need the whole picture
    fn late_analysis(&mut self, config: &UbiConfig) -> Result<()> {
        let peb_count = self.peb_count as usize - self.bad_peb_count - self.alien.len();

        if !self.corrupted.is_empty() {
            let limit = config.corrupt_limit(peb_count);
            error!("{} PEBs are corrupted and preserved", self.corrupted.len());
            if self.corrupted.len() >= limit {
                error!("too many corrupted PEBs, refusing");
                return Err(AttachError::TooManyCorrupted {
                    corrupted: self.corrupted.len(),
                    limit,
                }
                .into());
            }
        }

        if self.empty_peb_count + self.maybe_bad_peb_count == peb_count {
            // All PEBs are empty, or almost all: a couple of unreadable ones may simply be bad
            if self.maybe_bad_peb_count <= 2 {
                self.is_empty = true;
                info!("empty flash device detected");
            } else {
                error!("flash is not UBI-formatted and possibly contains non-UBI data, refusing it");
                return Err(AttachError::NotUbi {
                    maybe_bad: self.maybe_bad_peb_count,
                }
                .into());
            }
        }

        self.mean_ec = self.ec_sum.checked_div(self.ec_count).unwrap_or(0);
        if self.ec_count == 0 {
            self.min_ec = self.mean_ec;
            self.max_ec = self.mean_ec;
        }

        let mean_ec = self.mean_ec;
        for peb in self
            .free
            .iter_mut()
            .chain(self.erase.iter_mut())
            .chain(self.corrupted.iter_mut())
            .chain(self.alien.iter_mut())
        {
            peb.ec.get_or_insert(mean_ec);
        }
        for leb in self.volumes.values_mut().flat_map(|av| av.lebs.values_mut()) {
            leb.ec.get_or_insert(mean_ec);
        }

        // Determine the mode of `image_seq`
        self.image_seq = std::mem::take(&mut self.image_seqs)
            .into_iter()
            .max_by_key(|&(seq, count)| (count, std::cmp::Reverse(seq)))
            .map_or(0, |(seq, _)| seq);

        Ok(())
    }

    /// Schedule every PEB of a volume for erasure
    pub fn remove_volume(&mut self, vol_id: u32) -> usize {
        let Some(av) = self.volumes.remove(&vol_id) else {
            return 0;
        };
        let count = av.lebs.len();
        self.erase.extend(av.lebs.into_values().map(|leb| AttachedPeb {
            pnum: leb.pnum,
            ec: leb.ec,
            scrub: false,
        }));
        count
    }

    /// Schedule the PEBs of LEBs numbered `reserved` or higher for erasure
    pub fn truncate_volume(&mut self, vol_id: u32, reserved: u32) -> usize {
        let Some(av) = self.volumes.get_mut(&vol_id) else {
            return 0;
        };
        let beyond = av.lebs.split_off(&reserved);
        let count = beyond.len();
        self.erase.extend(beyond.into_values().map(|leb| AttachedPeb {
            pnum: leb.pnum,
            ec: leb.ec,
            scrub: false,
        }));
        count
    }
}

/// Decide which of two PEBs claiming the same LEB is authoritative
///
/// The higher sequence number wins, unless it belongs to a copy whose data doesn't match its CRC:
/// then the copy was interrupted and the older PEB is still good. Equal sequence numbers only
/// happen for a wear-leveling copy and its source.
fn compare_lebs<N: Nand>(io: &UbiIo<N>, first: &AttachedLeb, second: &AttachedLeb) -> Result<Verdict> {
    if first.vid.sqnum == second.vid.sqnum {
        let duplicate = || AttachError::DuplicateSqnum {
            vol_id: second.vid.vol_id,
            lnum: second.vid.lnum,
            sqnum: second.vid.sqnum,
            first: first.pnum,
            second: second.pnum,
        };

        if !first.vid.copy_flag && !second.vid.copy_flag {
            error!("two LEBs with the same sequence number {}", second.vid.sqnum);
            return Err(duplicate().into());
        }

        if second.vid.copy_flag {
            let (ok, bitflips) = check_copy(io, second)?;
            if ok {
                return Ok(Verdict {
                    second_newer: true,
                    bitflips,
                    corrupted: false,
                });
            }
        }

        let (first_ok, bitflips) = match first.vid.copy_flag {
            true => check_copy(io, first)?,
            false => (true, false),
        };
        return match (first_ok, second.vid.copy_flag) {
            (true, second_copy) => Ok(Verdict {
                second_newer: false,
                bitflips,
                corrupted: second_copy,
            }),
            (false, false) => Ok(Verdict {
                second_newer: true,
                bitflips: false,
                corrupted: true,
            }),
            (false, true) => {
                error!("both copies of LEB {}:{} are corrupted", second.vid.vol_id, second.vid.lnum);
                Err(duplicate().into())
            }
        };
    }

    let second_newer = second.vid.sqnum > first.vid.sqnum;
    let newer = if second_newer { second } else { first };

    if !newer.vid.copy_flag {
        // It is not a copy, so it is newer
        return Ok(Verdict {
            second_newer,
            bitflips: false,
            corrupted: false,
        });
    }

    let (ok, bitflips) = check_copy(io, newer)?;
    if ok {
        Ok(Verdict {
            second_newer,
            bitflips,
            corrupted: false,
        })
    } else {
        warn!(
            "data CRC mismatch in PEB {}, using the older copy of LEB {}:{}",
            newer.pnum, newer.vid.vol_id, newer.vid.lnum
        );
        Ok(Verdict {
            second_newer: !second_newer,
            bitflips: false,
            corrupted: true,
        })
    }
}

/// Check the data of a copied LEB against its VID header; returns (matches, bitflips)
fn check_copy<N: Nand>(io: &UbiIo<N>, leb: &AttachedLeb) -> Result<(bool, bool)> {
    let len = leb.vid.data_size as usize;
    if len > io.leb_size {
        return Ok((false, false));
    }

    let mut buf = vec![0u8; len];
    let ecc = io.read_data(leb.pnum, 0, &mut buf)?;
    Ok((leb.vid.verify(&buf), ecc != EccStatus::Clean))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{Faults, NandLayout, SimNand};
    use crate::ubi::UbiError;
    use std::sync::Arc;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 16,
        pages_per_block: 8,
        bytes_per_page: 64,
    };

    fn io() -> anyhow::Result<(Arc<SimNand>, UbiIo<Arc<SimNand>>)> {
        let nand = Arc::new(SimNand::new(TEST_LAYOUT));
        let io = UbiIo::new(nand.clone())?;
        Ok((nand, io))
    }

    /// Write an EC header with the given erase counter to every PEB
    fn format(io: &UbiIo<Arc<SimNand>>, ec: u64) -> anyhow::Result<()> {
        for pnum in 0..io.peb_count {
            io.write_ec_hdr(pnum, io.ec_prototype(1).ec(ec))?;
        }
        Ok(())
    }

    /// Write an LEB, the way a mapping write would
    fn put_leb(io: &UbiIo<Arc<SimNand>>, pnum: u32, vid: Vid, data: &[u8]) -> anyhow::Result<()> {
        io.write_vid_hdr(pnum, vid)?;
        io.write_data(pnum, 0, data)?;
        Ok(())
    }

    #[test]
    fn test_empty() -> anyhow::Result<()> {
        let (_, io) = io()?;

        let ai = AttachInfo::attach(&io, None, &UbiConfig::default())?;
        assert!(ai.is_empty);
        assert_eq!(ai.erase.len(), 16);
        assert!(ai.erase.iter().all(|peb| peb.ec == Some(0)));
        assert!(ai.volumes.is_empty());
        Ok(())
    }

    #[test]
    fn test_classify() -> anyhow::Result<()> {
        let (nand, io) = io()?;
        format(&io, 10)?;

        // PEB 0 is bad, 1 holds an LEB, 2 has a corrupted VID header over data, 3 has a corrupted
        // VID header over nothing, 4 lost its EC header, 5 is erased, the rest are free
        nand.mark_bad(0)?;
        put_leb(&io, 1, Vid::new(0, 0).sqnum(1), b"data")?;
        put_leb(&io, 2, Vid::new(0, 1).sqnum(2), b"data")?;
        nand.flip_byte(2, io.vid_hdr_offset + 10);
        io.write_vid_hdr(3, Vid::new(0, 2).sqnum(3))?;
        nand.flip_byte(3, io.vid_hdr_offset + 10);
        nand.flip_byte(4, 10);
        nand.erase(5)?;

        let ai = AttachInfo::attach(&io, None, &UbiConfig::default())?;
        assert!(!ai.is_empty);
        assert_eq!(ai.bad, [0]);
        assert_eq!(ai.corrupted.iter().map(|p| p.pnum).collect::<Vec<_>>(), [2]);
        let mut erase: Vec<_> = ai.erase.iter().map(|p| p.pnum).collect();
        erase.sort();
        assert_eq!(erase, [3, 4, 5]);
        assert_eq!(ai.free.len(), 16 - 6);
        assert_eq!(ai.volumes[&0].lebs[&0].pnum, 1);
        assert_eq!(ai.max_sqnum, 1);
        assert_eq!(ai.mean_ec, 10);
        assert_eq!(ai.image_seq, 1);

        // PEBs with an unknown erase counter get the mean
        assert!(ai.erase.iter().all(|peb| peb.ec == Some(10)));
        Ok(())
    }

    #[test]
    fn test_newer_sqnum_wins() -> anyhow::Result<()> {
        let (_, io) = io()?;
        format(&io, 1)?;

        put_leb(&io, 4, Vid::new(3, 5).sqnum(10), b"new")?;
        put_leb(&io, 9, Vid::new(3, 5).sqnum(7), b"old")?;

        let ai = AttachInfo::attach(&io, None, &UbiConfig::default())?;
        let leb = ai.volumes[&3].lebs[&5];
        assert_eq!((leb.pnum, leb.vid.sqnum), (4, 10));
        assert!(ai.erase.iter().any(|peb| peb.pnum == 9 && !peb.scrub));
        assert_eq!(ai.max_sqnum, 10);
        Ok(())
    }

    #[test]
    fn test_broken_copy_loses() -> anyhow::Result<()> {
        let (nand, io) = io()?;
        format(&io, 1)?;

        // An atomic change to LEB 0:0 was interrupted halfway through its data
        put_leb(&io, 2, Vid::new(0, 0).sqnum(4), b"old")?;
        let mut vid = Vid::new(0, 0).sqnum(8).covering(&[0xAB; 200]);
        vid.copy_flag = true;
        put_leb(&io, 6, vid, &[0xAB; 128])?;

        let ai = AttachInfo::attach(&io, None, &UbiConfig::default())?;
        assert_eq!(ai.volumes[&0].lebs[&0].pnum, 2);
        assert!(ai.erase.iter().any(|peb| peb.pnum == 6 && peb.scrub));

        // A complete copy wins, even with a flipped bit that the ECC corrected
        nand.erase(6)?;
        io.write_ec_hdr(6, io.ec_prototype(1).ec(2))?;
        put_leb(&io, 6, vid, &[0xAB; 200])?;
        nand.set_faults(
            6,
            Faults {
                bitflips: true,
                ..Default::default()
            },
        );
        let ai = AttachInfo::attach(&io, None, &UbiConfig::default())?;
        let leb = ai.volumes[&0].lebs[&0];
        assert_eq!(leb.pnum, 6);
        assert!(leb.scrub);
        Ok(())
    }

    #[test]
    fn test_equal_sqnum() -> anyhow::Result<()> {
        let (_, io) = io()?;
        format(&io, 1)?;

        // A wear-leveling move keeps the sequence number and sets the copy flag
        put_leb(&io, 1, Vid::new(0, 0).sqnum(5), b"moved")?;
        let mut copy = Vid::new(0, 0).sqnum(5).covering(b"moved");
        copy.copy_flag = true;
        put_leb(&io, 2, copy, b"moved")?;

        let ai = AttachInfo::attach(&io, None, &UbiConfig::default())?;
        assert_eq!(ai.volumes[&0].lebs[&0].pnum, 2);
        assert!(ai.erase.iter().any(|peb| peb.pnum == 1));

        // Without a copy flag, there is no telling which is right
        put_leb(&io, 3, Vid::new(0, 1).sqnum(6), b"a")?;
        put_leb(&io, 4, Vid::new(0, 1).sqnum(6), b"b")?;
        let err = AttachInfo::attach(&io, None, &UbiConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            UbiError::Attach(AttachError::DuplicateSqnum { sqnum: 6, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_inconsistent_volume() -> anyhow::Result<()> {
        let (_, io) = io()?;
        format(&io, 1)?;

        put_leb(&io, 1, Vid::new(0, 0).sqnum(1), b"x")?;
        let mut vid = Vid::new(0, 1).sqnum(2);
        vid.vol_type = VolType::Static;
        vid.used_ebs = 2;
        put_leb(&io, 2, vid, b"x")?;

        let err = AttachInfo::attach(&io, None, &UbiConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            UbiError::Attach(AttachError::InconsistentVolume { vol_id: 0, pnum: 2 })
        ));
        Ok(())
    }

    #[test]
    fn test_too_many_corrupted() -> anyhow::Result<()> {
        let (nand, io) = io()?;
        format(&io, 1)?;

        for pnum in 0..3 {
            put_leb(&io, pnum, Vid::new(0, pnum).sqnum(pnum.into()), b"data")?;
            nand.flip_byte(pnum, io.vid_hdr_offset + 12);
        }

        let config = UbiConfig {
            corrupt_limit: Some(4),
            ..Default::default()
        };
        assert_eq!(AttachInfo::attach(&io, None, &config)?.corrupted.len(), 3);

        let config = UbiConfig {
            corrupt_limit: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            AttachInfo::attach(&io, None, &config),
            Err(UbiError::Attach(AttachError::TooManyCorrupted {
                corrupted: 3,
                limit: 3
            }))
        ));
        Ok(())
    }

    #[test]
    fn test_internal_volume() -> anyhow::Result<()> {
        let (_, io) = io()?;
        format(&io, 1)?;

        put_leb(&io, 0, Vid::new(UBI_INTERNAL_VOL_START, 0).sqnum(1), b"vtbl")?;
        let ai = AttachInfo::attach(&io, None, &UbiConfig::default())?;
        assert_eq!(ai.alien.len(), 1);
        assert!(ai.volumes.is_empty());
        Ok(())
    }

    /// A summary that simply replays a scan made earlier
    struct Replay(Vec<PebScan>);

    impl Fastmap for Replay {
        fn load(&self, peb_count: u32) -> Option<Vec<PebScan>> {
            Some(self.0.iter().copied().take(peb_count as usize).collect())
        }
    }

    #[test]
    fn test_fastmap() -> anyhow::Result<()> {
        let (_, io) = io()?;
        format(&io, 3)?;
        put_leb(&io, 7, Vid::new(1, 2).sqnum(3), b"x")?;

        let summary = Replay(scan_all(&io)?);
        let ai = AttachInfo::attach(&io, Some(&summary), &UbiConfig::default())?;
        assert!(ai.from_fastmap);
        assert_eq!(ai.volumes[&1].lebs[&2].pnum, 7);
        assert_eq!(ai.free.len(), 15);

        // A summary that doesn't cover every PEB is ignored
        let partial = Replay(summary.0[..8].to_vec());
        let ai = AttachInfo::attach(&io, Some(&partial), &UbiConfig::default())?;
        assert!(!ai.from_fastmap);
        assert_eq!(ai.volumes[&1].lebs[&2].pnum, 7);
        Ok(())
    }

    #[test]
    fn test_truncate_and_remove() -> anyhow::Result<()> {
        let (_, io) = io()?;
        format(&io, 1)?;
        for lnum in 0..4 {
            put_leb(&io, lnum, Vid::new(2, lnum).sqnum(lnum.into()), b"x")?;
        }

        let mut ai = AttachInfo::attach(&io, None, &UbiConfig::default())?;
        assert_eq!(ai.volumes[&2].highest_lnum, 3);
        assert_eq!(ai.truncate_volume(2, 3), 1);
        assert_eq!(ai.volumes[&2].lebs.len(), 3);
        assert_eq!(ai.remove_volume(2), 3);
        assert_eq!(ai.erase.len(), 4);
        Ok(())
    }
}
