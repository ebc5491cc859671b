//! The eraseblock association layer: maps LEBs to PEBs and implements reads, writes and atomic
//! changes on top of the wear-leveling engine.
//!
//! Every operation on an LEB holds that LEB's lock from the lock tree: shared for reads,
//! exclusive for anything that writes or changes the mapping. Writing an unmapped LEB takes a fresh
//! PEB and stamps it with a VID header carrying a new sequence number; on attach, the highest
//! sequence number wins, which is what makes atomic changes atomic.

use tracing::{debug, error, info, warn};

use super::device::UbiDevice;
use super::error::{MoveError, Result, UbiError};
use super::headers::{VolType, Vid};
use super::io::{HdrStatus, UBI_IO_RETRIES};
use super::volume::Volume;
use crate::nand::{EccStatus, Nand, PageUtil};

/// PEBs reserved for atomic LEB changes
pub(crate) const EBA_RESERVED_PEBS: u32 = 1;

impl<N: Nand> UbiDevice<N> {
    /// Read part of an LEB; unmapped LEBs read as 0xFF
    pub(crate) fn eba_read(&self, vol: &Volume, lnum: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        vol.check_lnum(lnum)?;
        vol.check_range(offset, buf.len())?;
        let vol_id = vol.vol_id();

        let expected = match vol.is_static() {
            true => {
                let size = static_leb_size(vol, lnum);
                if offset + buf.len() > size {
                    return Err(UbiError::Range {
                        offset,
                        len: buf.len(),
                    });
                }
                Some(size)
            }
            false => None,
        };

        let guard = self.ltree.read(vol_id, lnum);
        let Some(pnum) = vol.mapping(lnum) else {
            debug!("read {} bytes from unmapped LEB {vol_id}:{lnum}", buf.len());
            buf.fill(0xFF);
            return Ok(());
        };
        debug!(
            "read {} bytes from offset {offset} of LEB {vol_id}:{lnum}, PEB {pnum}",
            buf.len()
        );

        let vid = match expected {
            Some(_) => match self.io.read_vid_hdr(pnum)? {
                HdrStatus::Valid(vid) | HdrStatus::Corrected(vid) => Some(vid),
                status => {
                    error!("bad VID header in PEB {pnum} of LEB {vol_id}:{lnum}: {status:?}");
                    vol.set_corrupted(true);
                    return Err(UbiError::Uncorrectable { pnum });
                }
            },
            None => None,
        };

        let ecc = self.io.read_data(pnum, offset, buf)?;
        drop(guard);

        if ecc == EccStatus::Uncorrectable {
            warn!("uncorrectable ECC error in PEB {pnum} of LEB {vol_id}:{lnum}");
            if vol.is_static() {
                vol.set_corrupted(true);
                self.wl_scrub_peb(pnum);
            }
            return Err(UbiError::Uncorrectable { pnum });
        }

        if let (Some(vid), Some(expected)) = (vid, expected) {
            if vid.data_size as usize != expected {
                warn!(
                    "LEB {vol_id}:{lnum} holds {} bytes, {expected} expected",
                    vid.data_size
                );
                vol.set_corrupted(true);
            } else if offset == 0 && buf.len() == expected && !vid.verify(buf) {
                warn!("CRC error in LEB {vol_id}:{lnum}, PEB {pnum}");
                vol.set_corrupted(true);
            }
        }

        if ecc == EccStatus::Corrected {
            self.wl_scrub_peb(pnum);
        }
        Ok(())
    }

    /// Write to a dynamic volume's LEB, mapping it first if needed
    pub(crate) fn eba_write(&self, vol: &Volume, lnum: u32, offset: usize, data: &[u8]) -> Result<()> {
        self.check_writable(vol, lnum)?;
        vol.check_range(offset, data.len())?;
        if offset % self.io.min_io_size != 0 {
            return Err(UbiError::Range {
                offset,
                len: data.len(),
            });
        }
        let vol_id = vol.vol_id();

        let _guard = self.ltree.write(vol_id, lnum);
        let Some(pnum) = vol.mapping(lnum) else {
            let vid = Vid {
                vol_type: VolType::Dynamic,
                data_pad: vol.data_pad as u32,
                ..Vid::new(vol_id, lnum)
            };
            self.write_new_peb(vol, lnum, vid, offset, data)?;
            return Ok(());
        };

        debug!(
            "write {} bytes at offset {offset} of LEB {vol_id}:{lnum}, PEB {pnum}",
            data.len()
        );
        if data.is_empty() {
            return Ok(());
        }

        // Flash pages are programmed in order: only the erased tail of the LEB can take new data
        let mut tail = vec![0u8; vol.usable_leb_size - offset];
        let ecc = self.io.read_data(pnum, offset, &mut tail)?;
        if ecc == EccStatus::Uncorrectable || !tail.is_erased() {
            return Err(UbiError::AlreadyWritten {
                vol_id,
                lnum,
                offset,
            });
        }

        match self.io.write_data(pnum, offset, data) {
            Ok(()) => Ok(()),
            Err(err) if err.is_media_failure() => {
                warn!("failed to write data to PEB {pnum}: {err}");
                self.recover_peb(vol, lnum, pnum, offset, data)
            }
            Err(err) => {
                self.set_ro_mode();
                Err(err)
            }
        }
    }

    /// Map an LEB to a PEB that has nothing but its VID header
    pub(crate) fn eba_map(&self, vol: &Volume, lnum: u32) -> Result<()> {
        self.check_writable(vol, lnum)?;
        let vol_id = vol.vol_id();

        let _guard = self.ltree.write(vol_id, lnum);
        if vol.mapping(lnum).is_some() {
            return Err(UbiError::AlreadyMapped { vol_id, lnum });
        }

        let vid = Vid {
            vol_type: VolType::Dynamic,
            data_pad: vol.data_pad as u32,
            ..Vid::new(vol_id, lnum)
        };
        self.write_new_peb(vol, lnum, vid, 0, &[])?;
        Ok(())
    }

    /// Unmap an LEB and release its PEB
    pub(crate) fn eba_unmap(&self, vol: &Volume, lnum: u32) -> Result<()> {
        if self.is_ro() {
            return Err(UbiError::ReadOnly);
        }
        vol.check_lnum(lnum)?;
        let vol_id = vol.vol_id();

        let _guard = self.ltree.write(vol_id, lnum);
        let Some(pnum) = vol.mapping(lnum) else {
            return Ok(());
        };

        debug!("unmap LEB {vol_id}:{lnum}, PEB {pnum}");
        vol.set_mapping(lnum, None);
        self.wl_put_peb(vol_id, lnum, pnum, false)
    }

    /// Replace the contents of an LEB; a power cut leaves either the old or the new contents
    pub(crate) fn eba_atomic_change(&self, vol: &Volume, lnum: u32, data: &[u8]) -> Result<()> {
        self.check_writable(vol, lnum)?;
        vol.check_range(0, data.len())?;
        let vol_id = vol.vol_id();

        if data.is_empty() {
            // Nothing to protect: an unmapped LEB that gets mapped again reads the same
            self.eba_unmap(vol, lnum)?;
            return self.eba_write(vol, lnum, 0, &[]);
        }

        let _alc = self.alc_mutex.lock();
        let _guard = self.ltree.write(vol_id, lnum);
        debug!("atomic change of {} bytes in LEB {vol_id}:{lnum}", data.len());

        let vid = Vid {
            vol_type: VolType::Dynamic,
            copy_flag: true,
            data_pad: vol.data_pad as u32,
            ..Vid::new(vol_id, lnum)
        }
        .covering(data);

        if let Some(old) = self.write_new_peb(vol, lnum, vid, 0, data)? {
            self.wl_put_peb(vol_id, lnum, old, false)?;
        }
        Ok(())
    }

    /// Replace the whole contents of a volume, LEB by LEB
    pub(crate) fn eba_update_volume(&self, vol: &Volume, data: &[u8]) -> Result<()> {
        if self.is_ro() {
            return Err(UbiError::ReadOnly);
        }
        let vol_id = vol.vol_id();
        let reserved = vol.info.reserved_pebs;
        if data.len() > reserved as usize * vol.usable_leb_size {
            return Err(UbiError::Range {
                offset: 0,
                len: data.len(),
            });
        }

        info!("update volume {vol_id} with {} bytes", data.len());
        vol.state.lock().upd_marker = true;

        for lnum in 0..reserved {
            self.eba_unmap(vol, lnum)?;
        }
        // The old LEBs must be gone from the flash before new ones with a different used_ebs
        // appear, or attach would find the volume inconsistent
        self.wl_flush()?;

        let chunks: Vec<&[u8]> = data.chunks(vol.usable_leb_size).collect();
        let used_ebs = chunks.len() as u32;
        for (lnum, chunk) in (0..).zip(&chunks) {
            let _guard = self.ltree.write(vol_id, lnum);
            let vid = Vid {
                vol_type: vol.info.vol_type,
                data_pad: vol.data_pad as u32,
                ..Vid::new(vol_id, lnum)
            };
            let vid = match vol.is_static() {
                true => Vid { used_ebs, ..vid }.covering(chunk),
                false => vid,
            };
            self.write_new_peb(vol, lnum, vid, 0, chunk)?;
        }

        let mut state = vol.state.lock();
        if vol.is_static() {
            state.used_ebs = used_ebs;
            state.last_eb_bytes = chunks.last().map_or(0, |chunk| chunk.len());
        }
        state.upd_marker = false;
        vol.set_corrupted(false);

        info!("volume {vol_id} updated, {used_ebs} LEBs written");
        Ok(())
    }

    /// Read every LEB of a static volume; returns false (and flags the volume) on bad data
    pub(crate) fn eba_check_volume(&self, vol: &Volume) -> Result<bool> {
        if !vol.is_static() {
            return Ok(true);
        }

        vol.set_corrupted(false);
        let used_ebs = vol.state.lock().used_ebs;
        for lnum in 0..used_ebs {
            let mut buf = vec![0u8; static_leb_size(vol, lnum)];
            match self.eba_read(vol, lnum, 0, &mut buf) {
                Ok(()) | Err(UbiError::Uncorrectable { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        let intact = !vol.is_corrupted();
        if !intact {
            warn!("volume {} is corrupted", vol.vol_id());
        }
        Ok(intact)
    }

    /// Copy the LEB held by PEB `from` into the erased PEB `to` and remap it, for the
    /// wear-leveling engine
    pub(crate) fn eba_copy_leb(&self, from: u32, to: u32, vid: &Vid) -> std::result::Result<(), MoveError> {
        let Vid { vol_id, lnum, .. } = *vid;
        debug!("copy LEB {vol_id}:{lnum}, PEB {from} to PEB {to}");

        let Ok(vol) = self.volume(vol_id) else {
            debug!("volume {vol_id} is gone, cancel");
            return Err(MoveError::CancelRace);
        };

        // Whoever holds the LEB is about to change it; don't wait for them
        let Some(_guard) = self.ltree.try_write(vol_id, lnum) else {
            debug!("contention on LEB {vol_id}:{lnum}, cancel");
            return Err(MoveError::CancelRace);
        };
        if vol.mapping(lnum) != Some(from) {
            debug!("LEB {vol_id}:{lnum} is no longer mapped to PEB {from}, cancel");
            return Err(MoveError::CancelRace);
        }

        let size = match vol.is_static() {
            true => vid.data_size as usize,
            false => vol.usable_leb_size,
        };
        let mut buf = vec![0u8; size];
        match self.io.read_data(from, 0, &mut buf) {
            Ok(EccStatus::Uncorrectable) => {
                warn!("uncorrectable data in PEB {from}");
                return Err(MoveError::SourceRead);
            }
            Ok(_) => {}
            Err(err) if err.is_transient() => return Err(MoveError::Retry),
            Err(err) if err.is_media_failure() => {
                warn!("error reading PEB {from}: {err}");
                return Err(MoveError::SourceRead);
            }
            Err(err) => return Err(err.into()),
        }

        // Trailing 0xFF pages of a dynamic LEB are indistinguishable from erased ones
        let size = match vol.is_static() {
            true => size,
            false => buf.data_len(self.io.min_io_size),
        };
        let data = &buf[..size];

        let new_vid = Vid {
            copy_flag: true,
            ..*vid
        }
        .covering(data);

        self.io
            .write_vid_hdr(to, new_vid)
            .map_err(target_error)?;
        match self.io.read_vid_hdr(to).map_err(target_error)? {
            HdrStatus::Valid(check) if check == new_vid => {}
            HdrStatus::Corrected(_) => {
                warn!("bitflips in the VID header just written to PEB {to}");
                return Err(MoveError::TargetBitflips);
            }
            status => {
                warn!("VID header of PEB {to} does not read back: {status:?}");
                return Err(MoveError::TargetWrite);
            }
        }

        if !data.is_empty() {
            self.io.write_data(to, 0, data).map_err(target_error)?;

            let mut check = vec![0u8; size];
            match self.io.read_data(to, 0, &mut check).map_err(target_error)? {
                EccStatus::Clean if check == data => {}
                EccStatus::Corrected => {
                    warn!("bitflips in the data just written to PEB {to}");
                    return Err(MoveError::TargetBitflips);
                }
                _ => {
                    warn!("data of PEB {to} does not read back");
                    return Err(MoveError::TargetWrite);
                }
            }
        }

        // The volume might have been removed, or somebody queued up for the LEB, while copying
        if !self.volume_is_live(&vol)
            || vol.mapping(lnum) != Some(from)
            || self.ltree.contended(vol_id, lnum)
        {
            debug!("LEB {vol_id}:{lnum} wanted elsewhere, cancel");
            return Err(MoveError::CancelRace);
        }

        vol.set_mapping(lnum, Some(to));
        Ok(())
    }

    fn check_writable(&self, vol: &Volume, lnum: u32) -> Result<()> {
        if self.is_ro() {
            return Err(UbiError::ReadOnly);
        }
        if vol.is_static() {
            return Err(UbiError::StaticVolume(vol.vol_id()));
        }
        vol.check_lnum(lnum)
    }

    /// Take a fresh PEB, write `vid` (with a new sequence number) and then `data` at `offset`, and
    /// map the LEB to it; returns the PEB the LEB was mapped to before.
    ///
    /// PEBs that fail to write are released for torture and another one is tried, a few times
    /// over. The caller holds the LEB's write lock.
    fn write_new_peb(
        &self,
        vol: &Volume,
        lnum: u32,
        mut vid: Vid,
        offset: usize,
        data: &[u8],
    ) -> Result<Option<u32>> {
        let vol_id = vol.vol_id();
        let mut tries = 0;

        loop {
            vid.sqnum = self.next_sqnum();
            let pnum = self.wl_get_peb()?;
            debug!(
                "write VID header and {} bytes at offset {offset} of LEB {vol_id}:{lnum} to PEB {pnum}, sqnum {}",
                data.len(),
                vid.sqnum
            );

            let written = self
                .io
                .write_vid_hdr(pnum, vid)
                .and_then(|()| match data.is_empty() {
                    true => Ok(()),
                    false => self.io.write_data(pnum, offset, data),
                });

            let err = match written {
                Ok(()) => {
                    let old = vol.mapping(lnum);
                    vol.set_mapping(lnum, Some(pnum));
                    return Ok(old);
                }
                Err(err) => err,
            };

            warn!("failed to write LEB {vol_id}:{lnum} to PEB {pnum}: {err}");
            if !err.is_media_failure() {
                self.set_ro_mode();
                return Err(err);
            }
            if let Err(put_err) = self.wl_put_peb(vol_id, lnum, pnum, true) {
                self.set_ro_mode();
                return Err(put_err);
            }

            tries += 1;
            if tries > UBI_IO_RETRIES {
                error!("giving up on LEB {vol_id}:{lnum} after {tries} tries");
                self.set_ro_mode();
                return Err(err);
            }
            info!("try another PEB");
        }
    }

    /// A write into mapped PEB `old` failed: move what it held, plus the new data, to a new PEB
    fn recover_peb(&self, vol: &Volume, lnum: u32, old: u32, offset: usize, data: &[u8]) -> Result<()> {
        let vol_id = vol.vol_id();
        info!("recover PEB {old}, move LEB {vol_id}:{lnum} elsewhere");

        let vid = match self.io.read_vid_hdr(old)? {
            HdrStatus::Valid(vid) | HdrStatus::Corrected(vid) => vid,
            status => {
                error!("cannot recover PEB {old}, VID header is {status:?}");
                self.set_ro_mode();
                return Err(UbiError::Uncorrectable { pnum: old });
            }
        };

        let mut buf = vec![0xFFu8; offset + data.len()];
        if self.io.read_data(old, 0, &mut buf[..offset])? == EccStatus::Uncorrectable {
            error!("cannot recover PEB {old}, data is uncorrectable");
            self.set_ro_mode();
            return Err(UbiError::Uncorrectable { pnum: old });
        }
        buf[offset..].copy_from_slice(data);

        self.write_new_peb(vol, lnum, vid, 0, &buf)?;
        self.wl_put_peb(vol_id, lnum, old, true)?;
        info!("data was successfully recovered");
        Ok(())
    }
}

/// Bytes of data in LEB `lnum` of a static volume
fn static_leb_size(vol: &Volume, lnum: u32) -> usize {
    let state = vol.state.lock();
    match (lnum + 1).cmp(&state.used_ebs) {
        std::cmp::Ordering::Less => vol.usable_leb_size,
        std::cmp::Ordering::Equal => state.last_eb_bytes,
        std::cmp::Ordering::Greater => 0,
    }
}

fn target_error(err: UbiError) -> MoveError {
    if err.is_transient() {
        MoveError::Retry
    } else if err.is_media_failure() {
        MoveError::TargetWrite
    } else {
        MoveError::Failed(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{Faults, SimNand};
    use crate::ubi::testutil::*;
    use crate::ubi::{PebSet, Ubi, UbiConfig, VolumeInfo};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn mapped(ubi: &Ubi<Arc<SimNand>>, vol_id: u32, lnum: u32) -> anyhow::Result<u32> {
        ubi.leb_mapping(vol_id, lnum)?
            .ok_or_else(|| anyhow::anyhow!("LEB {vol_id}:{lnum} is not mapped"))
    }

    #[test]
    fn test_read_write() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;

        let mut buf = vec![0u8; 100];
        ubi.read(0, 3, 10, &mut buf)?;
        assert!(buf.is_erased());

        ubi.write(0, 3, 64, &pattern(1, 100))?;
        ubi.read(0, 3, 64, &mut buf)?;
        assert_eq!(buf, pattern(1, 100));

        // Appending is fine, rewriting is not
        ubi.write(0, 3, 192, &pattern(2, 64))?;
        assert!(matches!(
            ubi.write(0, 3, 128, &pattern(3, 64)),
            Err(UbiError::AlreadyWritten { offset: 128, .. })
        ));
        assert!(matches!(ubi.write(0, 3, 10, &[1]), Err(UbiError::Range { .. })));
        assert!(matches!(ubi.write(0, 3, 320, &[0; 65]), Err(UbiError::Range { .. })));
        assert!(matches!(ubi.write(0, 4, 0, &[1]), Err(UbiError::LebRange { .. })));
        assert!(matches!(ubi.write(1, 0, 0, &[1]), Err(UbiError::NoVolume(1))));

        let mut buf = vec![0u8; 64];
        ubi.read(0, 3, 0, &mut buf)?;
        assert!(buf.is_erased());
        ubi.read(0, 3, 192, &mut buf)?;
        assert_eq!(buf, pattern(2, 64));
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_map_unmap() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;

        ubi.unmap(0, 0)?;
        ubi.map(0, 0)?;
        assert!(ubi.is_mapped(0, 0)?);
        assert!(matches!(ubi.map(0, 0), Err(UbiError::AlreadyMapped { .. })));

        ubi.write(0, 0, 0, &pattern(1, 64))?;
        let pnum = mapped(&ubi, 0, 0)?;
        ubi.unmap(0, 0)?;
        ubi.unmap(0, 0)?;
        assert!(!ubi.is_mapped(0, 0)?);
        assert_eq!(ubi.peb_set(pnum), Some(PebSet::Used));

        let mut buf = vec![0u8; 64];
        ubi.read(0, 0, 0, &mut buf)?;
        assert!(buf.is_erased());

        ubi.flush()?;
        assert_eq!(ubi.peb_set(pnum), Some(PebSet::Free));
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_atomic_change() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;

        ubi.write(0, 1, 0, &pattern(1, 384))?;
        let old = mapped(&ubi, 0, 1)?;
        ubi.atomic_change(0, 1, &pattern(2, 100))?;
        assert_ne!(mapped(&ubi, 0, 1)?, old);

        let mut buf = vec![0u8; 384];
        ubi.read(0, 1, 0, &mut buf)?;
        assert_eq!(&buf[..100], pattern(2, 100));
        assert!(buf[100..].is_erased());

        // An empty change leaves the LEB mapped but blank
        ubi.atomic_change(0, 1, &[])?;
        assert!(ubi.is_mapped(0, 1)?);
        ubi.read(0, 1, 0, &mut buf)?;
        assert!(buf.is_erased());
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_atomic_change_power_cut() -> anyhow::Result<()> {
        let vols = [dynamic(0, 4)];
        let old = pattern(1, 300);
        let new = pattern(2, 250);

        for budget in 0..8 {
            let nand = sim();
            {
                let ubi = attach(&nand, &vols, quiet())?;
                ubi.flush()?;
                ubi.atomic_change(0, 2, &old)?;
                ubi.flush()?;

                nand.cut_power_after(budget);
                let _ = ubi.atomic_change(0, 2, &new);
            }

            let rebooted = Arc::new(nand.snapshot());
            let ubi = attach(&rebooted, &vols, quiet())?;
            let mut buf = vec![0u8; 300];
            ubi.read(0, 2, 0, &mut buf)?;
            let got_new = buf[..250] == new[..] && buf[250..].is_erased();
            assert!(got_new || buf == old, "budget {budget}: mixed contents");
            if budget >= 6 {
                assert!(got_new, "budget {budget}: change lost");
            }
            ubi.self_check()?;
        }
        Ok(())
    }

    #[test]
    fn test_write_failure_retries() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;
        ubi.flush()?;

        let doomed = ubi.dev.wl.state.lock().peek_free();
        let doomed = doomed.ok_or_else(|| anyhow::anyhow!("nothing free"))?;
        nand.set_faults(
            doomed,
            Faults {
                program: true,
                ..Default::default()
            },
        );

        ubi.write(0, 0, 0, &pattern(5, 200))?;
        assert_ne!(mapped(&ubi, 0, 0)?, doomed);
        let mut buf = vec![0u8; 200];
        ubi.read(0, 0, 0, &mut buf)?;
        assert_eq!(buf, pattern(5, 200));

        // The PEB that failed gets tortured, fails again, and is retired
        ubi.flush()?;
        assert_eq!(ubi.peb_set(doomed), Some(PebSet::Bad));
        assert!(!ubi.is_read_only());
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_append_failure_recovers() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;
        ubi.flush()?;

        ubi.write(0, 0, 0, &pattern(1, 128))?;
        let first = mapped(&ubi, 0, 0)?;
        nand.set_faults(
            first,
            Faults {
                program: true,
                ..Default::default()
            },
        );

        ubi.write(0, 0, 128, &pattern(2, 64))?;
        assert_ne!(mapped(&ubi, 0, 0)?, first);
        let mut buf = vec![0u8; 192];
        ubi.read(0, 0, 0, &mut buf)?;
        assert_eq!(&buf[..128], pattern(1, 128));
        assert_eq!(&buf[128..], pattern(2, 64));

        ubi.flush()?;
        assert_eq!(ubi.peb_set(first), Some(PebSet::Bad));
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_uncorrectable_read() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;
        ubi.write(0, 0, 0, &pattern(1, 64))?;
        let pnum = mapped(&ubi, 0, 0)?;
        nand.set_faults(
            pnum,
            Faults {
                uncorrectable: true,
                ..Default::default()
            },
        );

        let mut buf = vec![0u8; 64];
        assert!(matches!(
            ubi.read(0, 0, 0, &mut buf),
            Err(UbiError::Uncorrectable { pnum: p }) if p == pnum
        ));
        Ok(())
    }

    #[test]
    fn test_copy_leb() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;
        ubi.flush()?;
        ubi.write(0, 2, 0, &pattern(3, 130))?;

        let dev = &ubi.dev;
        let from = mapped(&ubi, 0, 2)?;
        let vid = dev
            .io
            .read_vid_hdr(from)?
            .header()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no VID header"))?;

        // Someone holds the LEB
        let to = dev.wl_get_peb()?;
        {
            let _held = dev.ltree.read(0, 2);
            assert!(matches!(
                dev.eba_copy_leb(from, to, &vid),
                Err(MoveError::CancelRace)
            ));
        }

        // The source can't be read
        nand.set_faults(
            from,
            Faults {
                uncorrectable: true,
                ..Default::default()
            },
        );
        assert!(matches!(
            dev.eba_copy_leb(from, to, &vid),
            Err(MoveError::SourceRead)
        ));
        assert_eq!(mapped(&ubi, 0, 2)?, from);
        nand.clear_faults(from);

        // The copy carries the same sequence number, and only the written pages
        dev.eba_copy_leb(from, to, &vid)?;
        assert_eq!(mapped(&ubi, 0, 2)?, to);
        let copied = dev
            .io
            .read_vid_hdr(to)?
            .header()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no VID header"))?;
        assert_eq!(copied.sqnum, vid.sqnum);
        assert!(copied.copy_flag);
        assert_eq!(copied.data_size, 192);

        let mut buf = vec![0u8; 130];
        ubi.read(0, 2, 0, &mut buf)?;
        assert_eq!(buf, pattern(3, 130));

        // The mapping moved on, so copying the old PEB again is a race
        assert!(matches!(
            dev.eba_copy_leb(from, to, &vid),
            Err(MoveError::CancelRace)
        ));
        Ok(())
    }

    #[test]
    fn test_static_volume() -> anyhow::Result<()> {
        let nand = sim();
        let vols = [VolumeInfo::new(5, VolType::Static, 4).name("image")];
        let ubi = attach(&nand, &vols, quiet())?;
        let image = pattern(7, 384 * 2 + 100);

        assert!(matches!(ubi.write(5, 0, 0, &[1]), Err(UbiError::StaticVolume(5))));
        ubi.update_volume(5, &image)?;
        let status = ubi.volume_status(5)?;
        assert_eq!((status.used_ebs, status.last_eb_bytes), (3, 100));
        assert!(ubi.check_volume(5)?);

        let mut buf = vec![0u8; 100];
        ubi.read(5, 2, 0, &mut buf)?;
        assert_eq!(buf, image[768..]);
        assert!(matches!(
            ubi.read(5, 2, 0, &mut [0; 101]),
            Err(UbiError::Range { .. })
        ));
        assert!(matches!(
            ubi.read(5, 2, 50, &mut [0; 51]),
            Err(UbiError::Range { .. })
        ));
        assert!(!ubi.volume_status(5)?.corrupted);

        // Survives a reattach
        drop(ubi);
        let ubi = attach(&nand, &vols, quiet())?;
        let status = ubi.volume_status(5)?;
        assert_eq!((status.used_ebs, status.last_eb_bytes), (3, 100));
        assert!(ubi.check_volume(5)?);

        // Silent corruption shows up as a checksum mismatch, but the data is still readable
        let pnum = mapped(&ubi, 5, 1)?;
        nand.flip_byte(pnum, ubi.dev.io.leb_start + 17);
        let mut buf = vec![0u8; 384];
        ubi.read(5, 1, 0, &mut buf)?;
        assert_ne!(buf, image[384..768]);
        assert!(ubi.volume_status(5)?.corrupted);
        assert!(!ubi.check_volume(5)?);

        // A fresh update fixes it
        ubi.update_volume(5, &image[..500])?;
        assert!(ubi.check_volume(5)?);
        assert!(!ubi.volume_status(5)?.corrupted);
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_shrinking_update_survives_power_cut() -> anyhow::Result<()> {
        let nand = sim();
        let vols = [VolumeInfo::new(5, VolType::Static, 4)];
        let ubi = attach(&nand, &vols, quiet())?;

        ubi.update_volume(5, &pattern(1, 384 * 3))?;
        ubi.flush()?;
        let image = pattern(2, 384 * 2);
        ubi.update_volume(5, &image)?;

        // Nothing is flushed after the second update: whatever is on the flash now is what a
        // power cut would leave behind
        let crashed = Arc::new(nand.snapshot());
        drop(ubi);

        let ubi = attach(&crashed, &vols, quiet())?;
        let status = ubi.volume_status(5)?;
        assert_eq!((status.used_ebs, status.last_eb_bytes), (2, 384));
        assert!(ubi.check_volume(5)?);

        let mut buf = vec![0u8; 384];
        ubi.read(5, 1, 0, &mut buf)?;
        assert_eq!(buf, image[384..]);
        assert!(!ubi.is_mapped(5, 2)?);
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_concurrent_lebs() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 8)], UbiConfig::default())?;

        let results: Vec<anyhow::Result<()>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4u32)
                .map(|lnum| {
                    let ubi = &ubi;
                    s.spawn(move || -> anyhow::Result<()> {
                        let mut buf = vec![0u8; 200];
                        for round in 0..40u32 {
                            let data = pattern((lnum * 50 + round) as u8, 200);
                            ubi.atomic_change(0, lnum, &data)?;
                            ubi.read(0, lnum, 0, &mut buf)?;
                            assert_eq!(buf, data);
                        }
                        Ok(())
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap_or_else(|_| Err(anyhow::anyhow!("panicked"))))
                .collect()
        });
        for result in results {
            result?;
        }

        ubi.flush()?;
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_concurrent_same_leb() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 2)], UbiConfig::default())?;

        let results: Vec<anyhow::Result<()>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4u8)
                .map(|id| {
                    let ubi = &ubi;
                    s.spawn(move || -> anyhow::Result<()> {
                        for _ in 0..25 {
                            ubi.atomic_change(0, 0, &[id; 256])?;
                            let mut buf = vec![0u8; 256];
                            ubi.read(0, 0, 0, &mut buf)?;
                            // Never a mix of two writers
                            assert!(buf.iter().all(|&x| x == buf[0]));
                        }
                        Ok(())
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap_or_else(|_| Err(anyhow::anyhow!("panicked"))))
                .collect()
        });
        for result in results {
            result?;
        }

        ubi.flush()?;
        ubi.self_check()?;
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_last_write_wins(ops in prop::collection::vec((0..4u32, any::<u8>(), 1..=384usize), 1..40)) {
            let nand = sim();
            let ubi = attach(&nand, &[dynamic(0, 4)], quiet()).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let mut expect: [Option<Vec<u8>>; 4] = Default::default();

            for (lnum, fill, len) in ops {
                let data = pattern(fill, len);
                ubi.atomic_change(0, lnum, &data).map_err(|e| TestCaseError::fail(e.to_string()))?;
                expect[lnum as usize] = Some(data);
            }

            drop(ubi);
            let ubi = attach(&nand, &[dynamic(0, 4)], quiet()).map_err(|e| TestCaseError::fail(e.to_string()))?;
            for (lnum, expect) in (0..).zip(&expect) {
                let mut buf = vec![0u8; 384];
                ubi.read(0, lnum, 0, &mut buf).map_err(|e| TestCaseError::fail(e.to_string()))?;
                match expect {
                    Some(data) => {
                        prop_assert_eq!(&buf[..data.len()], &data[..]);
                        prop_assert!(buf[data.len()..].is_erased());
                    }
                    None => prop_assert!(buf.is_erased()),
                }
            }
        }
    }
}
