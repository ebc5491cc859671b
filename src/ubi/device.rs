//! The attached UBI device: shared context, capacity accounting, and the public handle

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::attach::{AttachInfo, Fastmap};
use super::config::UbiConfig;
use super::eba::EBA_RESERVED_PEBS;
use super::error::{Result, UbiError};
use super::headers::Ec;
use super::io::UbiIo;
use super::ltree::LockTree;
use super::volume::{Volume, VolumeInfo};
use super::wl::{background_thread, PebSet, Wl, WlState, WlStats, WL_RESERVED_PEBS};
use crate::nand::Nand;

/// How the good PEBs of the device are spent
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct Capacity {
    pub peb_count: u32,
    pub good_peb_count: u32,
    pub bad_peb_count: u32,

    /// Corrupted and alien PEBs preserved at attach
    pub corr_peb_count: u32,

    /// Bad PEBs expected over the device lifetime
    pub bad_peb_limit: u32,

    /// The size the bad-block reserve should have
    pub beb_rsvd_level: u32,

    /// PEBs held back to replace PEBs that go bad
    pub beb_rsvd_pebs: u32,

    /// PEBs reserved for volumes and internal needs, bad-block reserve included
    pub rsvd_pebs: u32,

    /// PEBs not reserved for anything
    pub avail_pebs: u32,

    /// PEBs kept out of use as erroneous; each was paid for like a bad PEB
    pub erroneous_peb_count: u32,
}

impl Capacity {
    fn reserve(&mut self, count: u32, what: &str) -> Result<()> {
        if count > self.avail_pebs {
            error!("not enough PEBs for {what}: {count} needed, {} available", self.avail_pebs);
            return Err(UbiError::NotEnoughPebs {
                needed: count,
                available: self.avail_pebs,
            });
        }
        self.avail_pebs -= count;
        self.rsvd_pebs += count;
        Ok(())
    }

    fn release(&mut self, count: u32) {
        self.rsvd_pebs -= count;
        self.avail_pebs += count;
    }

    /// Recompute how large the bad-block reserve should be
    pub fn calculate_reserved(&mut self) {
        self.beb_rsvd_level = self.bad_peb_limit.saturating_sub(self.bad_peb_count);
    }

    /// Top the bad-block reserve up from the available PEBs; returns how many were added
    pub fn update_reserved(&mut self) -> u32 {
        let need = self.beb_rsvd_level.saturating_sub(self.beb_rsvd_pebs);
        let more = std::cmp::min(need, self.avail_pebs);
        self.avail_pebs -= more;
        self.rsvd_pebs += more;
        self.beb_rsvd_pebs += more;
        more
    }

    /// Pay for a PEB going out of service, from the bad-block reserve if there is anything left
    /// in it; returns whether the reserve paid
    pub fn take_one(&mut self) -> Result<bool> {
        if self.beb_rsvd_pebs > 0 {
            self.beb_rsvd_pebs -= 1;
            self.rsvd_pebs -= 1;
            Ok(true)
        } else if self.avail_pebs > 0 {
            self.avail_pebs -= 1;
            Ok(false)
        } else {
            error!("no reserved/available physical eraseblocks");
            Err(UbiError::NoSpace)
        }
    }

    /// An erroneous PEB erased fine after all; returns how many PEBs went back into the reserve
    pub fn recover_erroneous(&mut self) -> u32 {
        self.erroneous_peb_count = self.erroneous_peb_count.saturating_sub(1);
        self.avail_pebs += 1;
        self.update_reserved()
    }

    /// Undo taking a PEB for retirement
    pub fn give_back(&mut self, from_reserve: bool) {
        if from_reserve {
            self.beb_rsvd_pebs += 1;
            self.rsvd_pebs += 1;
        } else {
            self.avail_pebs += 1;
        }
    }
}

/// State shared by the handle, the EBA and WL layers, and the background thread
pub(crate) struct UbiDevice<N> {
    pub io: UbiIo<N>,
    pub wl: Wl,
    pub ltree: LockTree,

    /// Serializes atomic LEB changes
    pub alc_mutex: Mutex<()>,

    pub volumes: RwLock<BTreeMap<u32, Arc<Volume>>>,
    pub capacity: Mutex<Capacity>,

    /// EC header template, with this device's image sequence number
    pub ec_proto: Ec,

    global_sqnum: AtomicU64,
    ro_mode: AtomicBool,
}

impl<N: Nand> UbiDevice<N> {
    pub fn next_sqnum(&self) -> u64 {
        self.global_sqnum.fetch_add(1, Ordering::SeqCst)
    }

    pub fn is_ro(&self) -> bool {
        self.ro_mode.load(Ordering::Acquire)
    }

    /// Stop all writes for good, after something went wrong that can't be recovered from
    pub fn set_ro_mode(&self) {
        if !self.ro_mode.swap(true, Ordering::AcqRel) {
            warn!("switch to read-only mode");
        }
    }

    pub fn volume(&self, vol_id: u32) -> Result<Arc<Volume>> {
        self.volumes
            .read()
            .get(&vol_id)
            .cloned()
            .ok_or(UbiError::NoVolume(vol_id))
    }

    /// Is `vol` still the registered volume with its ID?
    pub fn volume_is_live(&self, vol: &Arc<Volume>) -> bool {
        self.volumes
            .read()
            .get(&vol.vol_id())
            .is_some_and(|live| Arc::ptr_eq(live, vol))
    }

    /// Cross-check the WL sets and the EBA tables
    pub fn self_check(&self) -> Result<()> {
        let st = self.wl.state.lock();
        st.check(self.io.peb_count).map_err(UbiError::SelfCheck)?;

        let mut owners = BTreeMap::new();
        for vol in self.volumes.read().values() {
            for (lnum, pnum) in vol.mapped() {
                if let Some((vol_id, other)) = owners.insert(pnum, (vol.vol_id(), lnum)) {
                    return Err(UbiError::SelfCheck(format!(
                        "PEB {pnum} mapped by LEB {vol_id}:{other} and LEB {}:{lnum}",
                        vol.vol_id()
                    )));
                }
                if !st.holds_data(pnum) {
                    return Err(UbiError::SelfCheck(format!(
                        "LEB {}:{lnum} is mapped to PEB {pnum}, which is {:?}",
                        vol.vol_id(),
                        st.set_of(pnum)
                    )));
                }
            }
        }

        let cap = self.capacity.lock();
        if cap.good_peb_count + cap.bad_peb_count != cap.peb_count {
            return Err(UbiError::SelfCheck(format!("bad PEB accounting: {cap:?}")));
        }
        Ok(())
    }
}

/// Summary of a UBI device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceInfo {
    pub peb_count: u32,
    pub peb_size: usize,
    pub leb_size: usize,
    pub min_io_size: usize,
    pub good_peb_count: u32,
    pub bad_peb_count: u32,
    pub corr_peb_count: u32,
    pub bad_peb_limit: u32,
    pub beb_rsvd_level: u32,
    pub beb_rsvd_pebs: u32,
    pub rsvd_pebs: u32,
    pub avail_pebs: u32,
    pub erroneous_peb_count: u32,
    pub image_seq: u32,

    /// The next sequence number to be written
    pub sqnum: u64,

    pub read_only: bool,
}

/// A volume's table record along with its current state
#[derive(Debug, Clone)]
pub struct VolumeStatus {
    pub info: VolumeInfo,
    pub usable_leb_size: usize,

    /// LEBs holding data, for static volumes; the reserved count otherwise
    pub used_ebs: u32,

    /// Bytes of data in the last used LEB, for static volumes
    pub last_eb_bytes: usize,

    pub mapped_lebs: usize,
    pub corrupted: bool,
    pub upd_marker: bool,
}

/// An attached UBI device
///
/// Dropping the handle stops the background thread and finishes pending erasures.
pub struct Ubi<N: Nand + 'static> {
    pub(crate) dev: Arc<UbiDevice<N>>,
    worker: Option<JoinHandle<()>>,
}

impl<N: Nand + 'static> Ubi<N> {
    /// Attach the flash, scanning every PEB
    ///
    /// `volumes` is the volume table: LEBs of volumes missing from it are erased, and so are LEBs
    /// beyond the reserved size of a volume.
    pub fn attach(nand: N, volumes: Vec<VolumeInfo>, config: UbiConfig) -> Result<Self> {
        Self::attach_inner(nand, volumes, config, None)
    }

    /// Attach the flash, taking PEB records from `fastmap` when it has them
    pub fn attach_with_fastmap(
        nand: N,
        volumes: Vec<VolumeInfo>,
        config: UbiConfig,
        fastmap: &dyn Fastmap,
    ) -> Result<Self> {
        Self::attach_inner(nand, volumes, config, Some(fastmap))
    }

    fn attach_inner(
        nand: N,
        volumes: Vec<VolumeInfo>,
        config: UbiConfig,
        fastmap: Option<&dyn Fastmap>,
    ) -> Result<Self> {
        let io = UbiIo::new(nand)?;
        info!(
            "attaching {} PEBs of {} bytes, LEB size {} bytes",
            io.peb_count, io.peb_size, io.leb_size
        );

        let mut ai = AttachInfo::attach(&io, fastmap, &config)?;

        let mut vols = BTreeMap::new();
        for info in volumes {
            let vol_id = info.vol_id;
            let vol = Volume::new(info, io.leb_size)?;
            if vols.insert(vol_id, vol).is_some() {
                return Err(UbiError::VolumeExists(vol_id));
            }
        }

        // The volume table has the last word on what exists
        let unknown: Vec<u32> = ai
            .volumes
            .keys()
            .filter(|vol_id| !vols.contains_key(vol_id))
            .copied()
            .collect();
        for vol_id in unknown {
            let erased = ai.remove_volume(vol_id);
            warn!("volume {vol_id} is not in the volume table, erasing its {erased} PEBs");
        }
        for vol in vols.values() {
            let erased = ai.truncate_volume(vol.vol_id(), vol.info.reserved_pebs);
            if erased > 0 {
                warn!(
                    "volume {}: erasing {erased} LEBs beyond its {} reserved LEBs",
                    vol.vol_id(),
                    vol.info.reserved_pebs
                );
            }
        }

        let capacity = Self::init_capacity(&io, &ai, &config, &vols)?;
        Self::init_eba(&ai, &vols);

        let mut st = WlState::new(config.background);
        st.populate(&ai);

        let ec_proto = io.ec_prototype(ai.image_seq);
        let peb_count = io.peb_count;
        let dev = Arc::new(UbiDevice {
            io,
            wl: Wl::new(st, &config, peb_count),
            ltree: LockTree::default(),
            alc_mutex: Mutex::new(()),
            volumes: RwLock::new(vols.into_iter().map(|(id, vol)| (id, Arc::new(vol))).collect()),
            capacity: Mutex::new(capacity),
            ec_proto,
            global_sqnum: AtomicU64::new(ai.max_sqnum + 1),
            ro_mode: AtomicBool::new(false),
        });

        dev.ensure_wear_leveling();

        let worker = {
            let dev = dev.clone();
            std::thread::Builder::new()
                .name("ubi_bgt".into())
                .spawn(move || background_thread(dev))
                .map_err(anyhow::Error::from)?
        };

        info!(
            "attached: {} good PEBs, {} bad, {} reserved for bad PEB handling, {} available",
            capacity.good_peb_count,
            capacity.bad_peb_count,
            capacity.beb_rsvd_pebs,
            capacity.avail_pebs
        );

        Ok(Self {
            dev,
            worker: Some(worker),
        })
    }

    fn init_capacity(
        io: &UbiIo<N>,
        ai: &AttachInfo,
        config: &UbiConfig,
        vols: &BTreeMap<u32, Volume>,
    ) -> Result<Capacity> {
        let bad = ai.bad.len() as u32;
        let corrupted = (ai.corrupted.len() + ai.alien.len()) as u32;
        let mut cap = Capacity {
            peb_count: io.peb_count,
            good_peb_count: io.peb_count - bad,
            bad_peb_count: bad,
            corr_peb_count: corrupted,
            avail_pebs: io.peb_count - bad - corrupted,
            ..Default::default()
        };

        for vol in vols.values() {
            cap.reserve(vol.info.reserved_pebs, &format!("volume {}", vol.vol_id()))?;
        }
        cap.reserve(WL_RESERVED_PEBS, "wear-leveling")?;
        cap.reserve(EBA_RESERVED_PEBS, "atomic LEB change")?;

        if io.bad_allowed {
            cap.bad_peb_limit = config.bad_peb_limit(io.peb_count);
            cap.calculate_reserved();
            let reserved = cap.update_reserved();
            if reserved < cap.beb_rsvd_level {
                warn!(
                    "cannot reserve enough PEBs for bad PEB handling, reserved {reserved}, need {}",
                    cap.beb_rsvd_level
                );
            }
        }

        Ok(cap)
    }

    /// Fill the EBA tables from the attach information
    fn init_eba(ai: &AttachInfo, vols: &BTreeMap<u32, Volume>) {
        for vol in vols.values() {
            let mut state = vol.state.lock();
            if vol.is_static() {
                state.used_ebs = 0;
                state.last_eb_bytes = 0;
            }
            if state.upd_marker {
                warn!("volume {}: update was interrupted, the data is incomplete", vol.vol_id());
                vol.set_corrupted(true);
            }
        }

        for (vol_id, av) in &ai.volumes {
            let Some(vol) = vols.get(vol_id) else {
                continue;
            };
            for (&lnum, leb) in &av.lebs {
                vol.set_mapping(lnum, Some(leb.pnum));
            }
            if vol.is_static() {
                let mut state = vol.state.lock();
                state.used_ebs = av.used_ebs;
                state.last_eb_bytes = av.last_data_size as usize;
            }
        }
    }

    /// Read `buf.len()` bytes at `offset` of an LEB; unmapped LEBs read as all 0xFF
    pub fn read(&self, vol_id: u32, lnum: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        let vol = self.dev.volume(vol_id)?;
        self.dev.eba_read(&vol, lnum, offset, buf)
    }

    /// Write `data` at `offset` of an LEB, mapping it first if needed
    ///
    /// Mapped LEBs can only be appended to: the range written, and everything after it, must still
    /// be erased.
    pub fn write(&self, vol_id: u32, lnum: u32, offset: usize, data: &[u8]) -> Result<()> {
        let vol = self.dev.volume(vol_id)?;
        self.dev.eba_write(&vol, lnum, offset, data)
    }

    /// Replace the contents of an LEB, such that either the old or the new contents survive
    /// a power cut
    pub fn atomic_change(&self, vol_id: u32, lnum: u32, data: &[u8]) -> Result<()> {
        let vol = self.dev.volume(vol_id)?;
        self.dev.eba_atomic_change(&vol, lnum, data)
    }

    /// Drop the contents of an LEB; unmapping an unmapped LEB is fine
    pub fn unmap(&self, vol_id: u32, lnum: u32) -> Result<()> {
        let vol = self.dev.volume(vol_id)?;
        self.dev.eba_unmap(&vol, lnum)
    }

    /// Map an LEB to an empty PEB
    pub fn map(&self, vol_id: u32, lnum: u32) -> Result<()> {
        let vol = self.dev.volume(vol_id)?;
        self.dev.eba_map(&vol, lnum)
    }

    pub fn is_mapped(&self, vol_id: u32, lnum: u32) -> Result<bool> {
        Ok(self.leb_mapping(vol_id, lnum)?.is_some())
    }

    /// The PEB an LEB is mapped to
    pub fn leb_mapping(&self, vol_id: u32, lnum: u32) -> Result<Option<u32>> {
        let vol = self.dev.volume(vol_id)?;
        vol.check_lnum(lnum)?;
        Ok(vol.mapping(lnum))
    }

    /// Replace the whole contents of a volume
    pub fn update_volume(&self, vol_id: u32, data: &[u8]) -> Result<()> {
        let vol = self.dev.volume(vol_id)?;
        self.dev.eba_update_volume(&vol, data)
    }

    /// Read a static volume through, checking every LEB; returns whether the data is intact
    pub fn check_volume(&self, vol_id: u32) -> Result<bool> {
        let vol = self.dev.volume(vol_id)?;
        self.dev.eba_check_volume(&vol)
    }

    pub fn create_volume(&self, info: VolumeInfo) -> Result<()> {
        if self.dev.is_ro() {
            return Err(UbiError::ReadOnly);
        }

        let vol_id = info.vol_id;
        let reserved = info.reserved_pebs;
        let name = info.name.clone();
        let vol = Volume::new(info, self.dev.io.leb_size)?;
        if vol.is_static() {
            let mut state = vol.state.lock();
            state.used_ebs = 0;
            state.last_eb_bytes = 0;
        }

        let mut volumes = self.dev.volumes.write();
        if volumes.contains_key(&vol_id) {
            return Err(UbiError::VolumeExists(vol_id));
        }
        self.dev
            .capacity
            .lock()
            .reserve(reserved, &format!("volume {vol_id}"))?;
        volumes.insert(vol_id, Arc::new(vol));

        info!("created volume {vol_id} \"{name}\" with {reserved} LEBs");
        Ok(())
    }

    /// Remove a volume, releasing all of its PEBs
    pub fn remove_volume(&self, vol_id: u32) -> Result<()> {
        if self.dev.is_ro() {
            return Err(UbiError::ReadOnly);
        }

        let vol = self
            .dev
            .volumes
            .write()
            .remove(&vol_id)
            .ok_or(UbiError::NoVolume(vol_id))?;
        for lnum in 0..vol.info.reserved_pebs {
            self.dev.eba_unmap(&vol, lnum)?;
        }

        let mut cap = self.dev.capacity.lock();
        cap.release(vol.info.reserved_pebs);
        let more = cap.update_reserved();
        if more > 0 {
            info!("reserved {more} more PEBs for bad PEB handling");
        }

        info!("removed volume {vol_id}");
        Ok(())
    }

    pub fn volume_status(&self, vol_id: u32) -> Result<VolumeStatus> {
        let vol = self.dev.volume(vol_id)?;
        let state = *vol.state.lock();
        Ok(VolumeStatus {
            info: vol.info.clone(),
            usable_leb_size: vol.usable_leb_size,
            used_ebs: state.used_ebs,
            last_eb_bytes: state.last_eb_bytes,
            mapped_lebs: vol.mapped().len(),
            corrupted: vol.is_corrupted(),
            upd_marker: state.upd_marker,
        })
    }

    /// IDs of all volumes
    pub fn volume_ids(&self) -> Vec<u32> {
        self.dev.volumes.read().keys().copied().collect()
    }

    pub fn device_info(&self) -> DeviceInfo {
        let cap = *self.dev.capacity.lock();
        DeviceInfo {
            peb_count: cap.peb_count,
            peb_size: self.dev.io.peb_size,
            leb_size: self.dev.io.leb_size,
            min_io_size: self.dev.io.min_io_size,
            good_peb_count: cap.good_peb_count,
            bad_peb_count: cap.bad_peb_count,
            corr_peb_count: cap.corr_peb_count,
            bad_peb_limit: cap.bad_peb_limit,
            beb_rsvd_level: cap.beb_rsvd_level,
            beb_rsvd_pebs: cap.beb_rsvd_pebs,
            rsvd_pebs: cap.rsvd_pebs,
            avail_pebs: cap.avail_pebs,
            erroneous_peb_count: cap.erroneous_peb_count,
            image_seq: self.dev.ec_proto.image_seq,
            sqnum: self.dev.global_sqnum.load(Ordering::SeqCst),
            read_only: self.dev.is_ro(),
        }
    }

    pub fn wl_stats(&self) -> WlStats {
        self.dev.wl.state.lock().stats()
    }

    /// Which set a PEB belongs to right now
    pub fn peb_set(&self, pnum: u32) -> Option<PebSet> {
        self.dev.wl.state.lock().set_of(pnum)
    }

    pub fn erase_counter(&self, pnum: u32) -> Option<u64> {
        self.dev.wl.state.lock().ec(pnum)
    }

    /// Run every pending erasure and move, and wait for the background thread's current work
    pub fn flush(&self) -> Result<()> {
        self.dev.wl_flush()
    }

    /// Let the background thread work, or keep it idle
    pub fn set_background(&self, enabled: bool) {
        self.dev.wl_set_background(enabled)
    }

    pub fn is_read_only(&self) -> bool {
        self.dev.is_ro()
    }

    /// Check that every PEB is accounted for exactly once, and that the mappings agree
    pub fn self_check(&self) -> Result<()> {
        self.dev.self_check()
    }

    /// Detach: stop the background thread and run the pending erasures
    pub fn close(mut self) -> Result<()> {
        self.shutdown();
        match self.dev.is_ro() {
            true => Err(UbiError::ReadOnly),
            false => Ok(()),
        }
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        debug!("stopping the background thread");
        self.dev.wl.state.lock().closed = true;
        self.dev.wl.wakeup.notify_all();
        if worker.join().is_err() {
            error!("background thread panicked");
        }

        self.dev.drain_works();
        info!("detached");
    }
}

impl<N: Nand + 'static> Drop for Ubi<N> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{Nand, SimNand};
    use crate::ubi::testutil::*;
    use crate::ubi::VolType;

    #[test]
    fn test_blank_attach() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4), dynamic(1, 2)], quiet())?;

        let info = ubi.device_info();
        assert_eq!(info.peb_count, LAYOUT.blocks);
        assert_eq!(info.leb_size, 6 * 64);
        assert_eq!(info.bad_peb_limit, 1);
        assert_eq!(info.beb_rsvd_pebs, 1);
        assert_eq!(info.rsvd_pebs, 4 + 2 + 2 + 1);
        assert_eq!(info.avail_pebs, LAYOUT.blocks - info.rsvd_pebs);
        assert_eq!(ubi.volume_ids(), [0, 1]);
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_reattach_keeps_data() -> anyhow::Result<()> {
        let nand = sim();
        let vols = [dynamic(0, 4), VolumeInfo::new(3, VolType::Dynamic, 2).name("other")];
        {
            let ubi = attach(&nand, &vols, UbiConfig::default())?;
            ubi.write(0, 0, 0, &pattern(1, 128))?;
            ubi.write(0, 0, 128, &pattern(2, 64))?;
            ubi.atomic_change(0, 2, &pattern(3, 300))?;
            ubi.atomic_change(0, 2, &pattern(4, 200))?;
            ubi.write(3, 1, 64, &pattern(5, 64))?;
            ubi.close()?;
        }

        let ubi = attach(&nand, &vols, quiet())?;
        let mut buf = vec![0u8; 192];
        ubi.read(0, 0, 0, &mut buf)?;
        assert_eq!(&buf[..128], pattern(1, 128));
        assert_eq!(&buf[128..], pattern(2, 64));

        let mut buf = vec![0u8; 300];
        ubi.read(0, 2, 0, &mut buf)?;
        assert_eq!(&buf[..200], pattern(4, 200));
        assert!(buf[200..].iter().all(|&x| x == 0xFF));

        let mut buf = vec![0u8; 128];
        ubi.read(3, 1, 0, &mut buf)?;
        assert!(buf[..64].iter().all(|&x| x == 0xFF));
        assert_eq!(&buf[64..], pattern(5, 64));

        assert!(!ubi.is_mapped(0, 1)?);
        assert!(ubi.device_info().sqnum > 4);
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_unknown_volume_erased() -> anyhow::Result<()> {
        let nand = sim();
        {
            let ubi = attach(&nand, &[dynamic(0, 2), dynamic(7, 2)], quiet())?;
            ubi.write(7, 0, 0, &pattern(1, 64))?;
            ubi.write(0, 1, 0, &pattern(2, 64))?;
            ubi.close()?;
        }

        let ubi = attach(&nand, &[dynamic(0, 2)], quiet())?;
        assert!(matches!(ubi.read(7, 0, 0, &mut [0; 4]), Err(UbiError::NoVolume(7))));
        ubi.flush()?;
        assert_eq!(ubi.wl_stats().used, 1);
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_create_remove_volume() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[], quiet())?;
        let avail = ubi.device_info().avail_pebs;

        ubi.create_volume(dynamic(2, 5))?;
        assert!(matches!(
            ubi.create_volume(dynamic(2, 1)),
            Err(UbiError::VolumeExists(2))
        ));
        assert!(matches!(
            ubi.create_volume(dynamic(3, avail)),
            Err(UbiError::NotEnoughPebs { .. })
        ));
        assert_eq!(ubi.device_info().avail_pebs, avail - 5);

        ubi.write(2, 4, 0, &pattern(9, 64))?;
        ubi.remove_volume(2)?;
        assert_eq!(ubi.device_info().avail_pebs, avail);
        assert!(matches!(ubi.unmap(2, 4), Err(UbiError::NoVolume(2))));

        ubi.flush()?;
        assert_eq!(ubi.wl_stats().used, 0);
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_bad_blocks_at_attach() -> anyhow::Result<()> {
        let nand = sim();
        nand.mark_bad(3)?;
        nand.mark_bad(9)?;

        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;
        let info = ubi.device_info();
        assert_eq!(info.bad_peb_count, 2);
        assert_eq!(info.good_peb_count, LAYOUT.blocks - 2);
        // The limit is already exceeded, so there is nothing to reserve
        assert_eq!(info.beb_rsvd_pebs, 0);
        assert_eq!(ubi.peb_set(3), Some(PebSet::Bad));
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_not_enough_pebs() {
        let nand = sim();
        assert!(matches!(
            attach(&nand, &[dynamic(0, LAYOUT.blocks)], quiet()),
            Err(UbiError::NotEnoughPebs { .. })
        ));
    }

    #[test]
    fn test_close_drains_erasures() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;
        ubi.write(0, 0, 0, &pattern(1, 64))?;
        ubi.unmap(0, 0)?;
        assert!(ubi.wl_stats().pending_erase > 0);
        ubi.close()?;

        // Every PEB got erased and has an EC header
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;
        let stats = ubi.wl_stats();
        assert_eq!(stats.pending_erase, 0);
        assert_eq!(stats.free, LAYOUT.blocks as usize);
        Ok(())
    }

    #[test]
    fn test_background_thread() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], UbiConfig::default())?;
        ubi.write(0, 1, 0, &pattern(1, 64))?;

        // The worker gets everything erased without help
        for _ in 0..500 {
            if ubi.wl_stats().pending_erase == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(ubi.wl_stats().pending_erase, 0);

        ubi.set_background(false);
        ubi.unmap(0, 1)?;
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(ubi.wl_stats().pending_erase, 1);
        ubi.set_background(true);
        ubi.flush()?;
        assert_eq!(ubi.wl_stats().pending_erase, 0);
        Ok(())
    }

    #[test]
    fn test_read_only_blocks_writes() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;
        ubi.write(0, 0, 0, &pattern(1, 64))?;
        ubi.dev.set_ro_mode();

        assert!(matches!(ubi.write(0, 1, 0, &[1]), Err(UbiError::ReadOnly)));
        assert!(matches!(ubi.unmap(0, 0), Err(UbiError::ReadOnly)));
        let mut buf = vec![0u8; 64];
        ubi.read(0, 0, 0, &mut buf)?;
        assert_eq!(buf, pattern(1, 64));
        assert!(ubi.close().is_err());
        Ok(())
    }

    #[test]
    fn test_no_bad_block_support() -> anyhow::Result<()> {
        let nand = Arc::new(SimNand::new(LAYOUT).without_bad_blocks());
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;
        let info = ubi.device_info();
        assert_eq!(info.bad_peb_limit, 0);
        assert_eq!(info.beb_rsvd_pebs, 0);
        assert_eq!(info.rsvd_pebs, 4 + 2);
        Ok(())
    }
}
