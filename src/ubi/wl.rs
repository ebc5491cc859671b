//! The wear-leveling engine.
//!
//! Every good PEB is tracked here with its erase counter, in exactly one place: the `free`,
//! `used`, `scrub` or `erroneous` trees (ordered by erase counter), the protection queue, the
//! pending-erase queue, the move in progress, or the bad/corrupt sets.
//!
//! PEBs are handed out lowest erase counter first. Freshly handed-out PEBs sit in the protection
//! queue for a while, so that short-lived data is not moved around for nothing. When the least
//! worn PEB holding data falls too far behind the free PEBs, or when a PEB showed bitflips, the
//! background worker moves its data to a more worn free PEB. Released PEBs are erased in the
//! background; PEBs that fail to erase are retired as bad (or erroneous, when the flash cannot
//! mark blocks bad).

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::attach::AttachInfo;
use super::config::UbiConfig;
use super::device::UbiDevice;
use super::error::{MoveError, Result, UbiError};
use super::io::HdrStatus;
use super::UBI_MAX_ERASECOUNTER;
use crate::nand::Nand;

/// Number of buckets in the protection queue
pub(crate) const PROT_QUEUE_LEN: usize = 10;

/// PEBs reserved for wear-leveling moves
pub(crate) const WL_RESERVED_PEBS: u32 = 1;

/// Consecutive background failures tolerated before switching to read-only mode
const WL_MAX_FAILURES: u32 = 32;

/// The sets a PEB can belong to, as reported to users
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PebSet {
    /// Erased, with a valid EC header, ready to be handed out
    Free,

    /// Handed out: holding data, recently allocated, being moved or waiting to be erased
    Used,

    /// Holding data that showed bitflips, waiting to be moved elsewhere
    Scrub,

    /// Failed I/O on a flash that can't mark blocks bad; kept out of use
    Erroneous,

    /// Marked bad
    Bad,

    /// Found corrupted (or owned by an unknown internal volume) at attach; preserved, never used
    Corrupt,
}

/// Where exactly a PEB is
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Place {
    Free,
    Used,
    Scrub,
    Erroneous,

    /// In the protection queue
    Protected,

    /// In the pending-erase queue
    Erasing,

    /// Source or target of the move in progress
    Moving,

    Bad,
    Corrupt,
}

impl Place {
    fn set(self) -> PebSet {
        match self {
            Self::Free => PebSet::Free,
            Self::Used | Self::Protected | Self::Erasing | Self::Moving => PebSet::Used,
            Self::Scrub => PebSet::Scrub,
            Self::Erroneous => PebSet::Erroneous,
            Self::Bad => PebSet::Bad,
            Self::Corrupt => PebSet::Corrupt,
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct WlEntry {
    ec: u64,
    place: Place,
}

#[derive(Debug)]
struct EraseWork {
    pnum: u32,

    /// The LEB the PEB used to hold, for the logs
    leb: Option<(u32, u32)>,

    torture: bool,

    /// The PEB was erroneous; it is paid for, and gets paid back if it erases fine
    charged: bool,
}

#[derive(Debug)]
enum Work {
    Erase(EraseWork),
    WearLevel,
}

/// Counters and set sizes of the wear-leveling engine
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct WlStats {
    pub free: usize,
    pub used: usize,
    pub scrub: usize,
    pub erroneous: usize,
    pub bad: usize,
    pub corrupt: usize,

    /// Of the `used` PEBs, how many are in the protection queue
    pub protected: usize,

    /// Of the `used` PEBs, how many are waiting to be erased
    pub pending_erase: usize,

    /// Lowest and highest erase counters of the PEBs in use or free
    pub min_ec: u64,
    pub max_ec: u64,

    /// Wear-leveling moves completed
    pub moves: u64,

    /// Scrubbing moves completed
    pub scrubs: u64,

    /// Erasures completed (a torture counts once)
    pub erasures: u64,

    /// Erasures that involved a torture test
    pub tortures: u64,
}

type EcTree = BTreeSet<(u64, u32)>;

#[derive(Debug)]
pub(crate) struct WlState {
    lookup: BTreeMap<u32, WlEntry>,
    free: EcTree,
    used: EcTree,
    scrub: EcTree,
    erroneous: EcTree,

    pq: [Vec<u32>; PROT_QUEUE_LEN],
    pq_head: usize,

    move_from: Option<u32>,
    move_to: Option<u32>,

    /// The move target was released while the move was running
    move_to_put: bool,

    /// A wear-leveling work is queued or running
    wl_scheduled: bool,

    works: VecDeque<Work>,

    /// No new work is accepted; the background thread is going away
    pub closed: bool,

    /// The background thread may run
    pub background: bool,

    stats: WlStats,
}

impl WlState {
    pub fn new(background: bool) -> Self {
        Self {
            lookup: Default::default(),
            free: Default::default(),
            used: Default::default(),
            scrub: Default::default(),
            erroneous: Default::default(),
            pq: std::array::from_fn(|_| Vec::new()),
            pq_head: 0,
            move_from: None,
            move_to: None,
            move_to_put: false,
            wl_scheduled: false,
            works: Default::default(),
            closed: false,
            background,
            stats: Default::default(),
        }
    }

    /// Take over the PEBs found at attach time; anything on the erase list is queued for erasure
    pub fn populate(&mut self, ai: &AttachInfo) {
        let mean_ec = ai.mean_ec;

        for &pnum in &ai.bad {
            self.place(pnum, 0, Place::Bad);
        }
        for peb in ai.corrupted.iter().chain(ai.alien.iter()) {
            self.place(peb.pnum, peb.ec.unwrap_or(mean_ec), Place::Corrupt);
        }
        for peb in &ai.free {
            self.place(peb.pnum, peb.ec.unwrap_or(mean_ec), Place::Free);
        }
        for leb in ai.volumes.values().flat_map(|av| av.lebs.values()) {
            let place = match leb.scrub {
                true => Place::Scrub,
                false => Place::Used,
            };
            self.place(leb.pnum, leb.ec.unwrap_or(mean_ec), place);
        }
        for peb in &ai.erase {
            self.place(peb.pnum, peb.ec.unwrap_or(mean_ec), Place::Erasing);
            self.works.push_back(Work::Erase(EraseWork {
                pnum: peb.pnum,
                leb: None,
                torture: peb.scrub,
                charged: false,
            }));
        }
    }

    fn tree(&mut self, place: Place) -> Option<&mut EcTree> {
        match place {
            Place::Free => Some(&mut self.free),
            Place::Used => Some(&mut self.used),
            Place::Scrub => Some(&mut self.scrub),
            Place::Erroneous => Some(&mut self.erroneous),
            _ => None,
        }
    }

    fn entry(&self, pnum: u32) -> Option<WlEntry> {
        self.lookup.get(&pnum).copied()
    }

    /// Take the PEB out of whatever container holds it
    fn detach(&mut self, pnum: u32) {
        let Some(entry) = self.entry(pnum) else {
            return;
        };
        if let Some(tree) = self.tree(entry.place) {
            tree.remove(&(entry.ec, pnum));
        }
        if entry.place == Place::Protected {
            for bucket in self.pq.iter_mut() {
                bucket.retain(|&x| x != pnum);
            }
        }
    }

    /// Move the PEB to `place`, with erase counter `ec`
    fn place(&mut self, pnum: u32, ec: u64, place: Place) {
        self.detach(pnum);
        self.lookup.insert(pnum, WlEntry { ec, place });
        if let Some(tree) = self.tree(place) {
            tree.insert((ec, pnum));
        }
        if place == Place::Protected {
            // The newest bucket is the one just behind the head
            let tail = (self.pq_head + PROT_QUEUE_LEN - 1) % PROT_QUEUE_LEN;
            self.pq[tail].push(pnum);
        }
    }

    /// Age the protection queue by one step: the oldest bucket's PEBs become ordinary used PEBs
    fn serve_prot_queue(&mut self) {
        let bucket = std::mem::take(&mut self.pq[self.pq_head]);
        for pnum in bucket {
            if let Some(entry) = self.entry(pnum) {
                debug!("PEB {pnum} EC {} protection over", entry.ec);
                self.lookup.insert(
                    pnum,
                    WlEntry {
                        ec: entry.ec,
                        place: Place::Used,
                    },
                );
                self.used.insert((entry.ec, pnum));
            }
        }
        self.pq_head = (self.pq_head + 1) % PROT_QUEUE_LEN;
    }

    /// The most worn free PEB whose erase counter is less than the least worn one's plus `diff`
    fn wl_target(&self, diff: u64) -> Option<(u64, u32)> {
        let &(min_ec, _) = self.free.first()?;
        self.free.range(..(min_ec + diff, 0)).next_back().copied()
    }

    /// Erase jobs go before wear-leveling
    fn next_work(&mut self) -> Option<Work> {
        match self.works.iter().position(|w| matches!(w, Work::Erase(_))) {
            Some(i) => self.works.remove(i),
            None => self.works.pop_front(),
        }
    }

    pub fn set_of(&self, pnum: u32) -> Option<PebSet> {
        self.entry(pnum).map(|entry| entry.place.set())
    }

    pub fn ec(&self, pnum: u32) -> Option<u64> {
        self.entry(pnum).map(|entry| entry.ec)
    }

    /// Is the PEB somewhere a mapped LEB may legitimately point? An erroneous PEB can still be
    /// mapped, when its data could not be read for a move
    pub fn holds_data(&self, pnum: u32) -> bool {
        self.entry(pnum).is_some_and(|entry| {
            matches!(
                entry.place,
                Place::Used | Place::Protected | Place::Scrub | Place::Moving | Place::Erroneous
            )
        })
    }

    pub fn stats(&self) -> WlStats {
        let mut stats = WlStats {
            min_ec: u64::MAX,
            ..self.stats
        };

        for entry in self.lookup.values() {
            match entry.place.set() {
                PebSet::Free => stats.free += 1,
                PebSet::Used => stats.used += 1,
                PebSet::Scrub => stats.scrub += 1,
                PebSet::Erroneous => stats.erroneous += 1,
                PebSet::Bad => stats.bad += 1,
                PebSet::Corrupt => stats.corrupt += 1,
            }
            match entry.place {
                Place::Protected => stats.protected += 1,
                Place::Erasing => stats.pending_erase += 1,
                _ => {}
            }
            if !matches!(entry.place, Place::Bad | Place::Corrupt) {
                stats.min_ec = std::cmp::min(stats.min_ec, entry.ec);
                stats.max_ec = std::cmp::max(stats.max_ec, entry.ec);
            }
        }

        if stats.min_ec == u64::MAX {
            stats.min_ec = 0;
        }
        stats
    }

    /// Verify that every PEB is in exactly one place, and the trees agree with the lookup table
    pub fn check(&self, peb_count: u32) -> std::result::Result<(), String> {
        if let Some(pnum) = (0..peb_count).find(|pnum| !self.lookup.contains_key(pnum)) {
            return Err(format!("PEB {pnum} is not tracked"));
        }

        let trees = [
            (Place::Free, &self.free),
            (Place::Used, &self.used),
            (Place::Scrub, &self.scrub),
            (Place::Erroneous, &self.erroneous),
        ];
        for (&pnum, entry) in &self.lookup {
            for (place, tree) in trees {
                if tree.contains(&(entry.ec, pnum)) != (entry.place == place) {
                    return Err(format!("PEB {pnum} ({entry:?}) disagrees with the {place:?} tree"));
                }
            }

            let queued = self.pq.iter().flatten().filter(|&&x| x == pnum).count();
            if queued != usize::from(entry.place == Place::Protected) {
                return Err(format!("PEB {pnum} ({entry:?}) is queued {queued} times"));
            }

            let moving = self.move_from == Some(pnum) || self.move_to == Some(pnum);
            if moving != (entry.place == Place::Moving) {
                return Err(format!("PEB {pnum} ({entry:?}) disagrees with the move state"));
            }
        }

        for (place, tree) in trees {
            if let Some((ec, pnum)) = tree
                .iter()
                .find(|(ec, pnum)| self.entry(*pnum).map(|e| (e.ec, e.place)) != Some((*ec, place)))
            {
                return Err(format!("stale entry ({ec}, {pnum}) in the {place:?} tree"));
            }
        }

        Ok(())
    }

    #[cfg(test)]
    pub fn peek_free(&self) -> Option<u32> {
        self.free.first().map(|&(_, pnum)| pnum)
    }
}

/// Wear-leveling state and the synchronization around it
pub(crate) struct Wl {
    pub state: Mutex<WlState>,

    /// Signalled when work is queued (or the state changes in a way the worker cares about)
    pub wakeup: Condvar,

    /// Held for the whole duration of a move
    move_mutex: Mutex<()>,

    /// Held shared while a work executes, exclusively to wait for running works
    work_sem: RwLock<()>,

    threshold: u64,
    max_erroneous: usize,
    low_water: usize,
}

impl Wl {
    pub fn new(state: WlState, config: &UbiConfig, peb_count: u32) -> Self {
        Self {
            state: Mutex::new(state),
            wakeup: Condvar::new(),
            move_mutex: Mutex::new(()),
            work_sem: RwLock::new(()),
            threshold: config.wl_threshold,
            max_erroneous: config.max_erroneous(peb_count),
            low_water: config.free_low_water,
        }
    }
}

/// What happened to a wear-leveling move
enum MoveOutcome {
    Moved {
        vol_id: u32,
        lnum: u32,
    },

    /// Nothing changed: the source goes to `source`, the target gets erased
    NotMoved {
        source: Place,
        torture: bool,
    },

    Failed(UbiError),
}

impl<N: Nand> UbiDevice<N> {
    /// Hand out the least worn free PEB
    pub(crate) fn wl_get_peb(&self) -> Result<u32> {
        loop {
            if self.is_ro() {
                return Err(UbiError::ReadOnly);
            }

            let mut st = self.wl.state.lock();
            if let Some(&(ec, pnum)) = st.free.first() {
                st.place(pnum, ec, Place::Protected);
                let low = st.free.len() < self.wl.low_water;
                drop(st);

                debug!("PEB {pnum} EC {ec}");
                if low {
                    self.replenish_free();
                }
                return Ok(pnum);
            }
            drop(st);

            // Nothing is free: do pending work right here to produce a free PEB
            if !self.do_work()? {
                // Maybe the background thread is in the middle of producing one
                drop(self.wl.work_sem.write());
                let st = self.wl.state.lock();
                if st.free.is_empty() && st.works.is_empty() {
                    error!("no free eraseblocks");
                    return Err(UbiError::NoSpace);
                }
            }
        }
    }

    /// Run queued erasures right here until the free PEBs are back at the low-water mark
    fn replenish_free(&self) {
        loop {
            let _sem = self.wl.work_sem.read();
            if self.is_ro() {
                return;
            }

            let erase = {
                let mut st = self.wl.state.lock();
                if st.free.len() >= self.wl.low_water {
                    return;
                }
                let Some(i) = st.works.iter().position(|w| matches!(w, Work::Erase(_))) else {
                    return;
                };
                match st.works.remove(i) {
                    Some(Work::Erase(erase)) => erase,
                    _ => return,
                }
            };

            debug!("below {} free PEBs, erase PEB {} now", self.wl.low_water, erase.pnum);
            if let Err(err) = self.erase_worker(erase) {
                warn!("cannot replenish free PEBs: {err}");
                return;
            }
        }
    }

    /// Give a PEB back once its LEB no longer needs it; it is erased (and tortured, if asked)
    /// before it becomes free again
    pub(crate) fn wl_put_peb(&self, vol_id: u32, lnum: u32, pnum: u32, torture: bool) -> Result<()> {
        debug!("PEB {pnum}, LEB {vol_id}:{lnum}, torture {torture}");

        loop {
            let mut st = self.wl.state.lock();
            if st.closed {
                return Err(UbiError::Shutdown);
            }

            let Some(entry) = st.entry(pnum) else {
                return Err(UbiError::SelfCheck(format!("put of unknown PEB {pnum}")));
            };

            if st.move_from == Some(pnum) {
                // The PEB is being moved: once the move is over (most likely cancelled, since the
                // caller holds the LEB), it will be somewhere it can be put from
                debug!("PEB {pnum} is being moved, wait");
                drop(st);
                drop(self.wl.move_mutex.lock());
                continue;
            }

            if st.move_to == Some(pnum) {
                // The mover will schedule the erasure once it is done with the PEB
                debug!("PEB {pnum} is the target of data moving");
                st.move_to_put = true;
                return Ok(());
            }

            let torture = match entry.place {
                Place::Used | Place::Protected | Place::Scrub => torture,
                Place::Erroneous => {
                    info!("PEB {pnum} was erroneous, torture it");
                    true
                }
                Place::Erasing => {
                    warn!("PEB {pnum} is already waiting to be erased");
                    return Ok(());
                }
                place => {
                    return Err(UbiError::SelfCheck(format!(
                        "put of PEB {pnum}, which is {place:?}"
                    )))
                }
            };

            self.schedule_erase(&mut st, pnum, entry.ec, Some((vol_id, lnum)), torture);
            return Ok(());
        }
    }

    /// Ask for the data in a PEB to be moved, because it showed bitflips
    pub(crate) fn wl_scrub_peb(&self, pnum: u32) {
        info!("schedule PEB {pnum} for scrubbing");

        loop {
            let mut st = self.wl.state.lock();
            let Some(entry) = st.entry(pnum) else {
                return;
            };

            if st.move_from == Some(pnum) || entry.place == Place::Scrub {
                // Being moved (or about to be) anyway
                return;
            }

            if st.move_to == Some(pnum) {
                // The move will end shortly, then the PEB will be in a tree
                drop(st);
                std::thread::yield_now();
                continue;
            }

            if !matches!(entry.place, Place::Used | Place::Protected) {
                return;
            }

            st.place(pnum, entry.ec, Place::Scrub);
            drop(st);

            self.ensure_wear_leveling();
            return;
        }
    }

    /// Run every pending work, and wait for whatever the background thread is doing
    pub(crate) fn wl_flush(&self) -> Result<()> {
        debug!("flush pending work");
        loop {
            while self.do_work()? {}

            drop(self.wl.work_sem.write());

            let st = self.wl.state.lock();
            if st.works.is_empty() || self.is_ro() {
                return Ok(());
            }
        }
    }

    /// Let the background thread run, or stop it from picking up new work
    pub(crate) fn wl_set_background(&self, enabled: bool) {
        self.wl.state.lock().background = enabled;
        self.wl.wakeup.notify_all();
    }

    /// Queue the erasure of a PEB; the caller holds the state lock
    fn schedule_erase(
        &self,
        st: &mut WlState,
        pnum: u32,
        ec: u64,
        leb: Option<(u32, u32)>,
        torture: bool,
    ) {
        let charged = st.entry(pnum).is_some_and(|entry| entry.place == Place::Erroneous);
        let torture = torture || charged;
        debug!("schedule erasure of PEB {pnum}, EC {ec}, torture {torture}");
        st.place(pnum, ec, Place::Erasing);
        st.works.push_back(Work::Erase(EraseWork {
            pnum,
            leb,
            torture,
            charged,
        }));
        self.wl.wakeup.notify_one();
    }

    /// Schedule a move if one is needed and none is scheduled already
    pub(crate) fn ensure_wear_leveling(&self) {
        let mut st = self.wl.state.lock();
        if st.wl_scheduled || st.closed {
            return;
        }

        if st.scrub.is_empty() {
            // The least worn used PEB against the most worn free PEB we would move to
            let (Some(&(min_used_ec, _)), Some((target_ec, _))) =
                (st.used.first(), st.wl_target(2 * self.wl.threshold))
            else {
                return;
            };
            if target_ec.saturating_sub(min_used_ec) < self.wl.threshold {
                return;
            }
            debug!("schedule wear-leveling: min used EC {min_used_ec}, target EC {target_ec}");
        } else {
            debug!("schedule scrubbing");
        }

        st.wl_scheduled = true;
        st.works.push_back(Work::WearLevel);
        self.wl.wakeup.notify_one();
    }

    /// Execute one pending work; returns false if there was none (or the device is read-only)
    pub(crate) fn do_work(&self) -> Result<bool> {
        let _sem = self.wl.work_sem.read();
        if self.is_ro() {
            return Ok(false);
        }

        let Some(work) = self.wl.state.lock().next_work() else {
            return Ok(false);
        };

        match work {
            Work::Erase(erase) => self.erase_worker(erase)?,
            Work::WearLevel => self.wear_leveling_worker()?,
        }
        Ok(true)
    }

    /// Erase everything still queued; used at shutdown, once the background thread is gone
    pub(crate) fn drain_works(&self) {
        loop {
            let Some(work) = self.wl.state.lock().next_work() else {
                return;
            };

            match work {
                Work::WearLevel => self.wl.state.lock().wl_scheduled = false,
                Work::Erase(_) if self.is_ro() => {}
                Work::Erase(erase) => {
                    if let Err(err) = self.erase_worker(erase) {
                        error!("erasure failed during shutdown: {err}");
                    }
                }
            }
        }
    }

    fn erase_worker(&self, work: EraseWork) -> Result<()> {
        let EraseWork {
            pnum,
            leb,
            torture,
            charged,
        } = work;
        let Some(ec) = self.wl.state.lock().ec(pnum) else {
            return Err(UbiError::SelfCheck(format!("erase of unknown PEB {pnum}")));
        };
        if let Some((vol_id, lnum)) = leb {
            debug!("erase PEB {pnum} EC {ec}, LEB {vol_id}:{lnum}");
        }

        match self.sync_erase(pnum, ec, torture) {
            Ok(ec) => {
                let mut st = self.wl.state.lock();
                st.place(pnum, ec, Place::Free);
                st.stats.erasures += 1;
                if torture {
                    st.stats.tortures += 1;
                }
                st.serve_prot_queue();
                drop(st);

                if charged {
                    info!("erroneous PEB {pnum} passed the torture test, back in use");
                    let more = self.capacity.lock().recover_erroneous();
                    if more > 0 {
                        info!("reserved {more} more PEBs for bad PEB handling");
                    }
                }

                self.ensure_wear_leveling();
                Ok(())
            }

            Err(err) if err.is_transient() => {
                warn!("erasure of PEB {pnum} interrupted, retry later: {err}");
                let mut st = self.wl.state.lock();
                st.works.push_back(Work::Erase(EraseWork {
                    pnum,
                    leb,
                    torture,
                    charged,
                }));
                Ok(())
            }

            Err(err) if err.is_media_failure() => {
                error!("failed to erase PEB {pnum}: {err}");
                let retired = self.retire_peb(pnum, ec, charged);
                self.ensure_wear_leveling();
                retired
            }

            Err(err) => {
                error!("failed to erase PEB {pnum}: {err}");
                self.set_ro_mode();
                Err(err)
            }
        }
    }

    /// Erase a PEB and give it a new EC header; returns the new erase counter
    fn sync_erase(&self, pnum: u32, ec: u64, torture: bool) -> Result<u64> {
        let ec = ec + self.io.sync_erase(pnum, torture)?;
        if ec > UBI_MAX_ERASECOUNTER {
            error!("erase counter overflow at PEB {pnum}, EC {ec}");
            return Err(UbiError::EcOverflow { pnum });
        }

        debug!("erased PEB {pnum}, new EC {ec}");
        self.io.write_ec_hdr(pnum, self.ec_proto.ec(ec))?;
        Ok(ec)
    }

    /// Take a failing PEB out of service for good: mark it bad, or if the flash can't do that,
    /// keep it in the erroneous set. A `charged` PEB was erroneous already and is paid for.
    fn retire_peb(&self, pnum: u32, ec: u64, charged: bool) -> Result<()> {
        let (place, from_reserve) = match self.retire_to(pnum, charged) {
            Ok(retired) => retired,
            Err(err) => {
                self.set_ro_mode();
                return Err(err);
            }
        };
        self.wl.state.lock().place(pnum, ec, place);

        let mut cap = self.capacity.lock();
        match from_reserve {
            Some(false) => warn!("no PEBs in the reserved pool, used an available PEB"),
            Some(true) if cap.beb_rsvd_pebs > 0 => {
                info!("{} PEBs left in the reserve", cap.beb_rsvd_pebs)
            }
            Some(true) => warn!("last PEB from the reserve was used"),
            None => {}
        }

        let more = cap.update_reserved();
        if more > 0 {
            info!("reserved {more} more PEBs for bad PEB handling");
        }

        Ok(())
    }

    /// Where a failing PEB goes; unless it was paid for already, also pay for it and say whether
    /// the bad-block reserve did
    fn retire_to(&self, pnum: u32, charged: bool) -> Result<(Place, Option<bool>)> {
        if !self.io.bad_allowed {
            if charged {
                warn!("PEB {pnum} still fails, keeping it as erroneous");
                return Ok((Place::Erroneous, None));
            }

            let count = self.wl.state.lock().erroneous.len();
            let from_reserve = self.charge_erroneous(count)?;
            warn!("PEB {pnum} cannot be marked bad, keeping it as erroneous");
            return Ok((Place::Erroneous, Some(from_reserve)));
        }

        let from_reserve = match charged {
            true => None,
            false => Some(self.capacity.lock().take_one()?),
        };

        warn!("mark PEB {pnum} as bad");
        if let Err(err) = self.io.mark_bad(pnum) {
            if let Some(from_reserve) = from_reserve {
                self.capacity.lock().give_back(from_reserve);
            }
            return Err(err);
        }

        let mut cap = self.capacity.lock();
        if charged {
            cap.erroneous_peb_count = cap.erroneous_peb_count.saturating_sub(1);
        }
        cap.good_peb_count -= 1;
        cap.bad_peb_count += 1;
        cap.calculate_reserved();
        Ok((Place::Bad, from_reserve))
    }

    /// Pay for one more erroneous PEB, `count` being how many there are already
    fn charge_erroneous(&self, count: usize) -> Result<bool> {
        if count >= self.wl.max_erroneous {
            error!("too many erroneous eraseblocks ({count})");
            return Err(UbiError::TooManyErroneous(count));
        }

        let mut cap = self.capacity.lock();
        let from_reserve = cap.take_one()?;
        cap.erroneous_peb_count += 1;
        let more = cap.update_reserved();
        if more > 0 {
            info!("reserved {more} more PEBs for bad PEB handling");
        }
        Ok(from_reserve)
    }

    /// Move data from a little worn (or bitflipping) PEB to a more worn free one
    fn wear_leveling_worker(&self) -> Result<()> {
        let _move = self.wl.move_mutex.lock();

        let ((from_ec, from), (to_ec, to), scrubbing) = {
            let mut st = self.wl.state.lock();

            let Some(&target) = st.free.first() else {
                // No free PEBs to move to: this work is scheduled again once there are some
                debug!("cancel WL, no free PEBs");
                st.wl_scheduled = false;
                return Ok(());
            };

            let (source, scrubbing) = match (st.scrub.first(), st.used.first()) {
                (Some(&source), _) => (source, true),
                (None, Some(&source)) => (source, false),
                (None, None) => {
                    debug!("cancel WL, nothing to move");
                    st.wl_scheduled = false;
                    return Ok(());
                }
            };

            let target = st.wl_target(2 * self.wl.threshold).unwrap_or(target);
            if !scrubbing && target.0.saturating_sub(source.0) < self.wl.threshold {
                debug!("no WL needed: min used EC {}, max free EC {}", source.0, target.0);
                st.wl_scheduled = false;
                return Ok(());
            }

            st.place(source.1, source.0, Place::Moving);
            st.place(target.1, target.0, Place::Moving);
            st.move_from = Some(source.1);
            st.move_to = Some(target.1);
            (source, target, scrubbing)
        };

        debug!(
            "{} PEB {from} (EC {from_ec}) to PEB {to} (EC {to_ec})",
            if scrubbing { "scrub" } else { "move" }
        );

        let keep = match scrubbing {
            true => Place::Scrub,
            false => Place::Used,
        };
        let outcome = self.move_peb(from, to, keep);

        let mut st = self.wl.state.lock();
        st.move_from = None;
        st.move_to = None;
        st.wl_scheduled = false;
        let target_put = std::mem::take(&mut st.move_to_put);

        match outcome {
            MoveOutcome::Moved { vol_id, lnum } => {
                if scrubbing {
                    st.stats.scrubs += 1;
                    info!("scrubbed PEB {from} (LEB {vol_id}:{lnum}), data moved to PEB {to}");
                } else {
                    st.stats.moves += 1;
                    debug!("moved LEB {vol_id}:{lnum} from PEB {from} to PEB {to}");
                }

                if target_put {
                    // The LEB was unmapped while its data was moving
                    debug!("PEB {to} was put meanwhile, erase");
                    self.schedule_erase(&mut st, to, to_ec, Some((vol_id, lnum)), false);
                } else {
                    st.place(to, to_ec, Place::Used);
                }
                self.schedule_erase(&mut st, from, from_ec, Some((vol_id, lnum)), false);
                Ok(())
            }

            MoveOutcome::NotMoved { source, torture } => {
                if source == Place::Erroneous {
                    if let Err(err) = self.charge_erroneous(st.erroneous.len()) {
                        st.place(from, from_ec, keep);
                        self.schedule_erase(&mut st, to, to_ec, None, false);
                        drop(st);
                        self.set_ro_mode();
                        return Err(err);
                    }
                }

                debug!("cancel moving PEB {from} to PEB {to}, source goes to {source:?}");
                st.place(from, from_ec, source);
                self.schedule_erase(&mut st, to, to_ec, None, torture);
                Ok(())
            }

            MoveOutcome::Failed(err) => {
                error!("error while moving PEB {from} to PEB {to}: {err}");
                st.place(from, from_ec, keep);
                self.schedule_erase(&mut st, to, to_ec, None, true);
                drop(st);
                self.set_ro_mode();
                Err(err)
            }
        }
    }

    /// Copy the LEB held by `from` into `to`, through the EBA layer
    fn move_peb(&self, from: u32, to: u32, keep: Place) -> MoveOutcome {
        let vid = match self.io.read_vid_hdr(from) {
            Ok(HdrStatus::Valid(vid) | HdrStatus::Corrected(vid)) => vid,
            Ok(HdrStatus::Empty) => {
                // Allocated, but the VID header is not written yet; more data is likely on the
                // way, so protect it for now and move it later
                debug!("PEB {from} has no VID header");
                return MoveOutcome::NotMoved {
                    source: Place::Protected,
                    torture: false,
                };
            }
            Ok(HdrStatus::EmptyBitflips) => {
                debug!("PEB {from} has no VID header but has bit-flips");
                return MoveOutcome::NotMoved {
                    source: Place::Scrub,
                    torture: false,
                };
            }
            Ok(status) => {
                error!("cannot read VID header of PEB {from}: {status:?}");
                return MoveOutcome::NotMoved {
                    source: Place::Erroneous,
                    torture: false,
                };
            }
            Err(err) => return MoveOutcome::Failed(err),
        };

        match self.eba_copy_leb(from, to, &vid) {
            Ok(()) => MoveOutcome::Moved {
                vol_id: vid.vol_id,
                lnum: vid.lnum,
            },
            Err(MoveError::CancelRace) => MoveOutcome::NotMoved {
                source: Place::Protected,
                torture: false,
            },
            Err(MoveError::Retry) => MoveOutcome::NotMoved {
                source: Place::Scrub,
                torture: false,
            },
            Err(MoveError::TargetWrite | MoveError::TargetBitflips) => MoveOutcome::NotMoved {
                source: keep,
                torture: true,
            },
            Err(MoveError::SourceRead) => MoveOutcome::NotMoved {
                source: Place::Erroneous,
                torture: false,
            },
            Err(MoveError::Failed(err)) => MoveOutcome::Failed(err),
        }
    }
}

/// The background worker: erase jobs first, then at most one move, then wait for more
pub(crate) fn background_thread<N: Nand>(ubi: Arc<UbiDevice<N>>) {
    info!("background thread started");
    let mut failures = 0;

    loop {
        {
            let mut st = ubi.wl.state.lock();
            while !st.closed && (st.works.is_empty() || !st.background || ubi.is_ro()) {
                ubi.wl.wakeup.wait(&mut st);
            }
            if st.closed {
                break;
            }
        }

        match ubi.do_work() {
            Ok(_) => failures = 0,
            Err(err) => {
                error!("work failed: {err}");
                failures += 1;
                if failures > WL_MAX_FAILURES {
                    error!("{failures} consecutive failures, switching to read-only mode");
                    ubi.set_ro_mode();
                }
            }
        }
    }

    info!("background thread stopped");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{Faults, Nand, SimNand};
    use crate::ubi::testutil::*;

    fn state_with_free(ecs: &[u64]) -> WlState {
        let mut st = WlState::new(false);
        for (pnum, &ec) in (0..).zip(ecs) {
            st.place(pnum, ec, Place::Free);
        }
        st
    }

    #[test]
    fn test_wl_target() {
        let st = state_with_free(&[5, 9, 12, 30, 100]);
        assert_eq!(st.wl_target(8), Some((12, 2)));
        assert_eq!(st.wl_target(1), Some((5, 0)));
        assert_eq!(st.wl_target(1000), Some((100, 4)));
        assert_eq!(WlState::new(false).wl_target(8), None);
    }

    #[test]
    fn test_protection_queue() {
        let mut st = state_with_free(&[1, 1, 1]);
        st.place(0, 1, Place::Protected);
        assert_eq!(st.set_of(0), Some(PebSet::Used));
        assert!(st.used.is_empty());

        // A PEB stays protected for a whole cycle of the queue
        for _ in 0..PROT_QUEUE_LEN - 1 {
            st.serve_prot_queue();
            assert!(st.used.is_empty());
        }
        st.serve_prot_queue();
        assert!(st.used.contains(&(1, 0)));
        assert!(st.check(3).is_ok());
    }

    #[test]
    fn test_check_catches_strays() {
        let mut st = state_with_free(&[1, 2]);
        assert!(st.check(2).is_ok());
        assert!(st.check(3).is_err());

        st.used.insert((2, 1));
        assert!(st.check(2).is_err());
    }

    #[test]
    fn test_erase_on_attach() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[], quiet())?;

        // A blank flash is all pending erasures until someone runs them
        let stats = ubi.wl_stats();
        assert_eq!(stats.pending_erase, LAYOUT.blocks as usize);
        assert_eq!(stats.free, 0);

        ubi.flush()?;
        let stats = ubi.wl_stats();
        assert_eq!(stats.free, LAYOUT.blocks as usize);
        assert_eq!((stats.min_ec, stats.max_ec), (1, 1));
        assert_eq!(stats.erasures, u64::from(LAYOUT.blocks));
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_get_peb_lowest_ec() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[], quiet())?;
        ubi.flush()?;

        let dev = &ubi.dev;
        let first = dev.wl_get_peb()?;
        dev.wl_put_peb(0, 0, first, false)?;
        dev.wl_flush()?;
        assert_eq!(ubi.erase_counter(first), Some(2));

        // Every other PEB is less worn now, so `first` comes last
        let mut handed_out = Vec::new();
        for _ in 0..LAYOUT.blocks {
            handed_out.push(dev.wl_get_peb()?);
        }
        assert_eq!(handed_out.last(), Some(&first));
        assert!(matches!(dev.wl_get_peb(), Err(UbiError::NoSpace)));
        dev.self_check()?;
        Ok(())
    }

    #[test]
    fn test_torture_failure_marks_bad() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[], quiet())?;
        ubi.flush()?;
        let dev = &ubi.dev;
        let before = ubi.device_info();

        let victim = dev.wl_get_peb()?;
        nand.set_faults(
            victim,
            Faults {
                erase: true,
                ..Default::default()
            },
        );
        dev.wl_put_peb(0, 0, victim, true)?;
        dev.wl_flush()?;

        assert_eq!(ubi.peb_set(victim), Some(PebSet::Bad));
        assert!(nand.is_bad(victim)?);
        let after = ubi.device_info();
        assert_eq!(after.bad_peb_count, before.bad_peb_count + 1);
        assert_eq!(after.beb_rsvd_pebs, before.beb_rsvd_pebs - 1);
        assert!(!ubi.is_read_only());

        // It never comes back
        while let Ok(pnum) = dev.wl_get_peb() {
            assert_ne!(pnum, victim);
        }
        dev.self_check()?;
        Ok(())
    }

    #[test]
    fn test_reserve_exhaustion() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[], quiet())?;
        ubi.flush()?;
        let dev = &ubi.dev;

        // One PEB comes out of the bad-block reserve, the rest out of the available PEBs
        let available = ubi.device_info().avail_pebs;
        let mut retired = 0;
        while !ubi.is_read_only() {
            let pnum = dev.wl_get_peb()?;
            nand.set_faults(
                pnum,
                Faults {
                    erase: true,
                    ..Default::default()
                },
            );
            dev.wl_put_peb(0, 0, pnum, false)?;
            let _ = dev.wl_flush();
            retired += 1;
        }

        assert_eq!(retired, available + 2);
        assert_eq!(ubi.device_info().avail_pebs, 0);
        Ok(())
    }

    #[test]
    fn test_erroneous_without_bad_blocks() -> anyhow::Result<()> {
        let nand = Arc::new(SimNand::new(LAYOUT).without_bad_blocks());
        let ubi = attach(&nand, &[], quiet())?;
        ubi.flush()?;
        let dev = &ubi.dev;

        let before = ubi.device_info();
        assert_eq!(before.beb_rsvd_pebs, 0);

        let victim = dev.wl_get_peb()?;
        nand.set_faults(
            victim,
            Faults {
                erase: true,
                ..Default::default()
            },
        );
        dev.wl_put_peb(0, 0, victim, false)?;
        dev.wl_flush()?;
        assert_eq!(ubi.peb_set(victim), Some(PebSet::Erroneous));
        assert_eq!(ubi.wl_stats().erroneous, 1);

        let info = ubi.device_info();
        assert_eq!(info.avail_pebs, before.avail_pebs - 1);
        assert_eq!(info.erroneous_peb_count, 1);
        assert_eq!(info.good_peb_count, LAYOUT.blocks);
        dev.self_check()?;

        // Releasing an erroneous PEB always tortures it; with the fault gone it comes back, and
        // so does the capacity it took
        nand.clear_faults(victim);
        dev.wl_put_peb(0, 0, victim, false)?;
        dev.wl_flush()?;
        assert_eq!(ubi.peb_set(victim), Some(PebSet::Free));
        assert_eq!(ubi.wl_stats().tortures, 1);

        let info = ubi.device_info();
        assert_eq!(info.avail_pebs, before.avail_pebs);
        assert_eq!(info.erroneous_peb_count, 0);
        dev.self_check()?;
        Ok(())
    }

    #[test]
    fn test_unreadable_move_source_is_charged() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;
        ubi.write(0, 2, 0, &pattern(3, 128))?;
        ubi.flush()?;
        let before = ubi.device_info();
        let source = ubi.leb_mapping(0, 2)?.ok_or(anyhow::anyhow!("LEB not mapped"))?;

        nand.set_faults(
            source,
            Faults {
                uncorrectable: true,
                ..Default::default()
            },
        );
        ubi.dev.wl_scrub_peb(source);
        ubi.flush()?;

        // The data can't be copied: the PEB stays mapped, as erroneous, and is paid for
        assert_eq!(ubi.leb_mapping(0, 2)?, Some(source));
        assert_eq!(ubi.peb_set(source), Some(PebSet::Erroneous));
        let info = ubi.device_info();
        assert_eq!(info.erroneous_peb_count, 1);
        assert_eq!(
            info.avail_pebs + info.beb_rsvd_pebs,
            before.avail_pebs + before.beb_rsvd_pebs - 1
        );
        ubi.self_check()?;

        nand.clear_faults(source);
        ubi.unmap(0, 2)?;
        ubi.flush()?;
        assert_eq!(ubi.peb_set(source), Some(PebSet::Free));

        let info = ubi.device_info();
        assert_eq!(info.erroneous_peb_count, 0);
        assert_eq!(info.avail_pebs, before.avail_pebs);
        assert_eq!(info.beb_rsvd_pebs, before.beb_rsvd_pebs);
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_low_water_erases_in_caller() -> anyhow::Result<()> {
        for (free_low_water, pending) in [(0, 1), (LAYOUT.blocks as usize, 0)] {
            let nand = sim();
            let config = UbiConfig {
                free_low_water,
                ..quiet()
            };
            let ubi = attach(&nand, &[dynamic(0, 4)], config)?;
            ubi.flush()?;

            ubi.write(0, 0, 0, &pattern(1, 64))?;
            ubi.unmap(0, 0)?;
            assert_eq!(ubi.wl_stats().pending_erase, 1);

            // Allocating below the low-water mark erases what is queued before returning
            ubi.write(0, 1, 0, &pattern(2, 64))?;
            assert_eq!(ubi.wl_stats().pending_erase, pending);
            ubi.self_check()?;
        }
        Ok(())
    }

    #[test]
    fn test_wear_leveling_bounds_spread() -> anyhow::Result<()> {
        let nand = sim();
        let threshold = 8;
        let config = UbiConfig {
            wl_threshold: threshold,
            ..quiet()
        };
        let ubi = attach(&nand, &[dynamic(0, 16)], config)?;

        // Cold data, written once
        for lnum in 1..11 {
            ubi.write(0, lnum, 0, &pattern(lnum as u8, 200))?;
        }

        // One hot LEB, rewritten over and over
        for round in 0..600u32 {
            ubi.atomic_change(0, 0, &pattern(round as u8, 300))?;
            ubi.flush()?;
        }

        let stats = ubi.wl_stats();
        assert!(stats.moves > 0);
        assert!(
            stats.max_ec - stats.min_ec <= 3 * threshold,
            "EC spread {}..{}",
            stats.min_ec,
            stats.max_ec
        );

        // The data survived all the moving around
        for lnum in 1..11 {
            let mut buf = vec![0u8; 200];
            ubi.read(0, lnum, 0, &mut buf)?;
            assert_eq!(buf, pattern(lnum as u8, 200));
        }
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_ec_never_decreases() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 8)], quiet())?;

        let mut last = vec![0u64; LAYOUT.blocks as usize];
        for round in 0..100u32 {
            ubi.atomic_change(0, round % 4, &pattern(round as u8, 64))?;
            if round % 3 == 0 {
                ubi.unmap(0, (round + 1) % 4)?;
            }
            ubi.flush()?;

            for (pnum, last) in (0..).zip(last.iter_mut()) {
                let ec = ubi.erase_counter(pnum).unwrap_or(0);
                assert!(ec >= *last, "EC of PEB {pnum} went from {last} to {ec}");
                *last = ec;
            }
        }
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_scrub_moves_data() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;
        ubi.write(0, 1, 0, &pattern(7, 100))?;
        let old = ubi.leb_mapping(0, 1)?.ok_or(anyhow::anyhow!("LEB not mapped"))?;

        nand.set_faults(
            old,
            Faults {
                bitflips: true,
                ..Default::default()
            },
        );
        let mut buf = vec![0u8; 100];
        ubi.read(0, 1, 0, &mut buf)?;
        assert_eq!(buf, pattern(7, 100));
        assert_eq!(ubi.peb_set(old), Some(PebSet::Scrub));

        ubi.flush()?;
        let new = ubi.leb_mapping(0, 1)?.ok_or(anyhow::anyhow!("LEB not mapped"))?;
        assert_ne!(new, old);
        assert_eq!(ubi.peb_set(old), Some(PebSet::Free));
        assert_eq!(ubi.wl_stats().scrubs, 1);

        ubi.read(0, 1, 0, &mut buf)?;
        assert_eq!(buf, pattern(7, 100));
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_move_target_failure_tortures_target() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[dynamic(0, 4)], quiet())?;
        ubi.flush()?;
        ubi.write(0, 0, 0, &pattern(1, 64))?;
        let source = ubi.leb_mapping(0, 0)?.ok_or(anyhow::anyhow!("LEB not mapped"))?;

        // Every free PEB fails to program: the move can't complete anywhere
        let free: Vec<u32> = (0..LAYOUT.blocks)
            .filter(|&pnum| ubi.peb_set(pnum) == Some(PebSet::Free))
            .collect();
        let faults = Faults {
            program: true,
            ..Default::default()
        };
        let target = ubi.dev.wl.state.lock().wl_target(2 * UbiConfig::default().wl_threshold);
        let (_, target) = target.ok_or(anyhow::anyhow!("no free PEB"))?;
        nand.set_faults(target, faults);

        ubi.dev.wl_scrub_peb(source);
        ubi.dev.do_work()?;

        // The source still holds the data and waits for another try; the target gets tortured,
        // fails, and is retired
        assert_eq!(ubi.leb_mapping(0, 0)?, Some(source));
        assert_eq!(ubi.peb_set(source), Some(PebSet::Scrub));
        assert_eq!(ubi.peb_set(target), Some(PebSet::Used));
        ubi.dev.do_work()?;
        assert_eq!(ubi.peb_set(target), Some(PebSet::Bad));
        assert!(free.contains(&target));

        ubi.flush()?;
        assert_ne!(ubi.leb_mapping(0, 0)?, Some(source));
        let mut buf = vec![0u8; 64];
        ubi.read(0, 0, 0, &mut buf)?;
        assert_eq!(buf, pattern(1, 64));
        ubi.self_check()?;
        Ok(())
    }

    #[test]
    fn test_put_during_shutdown() -> anyhow::Result<()> {
        let nand = sim();
        let ubi = attach(&nand, &[], quiet())?;
        ubi.flush()?;
        let pnum = ubi.dev.wl_get_peb()?;
        ubi.dev.wl.state.lock().closed = true;
        assert!(matches!(
            ubi.dev.wl_put_peb(0, 0, pnum, false),
            Err(UbiError::Shutdown)
        ));
        assert_eq!(ubi.peb_set(pnum), Some(PebSet::Used));
        Ok(())
    }
}
