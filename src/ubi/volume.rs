//! Volumes, as the EBA layer sees them: a table record plus the LEB to PEB mapping

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::error::{Result, UbiError};
use super::headers::VolType;

/// A volume table record, as supplied by whoever owns the on-flash volume table
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VolumeInfo {
    pub vol_id: u32,

    /// The name of the volume
    pub name: String,

    /// The type of the volume
    pub vol_type: VolType,

    /// The total number of PEBs allocated to this volume, which is also its number of LEBs
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size
    pub alignment: u32,

    /// Set while a whole-volume update is in progress
    pub upd_marker: bool,
}

impl VolumeInfo {
    pub fn new(vol_id: u32, vol_type: VolType, reserved_pebs: u32) -> Self {
        Self {
            vol_id,
            name: format!("vol{vol_id}"),
            vol_type,
            reserved_pebs,
            alignment: 1,
            upd_marker: false,
        }
    }

    /// Set the name of this volume
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the alignment of this volume
    pub fn alignment(mut self, alignment: u32) -> Self {
        self.alignment = alignment;
        self
    }
}

/// Mutable bookkeeping for a volume, outside of the mapping
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct VolumeState {
    /// The number of LEBs holding data (static volumes); the reserved count otherwise
    pub used_ebs: u32,

    /// Bytes of data in the last used LEB
    pub last_eb_bytes: usize,

    /// A whole-volume update started, and did not finish
    pub upd_marker: bool,
}

#[derive(Debug)]
pub(crate) struct Volume {
    pub info: VolumeInfo,

    /// Bytes at the end of every PEB left unused to honor the alignment
    pub data_pad: usize,

    /// Bytes of data per LEB
    pub usable_leb_size: usize,

    /// LEB to PEB mapping; `None` is "unmapped"
    eba_tbl: Mutex<Box<[Option<u32>]>>,

    /// Static volumes only: set when data failed its checks
    corrupted: AtomicBool,

    pub state: Mutex<VolumeState>,
}

impl Volume {
    pub fn new(info: VolumeInfo, leb_size: usize) -> Result<Self> {
        if info.alignment == 0 || info.alignment as usize > leb_size {
            return Err(anyhow::anyhow!(
                "volume {}: bad alignment {}",
                info.vol_id,
                info.alignment
            )
            .into());
        }

        let data_pad = leb_size % info.alignment as usize;
        let usable_leb_size = leb_size - data_pad;
        let state = VolumeState {
            used_ebs: info.reserved_pebs,
            last_eb_bytes: usable_leb_size,
            upd_marker: info.upd_marker,
        };

        Ok(Self {
            eba_tbl: Mutex::new(vec![None; info.reserved_pebs as usize].into()),
            info,
            data_pad,
            usable_leb_size,
            corrupted: AtomicBool::new(false),
            state: Mutex::new(state),
        })
    }

    pub fn vol_id(&self) -> u32 {
        self.info.vol_id
    }

    pub fn is_static(&self) -> bool {
        self.info.vol_type == VolType::Static
    }

    pub fn check_lnum(&self, lnum: u32) -> Result<()> {
        if lnum >= self.info.reserved_pebs {
            return Err(UbiError::LebRange {
                vol_id: self.vol_id(),
                lnum,
            });
        }
        Ok(())
    }

    /// Check that `offset..offset + len` fits in an LEB
    pub fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.usable_leb_size {
            return Err(UbiError::Range { offset, len });
        }
        Ok(())
    }

    pub fn mapping(&self, lnum: u32) -> Option<u32> {
        self.eba_tbl.lock().get(lnum as usize).copied().flatten()
    }

    pub fn set_mapping(&self, lnum: u32, pnum: Option<u32>) {
        if let Some(entry) = self.eba_tbl.lock().get_mut(lnum as usize) {
            *entry = pnum;
        }
    }

    /// Every mapped LEB, as `(lnum, pnum)`
    pub fn mapped(&self) -> Vec<(u32, u32)> {
        (0..)
            .zip(self.eba_tbl.lock().iter())
            .filter_map(|(lnum, pnum)| pnum.map(|pnum| (lnum, pnum)))
            .collect()
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    pub fn set_corrupted(&self, corrupted: bool) {
        self.corrupted.store(corrupted, Ordering::Release);
    }
}

#[test]
fn test_volume() -> anyhow::Result<()> {
    let vol = Volume::new(VolumeInfo::new(1, VolType::Dynamic, 4).alignment(100), 384)?;
    assert_eq!(vol.data_pad, 84);
    assert_eq!(vol.usable_leb_size, 300);
    assert!(vol.check_lnum(3).is_ok());
    assert!(vol.check_lnum(4).is_err());
    assert!(vol.check_range(200, 100).is_ok());
    assert!(vol.check_range(200, 101).is_err());

    vol.set_mapping(2, Some(9));
    assert_eq!(vol.mapping(2), Some(9));
    assert_eq!(vol.mapping(7), None);
    assert_eq!(vol.mapped(), [(2, 9)]);

    assert!(Volume::new(VolumeInfo::new(1, VolType::Dynamic, 4).alignment(0), 384).is_err());
    Ok(())
}
