//! Shared fixtures for the UBI tests

use std::sync::Arc;

use super::{Result, Ubi, UbiConfig, VolType, VolumeInfo};
use crate::nand::{NandLayout, SimNand};

/// 24 PEBs of 8 pages: an EC header page, a VID header page, and 6 data pages of 64 bytes
pub(crate) const LAYOUT: NandLayout = NandLayout {
    blocks: 24,
    pages_per_block: 8,
    bytes_per_page: 64,
};

pub(crate) fn sim() -> Arc<SimNand> {
    Arc::new(SimNand::new(LAYOUT))
}

/// No background thread: work only happens when a test asks for it (or the free PEBs run out)
pub(crate) fn quiet() -> UbiConfig {
    UbiConfig {
        background: false,
        ..Default::default()
    }
}

pub(crate) fn dynamic(vol_id: u32, reserved_pebs: u32) -> VolumeInfo {
    VolumeInfo::new(vol_id, VolType::Dynamic, reserved_pebs)
}

pub(crate) fn attach(
    nand: &Arc<SimNand>,
    volumes: &[VolumeInfo],
    config: UbiConfig,
) -> Result<Ubi<Arc<SimNand>>> {
    Ubi::attach(nand.clone(), volumes.to_vec(), config)
}

/// `len` bytes of recognizable data, none of them 0xFF
pub(crate) fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (usize::from(seed) * 7 + i) as u8 % 0xFF)
        .collect()
}
