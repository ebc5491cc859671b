//! This module implements an unsorted block images (UBI) layer over raw NAND flash.
//!
//! NAND flash is erased in blocks, blocks wear out after a limited number of erasures, and some
//! blocks are bad from the start or go bad over time. UBI hides all of this behind volumes made of
//! logical eraseblocks (LEBs), each of which is mapped on demand to some physical eraseblock
//! (PEB):
//!
//! ```text
//!  Volume 0           Volume 1
//! +-----+-----+      +-----+-----+-----+
//! |LEB 0|LEB 1|      |LEB 0|LEB 1|LEB 2|
//! +--+--+--+--+      +--+--+-----+--+--+
//!    |     |            |           |
//!    |     +---------+  |      +----+
//!    v               v  v      v
//! +-----+-----+-----+-----+-----+-----+-----+
//! |PEB 0|PEB 1|PEB 2|PEB 3|PEB 4|PEB 5|PEB 6| ...
//! +-----+-----+-----+-----+-----+-----+-----+
//! ```
//!
//! Every PEB starts with an erase counter ("EC") header in its first page. A PEB holding an LEB
//! also has a volume ID ("VID") header in its second page, naming the LEB and carrying a sequence
//! number; the LEB's data follows. There is no mapping table on flash: attaching scans the
//! headers of all PEBs and rebuilds the mapping, letting the highest sequence number win when
//! two PEBs claim the same LEB.
//!
//! The work is split between the EBA layer, which maps LEBs and implements reads and writes,
//! and the wear-leveling engine, which hands out PEBs, erases released ones in the background,
//! and moves data around so that all PEBs wear evenly.

mod attach;
mod config;
mod device;
mod eba;
mod error;
mod headers;
mod io;
mod ltree;
mod volume;
mod wl;

#[cfg(test)]
mod testutil;

pub use attach::{scan_all, AttachInfo, AttachedLeb, AttachedPeb, AttachedVolume, Fastmap, PebScan};
pub use config::{UbiConfig, BEB_LIMIT_PER1024, WL_THRESHOLD};
pub use device::{DeviceInfo, Ubi, VolumeStatus};
pub use error::{AttachError, MoveError, Result, UbiError};
pub use headers::{Ec, VolType, Vid};
pub use io::{HdrStatus, UbiIo};
pub use volume::VolumeInfo;
pub use wl::{PebSet, WlStats};

/// Erase counters above this are treated as corrupt
pub const UBI_MAX_ERASECOUNTER: u64 = 0x7FFF_FFFF;

/// Volume IDs from here up belong to UBI-internal volumes
pub const UBI_INTERNAL_VOL_START: u32 = 0x7FFF_EFFF;
