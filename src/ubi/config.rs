//! Tunables for attaching a UBI device

/// Default wear-leveling threshold, in erase cycles
pub const WL_THRESHOLD: u64 = 4096;

/// Default number of PEBs per 1024 reserved for bad-block handling
pub const BEB_LIMIT_PER1024: u32 = 20;

/// Settings for [Ubi::attach](super::Ubi::attach)
#[derive(Debug, Clone)]
pub struct UbiConfig {
    /// Maximum allowed difference between the least and the most worn PEBs before data is moved
    pub wl_threshold: u64,

    /// How many PEBs out of every 1024 are expected to go bad over the lifetime of the device
    pub beb_limit_per1024: u32,

    /// How many erroneous PEBs are tolerated before switching to read-only mode; by default one
    /// tenth of the device, but at least 16
    pub max_erroneous: Option<usize>,

    /// How many corrupted PEBs make the attach fail; by default one in 20, or 8 on tiny devices
    pub corrupt_limit: Option<usize>,

    /// Below this many free PEBs, an allocation runs queued erasures itself before returning
    pub free_low_water: usize,

    /// Start the background worker enabled; if not, work only happens in `flush()` and when an
    /// allocation finds the free PEBs low
    pub background: bool,
}

impl Default for UbiConfig {
    fn default() -> Self {
        Self {
            wl_threshold: WL_THRESHOLD,
            beb_limit_per1024: BEB_LIMIT_PER1024,
            max_erroneous: None,
            corrupt_limit: None,
            free_low_water: 2,
            background: true,
        }
    }
}

impl UbiConfig {
    pub(crate) fn max_erroneous(&self, peb_count: u32) -> usize {
        self.max_erroneous
            .unwrap_or_else(|| std::cmp::max(peb_count as usize / 10, 16))
    }

    pub(crate) fn corrupt_limit(&self, peb_count: usize) -> usize {
        self.corrupt_limit.unwrap_or(match peb_count / 20 {
            0 => 8,
            limit => limit,
        })
    }

    /// The number of PEBs expected to go bad: `peb_count * beb_limit_per1024 / 1024`, rounded up
    pub(crate) fn bad_peb_limit(&self, peb_count: u32) -> u32 {
        let limit = u64::from(peb_count) * u64::from(self.beb_limit_per1024);
        limit.div_ceil(1024) as u32
    }
}

#[test]
fn test_limits() {
    let config = UbiConfig::default();
    assert_eq!(config.bad_peb_limit(1024), 20);
    assert_eq!(config.bad_peb_limit(1000), 20);
    assert_eq!(config.bad_peb_limit(24), 1);
    assert_eq!(config.max_erroneous(24), 16);
    assert_eq!(config.max_erroneous(4096), 409);
    assert_eq!(config.corrupt_limit(24), 1);
    assert_eq!(config.corrupt_limit(19), 8);
    assert_eq!(config.corrupt_limit(0), 8);
    assert_eq!(config.corrupt_limit(4096), 204);
}
