//! The two on-flash headers of a PEB: the erase counter (EC) header in its first page and the
//! volume ID (VID) header in its second.
//!
//! The raw layouts come from `income`; this module adds magic/version/CRC handling on top and
//! converts to the plainer [Ec] and [Vid] structs that the rest of the layer works with.

use crc::{Crc, CRC_32_JAMCRC};
use deku::{DekuContainerRead, DekuContainerWrite};
use income::{EcHdr, VidHdr, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};

/// Checksum used for both headers and for LEB data
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

/// The on-flash size of both the EC and the VID header
pub const UBI_HDR_SIZE: usize = 64;

/// A raw `income` header; the CRC is its last field and covers everything before it
trait RawHeader: Sized + for<'a> DekuContainerRead<'a> + DekuContainerWrite {
    const MAGIC: &'static [u8];

    fn magic(&self) -> &[u8];
    fn version(&self) -> u8;
    fn crc(&mut self) -> &mut u32;

    fn checksum(&self) -> Option<u32> {
        let bytes = self.to_bytes().ok()?;
        let covered = bytes.len().checked_sub(std::mem::size_of::<u32>())?;
        Some(UBI_CRC.checksum(&bytes[..covered]))
    }

    /// Parse from the start of `buf`, rejecting bad magic, unknown versions and CRC mismatches
    fn unseal(buf: &[u8]) -> Option<Self> {
        let (_, mut header) = Self::from_bytes((buf, 0)).ok()?;
        if header.magic() != Self::MAGIC || header.version() != UBI_VERSION {
            return None;
        }

        let expected = header.checksum()?;
        (*header.crc() == expected).then_some(header)
    }

    /// Fill in the CRC and serialize into the start of `out`
    fn seal(mut self, out: &mut [u8]) -> anyhow::Result<()> {
        *self.crc() = self
            .checksum()
            .ok_or_else(|| anyhow::anyhow!("header cannot be serialized"))?;

        let bytes = self.to_bytes()?;
        let out_len = out.len();
        out.get_mut(..bytes.len())
            .ok_or_else(|| anyhow::anyhow!("{out_len} bytes do not fit a header"))?
            .copy_from_slice(&bytes);
        Ok(())
    }
}

macro_rules! raw_header {
    ($ty:ty, $magic:expr) => {
        impl RawHeader for $ty {
            const MAGIC: &'static [u8] = $magic;

            fn magic(&self) -> &[u8] {
                &self.magic
            }
            fn version(&self) -> u8 {
                self.version
            }
            fn crc(&mut self) -> &mut u32 {
                &mut self.hdr_crc
            }
        }
    };
}

raw_header!(EcHdr, UBI_EC_HDR_MAGIC);
raw_header!(VidHdr, UBI_VID_HDR_MAGIC);

/// The 4-byte magic field of a header
fn magic_field(magic: &[u8]) -> [u8; 4] {
    magic.try_into().unwrap_or_default()
}

/// Contents of an EC header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    /// How many times the PEB has been erased
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,

    /// Identifies the image; identical across all PEBs of one device
    pub image_seq: u32,
}

impl Ec {
    /// The same header, with a different erase counter
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let hdr = EcHdr::unseal(bytes)?;
        Some(Self {
            ec: hdr.ec,
            vid_hdr_offset: hdr.vid_hdr_offset,
            data_offset: hdr.data_offset,
            image_seq: hdr.image_seq,
        })
    }

    pub fn encode(self, out: &mut [u8]) -> anyhow::Result<()> {
        EcHdr {
            magic: magic_field(UBI_EC_HDR_MAGIC),
            version: UBI_VERSION,
            ec: self.ec,
            vid_hdr_offset: self.vid_hdr_offset,
            data_offset: self.data_offset,
            image_seq: self.image_seq,
            hdr_crc: 0,
            padding1: Default::default(),
            padding2: Default::default(),
        }
        .seal(out)
    }
}

/// The two kinds of volume
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// LEBs may be written, changed and unmapped individually
    #[default]
    Dynamic,

    /// Written as a whole by a volume update; every LEB carries the size and CRC of its data
    Static,
}

impl VolType {
    fn to_raw(self) -> u8 {
        match self {
            Self::Dynamic => 1,
            Self::Static => 2,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Dynamic),
            2 => Some(Self::Static),
            _ => None,
        }
    }
}

/// Contents of a VID header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    pub vol_type: VolType,

    /// Set when the PEB was written as a copy of another one, either by wear-leveling or by an
    /// atomic LEB change; `data_size`/`data_crc` are then valid even for dynamic volumes
    pub copy_flag: bool,

    pub compat: u8,
    pub vol_id: u32,
    pub lnum: u32,

    /// Bytes of LEB data covered by `data_crc`, or 0
    pub data_size: u32,

    /// Static volumes only: how many LEBs the volume's data occupies
    pub used_ebs: u32,

    /// Bytes left unused at the end of the PEB to honor the volume's alignment
    pub data_pad: u32,

    pub data_crc: u32,

    /// Unique and increasing over the life of the device; of two PEBs claiming the same LEB, the
    /// one with the higher sqnum is newer
    pub sqnum: u64,
}

impl Vid {
    /// A header for LEB `lnum` of a dynamic volume
    pub fn new(vol_id: u32, lnum: u32) -> Self {
        Self {
            vol_id,
            lnum,
            ..Default::default()
        }
    }

    pub fn sqnum(mut self, sqnum: u64) -> Self {
        self.sqnum = sqnum;
        self
    }

    /// Record the size and CRC of `data`, which is written along with the header
    pub fn covering(mut self, data: &[u8]) -> Self {
        self.data_size = data.len() as u32;
        self.data_crc = UBI_CRC.checksum(data);
        self
    }

    /// Does `data` have the size and CRC recorded in this header?
    pub fn verify(&self, data: &[u8]) -> bool {
        data.len() == self.data_size as usize && UBI_CRC.checksum(data) == self.data_crc
    }

    /// Parse a VID header; an unknown volume type counts as a corrupt header
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let hdr = VidHdr::unseal(bytes)?;
        Some(Self {
            vol_type: VolType::from_raw(hdr.vol_type)?,
            copy_flag: hdr.copy_flag != 0,
            compat: hdr.compat,
            vol_id: hdr.vol_id,
            lnum: hdr.lnum,
            data_size: hdr.data_size,
            used_ebs: hdr.used_ebs,
            data_pad: hdr.data_pad,
            data_crc: hdr.data_crc,
            sqnum: hdr.sqnum,
        })
    }

    pub fn encode(self, out: &mut [u8]) -> anyhow::Result<()> {
        VidHdr {
            magic: magic_field(UBI_VID_HDR_MAGIC),
            version: UBI_VERSION,
            vol_type: self.vol_type.to_raw(),
            copy_flag: u8::from(self.copy_flag),
            compat: self.compat,
            vol_id: self.vol_id,
            lnum: self.lnum,
            data_size: self.data_size,
            used_ebs: self.used_ebs,
            data_pad: self.data_pad,
            data_crc: self.data_crc,
            sqnum: self.sqnum,
            hdr_crc: 0,
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        }
        .seal(out)
    }
}

#[test]
fn test_encode() -> anyhow::Result<()> {
    let ec = Ec::default().ec(17);
    let vid = Vid::new(3, 5).sqnum(10).covering(b"hello");

    let mut buf = vec![0u8; 1024];

    ec.encode(&mut buf)?;
    assert_eq!(Ec::decode(&buf), Some(ec));
    assert_eq!(Vid::decode(&buf), None);

    vid.encode(&mut buf)?;
    assert_eq!(Vid::decode(&buf), Some(vid));
    assert!(vid.verify(b"hello"));
    assert!(!vid.verify(b"hellO"));

    buf[20] ^= 0x01;
    assert_eq!(Vid::decode(&buf), None);

    assert!(ec.encode(&mut buf[..UBI_HDR_SIZE - 1]).is_err());

    Ok(())
}

#[test]
fn test_static_vid() -> anyhow::Result<()> {
    let vid = Vid {
        vol_type: VolType::Static,
        copy_flag: true,
        used_ebs: 4,
        data_pad: 16,
        ..Vid::new(1, 3).sqnum(u64::MAX).covering(&[0x5A; 300])
    };

    let mut buf = [0xFFu8; UBI_HDR_SIZE];
    vid.encode(&mut buf)?;
    assert_eq!(Vid::decode(&buf), Some(vid));

    // An all-ones page is an erased header, not a valid one
    assert_eq!(Vid::decode(&[0xFF; UBI_HDR_SIZE]), None);
    assert_eq!(Ec::decode(&[0xFF; UBI_HDR_SIZE]), None);
    Ok(())
}
