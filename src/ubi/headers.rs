//! This module contains the code necessary to read, write, and manipulate EC/VID headers, with
//! CRC verification/computation.
//!
//! Every PEB begins with an EC header, followed (at `vid_hdr_offset`) by a VID header if the PEB
//! is mapped to a LEB. Both are 64 bytes, big-endian, and end with a CRC of all bytes before it.

use crc::{Crc, CRC_32_JAMCRC};
use deku::prelude::*;
pub use deku::{DekuContainerRead, DekuContainerWrite};
use income::EcHdr;
use thiserror::Error;

/// UBI's CRC-32: the standard polynomial, seeded with all-ones, but without the final inversion.
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// The highest header version this code understands.
pub const UBI_VERSION: u8 = 1;

pub const UBI_EC_HDR_MAGIC: &[u8; 4] = b"UBI#";
pub const UBI_VID_HDR_MAGIC: &[u8; 4] = b"UBI!";

pub const UBI_EC_HDR_SIZE: usize = 64;
pub const UBI_VID_HDR_SIZE: usize = 64;

/// Size of the private area carried by VID headers of internal volumes.
pub const UBI_VID_IVOL_DATA_SIZE: usize = 12;

/// Reasons a single header can be rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("bad header magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported header version {0}")]
    UnsupportedVersion(u8),

    #[error("header CRC mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("bad volume type {0}")]
    BadVolumeType(u8),
}

impl HeaderError {
    /// Whether this error came from a checksum rather than from the header's structure.
    pub fn is_crc(&self) -> bool {
        matches!(self, Self::CrcMismatch { .. })
    }
}

/// The on-flash layout of a VID header.
///
/// `income` only knows the sequence-numbered layout, where the 32-bit LEB version has become
/// padding and a 64-bit `sqnum` sits in the second reserved area, so this format needs its own.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct VidHdr {
    pub magic: [u8; 4],
    pub version: u8,
    pub vol_type: u8,
    pub copy_flag: u8,
    pub compat: u8,
    pub vol_id: u32,
    pub lnum: u32,
    pub leb_ver: u32,
    pub data_size: u32,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,
    pub padding: [u8; 12],
    pub ivol_data: [u8; UBI_VID_IVOL_DATA_SIZE],
    pub hdr_crc: u32,
}

/// Implements parsing UBI headers from byteslices, with magic, version and CRC verification.
///
/// All checks run on the raw bytes before they are handed to deku, CRC first, so that any
/// corruption of a header that was once valid is reported as a [HeaderError::CrcMismatch] rather
/// than as a structural problem.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    const SIZE: usize;

    fn get_magic() -> &'static [u8; 4];

    fn parse(buf: &'a [u8]) -> Result<Self, HeaderError> {
        let truncated = HeaderError::Truncated {
            need: Self::SIZE,
            got: buf.len(),
        };
        let buf = buf.get(..Self::SIZE).ok_or(truncated)?;

        let (body, crc) = buf.split_at(Self::SIZE - std::mem::size_of::<u32>());
        let stored = u32::from_be_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let computed = UBI_CRC.checksum(body);
        if stored != computed {
            return Err(HeaderError::CrcMismatch { stored, computed });
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if &magic != Self::get_magic() {
            return Err(HeaderError::BadMagic(magic));
        }

        let version = buf[4];
        if version > UBI_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }

        let (_, header) = Self::from_bytes((buf, 0)).map_err(|_| truncated)?;
        Ok(header)
    }
}

impl ParseHeader<'_> for EcHdr {
    const SIZE: usize = UBI_EC_HDR_SIZE;

    fn get_magic() -> &'static [u8; 4] {
        UBI_EC_HDR_MAGIC
    }
}

impl ParseHeader<'_> for VidHdr {
    const SIZE: usize = UBI_VID_HDR_SIZE;

    fn get_magic() -> &'static [u8; 4] {
        UBI_VID_HDR_MAGIC
    }
}

/// Computes the correct CRC for some Vid/Ec header or volume table record: a checksum over the
/// serialized bytes, excluding the trailing CRC field itself.
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let bytes = self
            .to_bytes()
            .expect("fixed-size UBI structures always serialize");
        let len = bytes.len() - std::mem::size_of::<u32>();
        UBI_CRC.checksum(&bytes[..len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

/// Copy a serialized header into the front of `out_bytes`.
fn write_into(bytes: &[u8], out_bytes: &mut [u8]) -> Result<(), HeaderError> {
    let got = out_bytes.len();
    let out_bytes = out_bytes
        .get_mut(..bytes.len())
        .ok_or(HeaderError::Truncated {
            need: bytes.len(),
            got,
        })?;
    out_bytes.copy_from_slice(bytes);
    Ok(())
}

/// This represents the specific fields we care about in an EC header
///
/// This is meant to be more ergonomic to work with than EcHdr, which represents the raw data.
/// The trailing reserved area (which `income` partly calls `image_seq`) is written as zeroes
/// and ignored on read.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    /// How many times this PEB has been erased. Only values up to `UBI_MAX_ERASECOUNTER` are
    /// meaningful.
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
}

/// The largest erase counter value a PEB may carry.
pub const UBI_MAX_ERASECOUNTER: u64 = 0x7FFF_FFFF;

impl Ec {
    /// Change the erase counter of this EC header
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        EcHdr::parse(bytes).map(|x| x.into())
    }

    /// Serialize into a new buffer of exactly [UBI_EC_HDR_SIZE] bytes
    pub fn to_bytes(self) -> Vec<u8> {
        EcHdr::from(self)
            .to_bytes()
            .expect("fixed-size UBI structures always serialize")
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> Result<(), HeaderError> {
        write_into(&self.to_bytes(), out_bytes)
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
        } = value;

        let mut target = Self {
            magic: *UBI_EC_HDR_MAGIC,
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,

            image_seq: Default::default(),
            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            x => Err(HeaderError::BadVolumeType(x)),
        }
    }
}

/// This represents the specific fields we care about in a VID header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// Distinguishes copies of the same `vol_id:lnum`; the newer copy (modulo wraparound, see
    /// [leb_ver_newer](super::leb_ver_newer)) wins.
    pub leb_ver: u32,

    /// For `Static` volumes and copied LEBs, the number of bytes written at the same time as the
    /// VID header, which are thus included in `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the PEB, to cut the LEB down to a multiple of the
    /// requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// Private data of internal volumes.
    pub ivol_data: [u8; UBI_VID_IVOL_DATA_SIZE],
}

impl Vid {
    /// Change the LEB version for this `Vid`
    pub fn leb_ver(mut self, leb_ver: u32) -> Self {
        self.leb_ver = leb_ver;
        self
    }

    /// Whether `data_size`/`data_crc` describe the LEB contents.
    ///
    /// Static volumes always track their data; dynamic volumes only do for copied LEBs.
    pub fn tracks_data(&self) -> bool {
        match self.vol_type {
            VolType::Static => true,
            VolType::Dynamic => self.copy_flag,
        }
    }

    /// Check `data_crc` against the start of the LEB contents.
    pub fn check_data(&self, leb: &[u8]) -> bool {
        leb.get(..self.data_size as usize)
            .is_some_and(|data| UBI_CRC.checksum(data) == self.data_crc)
    }

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        VidHdr::parse(bytes).and_then(Self::try_from)
    }

    /// Serialize into a new buffer of exactly [UBI_VID_HDR_SIZE] bytes
    pub fn to_bytes(self) -> Vec<u8> {
        VidHdr::from(self)
            .to_bytes()
            .expect("fixed-size UBI structures always serialize")
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> Result<(), HeaderError> {
        write_into(&self.to_bytes(), out_bytes)
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = HeaderError;

    fn try_from(value: VidHdr) -> Result<Self, Self::Error> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            leb_ver,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            ivol_data,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            leb_ver,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            ivol_data,
        })
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            leb_ver,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            ivol_data,
        } = value;

        let mut target = Self {
            magic: *UBI_VID_HDR_MAGIC,
            version: UBI_VERSION,

            vol_type: vol_type.into(),
            copy_flag: copy_flag.into(),
            compat,
            vol_id,
            lnum,
            leb_ver,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            ivol_data,

            hdr_crc: Default::default(),
            padding: Default::default(),
        };

        target.fix_crc();
        target
    }
}

#[cfg(test)]
fn sample_vid() -> Vid {
    Vid {
        vol_type: VolType::Static,
        copy_flag: true,
        compat: 0,
        vol_id: 3,
        lnum: 17,
        leb_ver: 0x8000_0005,
        data_size: 1000,
        used_ebs: 20,
        data_pad: 24,
        data_crc: 0xDEAD_BEEF,
        ivol_data: *b"private-data",
    }
}

#[test]
fn test_crc_seed() {
    // CRC-32 of the standard check string, without the final inversion
    assert_eq!(UBI_CRC.checksum(b"123456789"), 0x340B_C6D9);
}

#[test]
fn test_encode() -> anyhow::Result<()> {
    let ec = Ec {
        ec: UBI_MAX_ERASECOUNTER,
        vid_hdr_offset: 512,
        data_offset: 2048,
    };
    let vid = sample_vid();

    let mut buf = vec![0u8; 1024];

    ec.encode(&mut buf)?;
    assert_eq!(Ec::decode(&buf), Ok(ec));

    vid.encode(&mut buf)?;
    assert_eq!(Vid::decode(&buf), Ok(vid));

    assert_eq!(Vid::decode(&Vid::default().to_bytes()), Ok(Vid::default()));

    Ok(())
}

#[test]
fn test_layout() {
    let ec = Ec {
        ec: 0x0102_0304_0506_0708,
        vid_hdr_offset: 0x200,
        data_offset: 0x800,
    }
    .to_bytes();
    assert_eq!(ec.len(), UBI_EC_HDR_SIZE);
    assert_eq!(&ec[..4], b"UBI#");
    assert_eq!(ec[4], UBI_VERSION);
    assert_eq!(ec[8..16], [1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(ec[16..20], [0, 0, 2, 0]);
    assert_eq!(ec[20..24], [0, 0, 8, 0]);
    assert!(ec[24..60].iter().all(|&b| b == 0));
    assert_eq!(ec[60..], UBI_CRC.checksum(&ec[..60]).to_be_bytes());

    let vid = sample_vid().to_bytes();
    assert_eq!(vid.len(), UBI_VID_HDR_SIZE);
    assert_eq!(&vid[..4], b"UBI!");
    assert_eq!(vid[5..8], [2, 1, 0]);
    assert_eq!(vid[8..12], 3u32.to_be_bytes());
    assert_eq!(vid[12..16], 17u32.to_be_bytes());
    assert_eq!(vid[16..20], 0x8000_0005u32.to_be_bytes());
    assert_eq!(vid[20..24], 1000u32.to_be_bytes());
    assert_eq!(vid[24..28], 20u32.to_be_bytes());
    assert_eq!(vid[28..32], 24u32.to_be_bytes());
    assert_eq!(vid[32..36], 0xDEAD_BEEFu32.to_be_bytes());
    assert!(vid[36..48].iter().all(|&b| b == 0));
    assert_eq!(&vid[48..60], b"private-data");
    assert_eq!(vid[60..], UBI_CRC.checksum(&vid[..60]).to_be_bytes());
}

#[cfg(test)]
fn assert_flips_are_crc_errors(bytes: &[u8], decode: impl Fn(&[u8]) -> Option<HeaderError>) {
    for bit in 0..bytes.len() * 8 {
        let mut corrupt = bytes.to_vec();
        corrupt[bit / 8] ^= 1 << (bit % 8);
        let err = decode(&corrupt).expect("corrupted header decoded");
        assert!(err.is_crc(), "bit {bit}: {err:?}");
    }
}

#[test]
fn test_single_bit_flips_are_crc_errors() {
    let ec = Ec {
        ec: 42,
        vid_hdr_offset: 64,
        data_offset: 128,
    };
    assert_flips_are_crc_errors(&ec.to_bytes(), |b| Ec::decode(b).err());
    assert_flips_are_crc_errors(&sample_vid().to_bytes(), |b| Vid::decode(b).err());
}

#[test]
fn test_structural_errors() {
    let mut hdr = VidHdr::from(sample_vid());
    hdr.magic = *b"UBI?";
    hdr.fix_crc();
    assert_eq!(
        Vid::decode(&hdr.to_bytes().unwrap()),
        Err(HeaderError::BadMagic(*b"UBI?"))
    );

    let mut hdr = VidHdr::from(sample_vid());
    hdr.version = 2;
    hdr.fix_crc();
    assert_eq!(
        Vid::decode(&hdr.to_bytes().unwrap()),
        Err(HeaderError::UnsupportedVersion(2))
    );

    let mut hdr = VidHdr::from(sample_vid());
    hdr.vol_type = 3;
    hdr.fix_crc();
    assert_eq!(
        Vid::decode(&hdr.to_bytes().unwrap()),
        Err(HeaderError::BadVolumeType(3))
    );

    // An EC header is not a VID header, even with a good CRC, and vice versa
    let ec = Ec::default().to_bytes();
    assert_eq!(Vid::decode(&ec), Err(HeaderError::BadMagic(*b"UBI#")));
    let vid = sample_vid().to_bytes();
    assert_eq!(Ec::decode(&vid), Err(HeaderError::BadMagic(*b"UBI!")));

    let with_crc = |mut bytes: Vec<u8>| {
        let crc = UBI_CRC.checksum(&bytes[..60]);
        bytes[60..].copy_from_slice(&crc.to_be_bytes());
        bytes
    };

    let mut ec = Ec::default().to_bytes();
    ec[..4].copy_from_slice(b"UBI?");
    assert_eq!(
        Ec::decode(&with_crc(ec)),
        Err(HeaderError::BadMagic(*b"UBI?"))
    );

    let mut ec = Ec::default().to_bytes();
    ec[4] = 2;
    assert_eq!(
        Ec::decode(&with_crc(ec)),
        Err(HeaderError::UnsupportedVersion(2))
    );

    assert_eq!(
        Ec::decode(&[0u8; 10]),
        Err(HeaderError::Truncated { need: 64, got: 10 })
    );
}

#[test]
fn test_check_data() {
    let data = [0x5Au8; 300];
    let mut vid = Vid {
        vol_type: VolType::Dynamic,
        data_size: 200,
        data_crc: UBI_CRC.checksum(&data[..200]),
        ..Default::default()
    };
    assert!(!vid.tracks_data());
    assert!(vid.check_data(&data));

    vid.copy_flag = true;
    assert!(vid.tracks_data());

    vid.data_crc ^= 1;
    assert!(!vid.check_data(&data));

    // `data_size` larger than the LEB can never verify
    vid.data_size = 301;
    assert!(!vid.check_data(&data));
}
