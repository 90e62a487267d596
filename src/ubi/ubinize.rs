//! This module implements image generation.
//!
//! A [Geometry] describes where headers and data land within each PEB of the target flash. An
//! [ImageGenerator] turns one [VolumeDescriptor] plus a byte stream into fully-formed PEBs, one
//! LEB at a time. The two copies of the layout volume are produced by [layout_volume_pebs], and a
//! [Ubinizer] strings several volumes and the layout volume together into a whole image.

use super::headers::{Ec, HeaderError, Vid, VolType, UBI_CRC, UBI_EC_HDR_SIZE, UBI_VID_HDR_SIZE};
use super::vtbl::{
    TableError, VolTableRecord, VolumeTable, UBI_INTERNAL_VOL_START, UBI_LAYOUT_VOLUME_ID,
};
use crate::util::{round_up, ReadExt, ERASED_BYTE};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use std::io::{self, Read, Write};
use std::num::NonZeroU32;
use std::ops::BitOr;

const UBI_LAYOUT_VOLUME_TYPE: VolType = VolType::Dynamic;
const UBI_LAYOUT_VOLUME_EBS: u32 = 2;
const UBI_LAYOUT_VOLUME_COMPAT: u8 = 5;

/// Reasons image generation can fail.
#[derive(Debug, Error)]
pub enum GenError {
    #[error("invalid flash geometry: {0}")]
    InvalidGeometry(&'static str),

    #[error("invalid volume: {0}")]
    InvalidVolume(&'static str),

    #[error("short read for LEB {lnum}: expected {expected} bytes, got {got}")]
    ShortRead { lnum: u32, expected: usize, got: usize },

    #[error("all {0} LEBs of this volume have already been emitted")]
    GeneratorExhausted(u32),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The placement of headers and data within every PEB of one flash.
///
/// `vid_hdr_offset` and `data_offset` are the same for every PEB, which is why they live here
/// rather than with each volume.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    peb_size: u32,
    min_io_size: NonZeroU32,
    vid_hdr_offset: u32,
    data_offset: u32,
}

impl Geometry {
    /// Describe a flash with the given PEB size and minimum I/O unit, placing the VID header at
    /// the first I/O unit boundary after the EC header.
    pub fn new(peb_size: u32, min_io_size: NonZeroU32) -> Result<Self, GenError> {
        let vid_hdr_offset = round_up(UBI_EC_HDR_SIZE as u32, min_io_size.into())
            .ok_or(GenError::InvalidGeometry("minimum I/O size too large"))?;
        Self::with_offsets(peb_size, min_io_size, vid_hdr_offset)
    }

    /// Place the VID header somewhere else, e.g. in a sub-page of the first I/O unit.
    pub fn vid_hdr_offset(self, vid_hdr_offset: u32) -> Result<Self, GenError> {
        Self::with_offsets(self.peb_size, self.min_io_size, vid_hdr_offset)
    }

    fn with_offsets(
        peb_size: u32,
        min_io_size: NonZeroU32,
        vid_hdr_offset: u32,
    ) -> Result<Self, GenError> {
        if vid_hdr_offset < UBI_EC_HDR_SIZE as u32 {
            return Err(GenError::InvalidGeometry("VID header overlaps the EC header"));
        }

        let data_offset = vid_hdr_offset
            .checked_add(UBI_VID_HDR_SIZE as u32)
            .and_then(|x| round_up(x, min_io_size.into()))
            .ok_or(GenError::InvalidGeometry("VID header offset too large"))?;
        if data_offset >= peb_size {
            return Err(GenError::InvalidGeometry("no room for data in the PEB"));
        }

        Ok(Self {
            peb_size,
            min_io_size,
            vid_hdr_offset,
            data_offset,
        })
    }

    pub fn peb_size(&self) -> u32 {
        self.peb_size
    }

    pub fn min_io_size(&self) -> NonZeroU32 {
        self.min_io_size
    }

    pub fn get_vid_hdr_offset(&self) -> u32 {
        self.vid_hdr_offset
    }

    pub fn data_offset(&self) -> u32 {
        self.data_offset
    }

    /// The bytes available for data in each PEB, before any alignment padding. This is also the
    /// LEB size that sizes the volume table.
    pub fn max_leb_size(&self) -> u32 {
        self.peb_size - self.data_offset
    }

    /// The bytes cut from the end of each PEB so that LEBs are a multiple of `alignment`
    pub fn data_pad(&self, alignment: NonZeroU32) -> u32 {
        self.max_leb_size() % alignment
    }

    /// The LEB size of a volume with the given alignment
    pub fn leb_size(&self, alignment: NonZeroU32) -> u32 {
        self.max_leb_size() - self.data_pad(alignment)
    }

    /// The EC header every PEB of this flash would carry, for a given erase counter
    pub fn ec_header(&self, ec: u64) -> Ec {
        Ec {
            ec,
            vid_hdr_offset: self.vid_hdr_offset,
            data_offset: self.data_offset,
        }
    }

    /// Lay out one PEB: erased bytes, then the EC header, the VID header, and the data.
    fn build_peb(&self, ec: Ec, vid_bytes: &[u8], data: &[u8]) -> Result<BytesMut, GenError> {
        let mut buf = BytesMut::zeroed(self.peb_size as usize);
        buf.fill(ERASED_BYTE);

        ec.encode(&mut buf[..])?;
        let vid_hdr_offset = self.vid_hdr_offset as usize;
        buf[vid_hdr_offset..][..vid_bytes.len()].copy_from_slice(vid_bytes);
        let data_offset = self.data_offset as usize;
        buf[data_offset..][..data.len()].copy_from_slice(data);

        Ok(buf)
    }
}

/// Deliberate defects to build into generated PEBs, for exercising recovery code.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Actions(u8);

impl Actions {
    pub const NO_ERROR: Self = Self(0);

    /// Flip the low bit of the stored VID header CRC
    pub const BROKEN_HDR_CRC: Self = Self(0x01);

    /// Flip the low bit of the stored data CRC
    pub const BROKEN_DATA_CRC: Self = Self(0x02);

    /// Claim one more byte of data than was written
    pub const BROKEN_DATA_SIZE: Self = Self(0x04);

    /// Set the copy flag, as an interrupted update or wear-leveling move would
    pub const MARK_AS_UPDATE: Self = Self(0x08);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Actions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A fully-formed physical eraseblock, headers and all
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Peb {
    /// The EC header written at the start of `data`
    pub ec: Ec,

    /// The VID header as intended. With [Actions::BROKEN_HDR_CRC], the copy in `data` will not
    /// decode.
    pub vid: Vid,

    /// The raw PEB contents
    pub data: Bytes,
}

impl Peb {
    pub fn write_to<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        sink.write_all(&self.data)
    }
}

/// Describes a UBI volume to be generated. Constructed builder-style.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VolumeDescriptor {
    vtype: VolType,
    id: Option<u32>,
    size: u64,
    name: String,
    flags: u8,
    alignment: NonZeroU32,
    ec: u64,
    leb_ver: u32,
    compat: u8,
    reserved_pebs: Option<u32>,
}

impl Default for VolumeDescriptor {
    fn default() -> Self {
        Self {
            vtype: Default::default(),
            id: Default::default(),
            size: Default::default(),
            name: Default::default(),
            flags: Default::default(),
            alignment: NonZeroU32::MIN,
            ec: Default::default(),
            leb_ver: Default::default(),
            compat: Default::default(),
            reserved_pebs: Default::default(),
        }
    }
}

impl VolumeDescriptor {
    /// Begin describing a new volume, of a given type
    pub fn new(vtype: VolType) -> Self {
        Self {
            vtype,
            ..Default::default()
        }
    }

    /// Set the volume ID. Without one, the volume can only be generated by a [Ubinizer], which
    /// assigns the first free ID.
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the size, in bytes, of the volume's contents.
    ///
    /// The volume will occupy this many bytes rounded up to the next multiple of the LEB size.
    /// The default is 0.
    pub fn size(mut self, bytes: u64) -> Self {
        self.size = bytes;
        self
    }

    /// Set the name of the volume.
    ///
    /// The default is `""`
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Set the UBI "autoresize" flag.
    pub fn autoresize(mut self) -> Self {
        self.flags |= 0x01;
        self
    }

    /// Set the alignment of the volume. All LEBs will be a multiple of this size.
    ///
    /// The default alignment is 1.
    pub fn align(mut self, alignment: NonZeroU32) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the erase counter written to every PEB of this volume.
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    /// Set the LEB version written to every VID header of this volume.
    pub fn leb_version(mut self, leb_ver: u32) -> Self {
        self.leb_ver = leb_ver;
        self
    }

    /// Set the compatibility flags; only meaningful for internal volumes.
    pub fn compat(mut self, compat: u8) -> Self {
        self.compat = compat;
        self
    }

    /// Reserve more PEBs for the volume than its contents need.
    pub fn reserved_pebs(mut self, pebs: u32) -> Self {
        self.reserved_pebs = Some(pebs);
        self
    }

    pub fn get_id(&self) -> Option<u32> {
        self.id
    }

    pub fn get_vol_type(&self) -> VolType {
        self.vtype
    }

    /// How many LEBs this volume needs at the given geometry.
    pub fn leb_count(&self, geometry: &Geometry) -> Result<u32, GenError> {
        let max_leb_size = geometry.max_leb_size();
        if u32::from(self.alignment) >= max_leb_size {
            return Err(TableError::AlignmentTooLarge {
                alignment: self.alignment.into(),
                leb_size: max_leb_size,
            }
            .into());
        }

        let leb_size = u64::from(geometry.leb_size(self.alignment));
        u32::try_from(self.size.div_ceil(leb_size))
            .map_err(|_| GenError::InvalidVolume("volume too large"))
    }
}

/// Where an [ImageGenerator] is in its volume
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
enum GenState {
    Init,
    Emitting { emitted: u32 },
    Done,
}

/// Produces the PEBs of a single volume, in LEB order.
pub struct ImageGenerator<R> {
    source: R,
    geometry: Geometry,
    ec: Ec,
    vid: Vid,
    leb_size: u32,
    leb_total: u32,
    remaining: u64,
    state: GenState,
    record: VolTableRecord,
}

/// Start generating the volume described by `descriptor`, reading its contents from `source`.
pub fn generate<R: Read>(
    geometry: Geometry,
    descriptor: &VolumeDescriptor,
    source: R,
) -> Result<ImageGenerator<R>, GenError> {
    ImageGenerator::new(geometry, descriptor, source)
}

impl<R: Read> ImageGenerator<R> {
    /// Compute this volume's layout and prepare to emit its first LEB.
    pub fn new(
        geometry: Geometry,
        descriptor: &VolumeDescriptor,
        source: R,
    ) -> Result<Self, GenError> {
        let vol_id = descriptor
            .id
            .ok_or(GenError::InvalidVolume("no volume ID assigned"))?;
        if vol_id >= UBI_INTERNAL_VOL_START {
            return Err(GenError::InvalidVolume("volume ID is reserved"));
        }

        let leb_total = descriptor.leb_count(&geometry)?;
        let alignment = descriptor.alignment;
        let data_pad = geometry.data_pad(alignment);
        let leb_size = geometry.leb_size(alignment);

        let used_ebs = match descriptor.vtype {
            VolType::Dynamic => 0,
            VolType::Static => leb_total,
        };

        let vid = Vid {
            vol_type: descriptor.vtype,
            copy_flag: false,
            compat: descriptor.compat,
            vol_id,
            leb_ver: descriptor.leb_ver,
            used_ebs,
            data_pad,
            ..Default::default()
        };

        let record = VolTableRecord {
            reserved_pebs: descriptor.reserved_pebs.unwrap_or(leb_total),
            alignment: alignment.into(),
            data_pad,
            vol_type: descriptor.vtype,
            upd_marker: false,
            name: descriptor.name.clone(),
            flags: descriptor.flags,
        };

        let state = match leb_total {
            0 => GenState::Done,
            _ => GenState::Init,
        };

        Ok(Self {
            source,
            geometry,
            ec: geometry.ec_header(descriptor.ec),
            vid,
            leb_size,
            leb_total,
            remaining: descriptor.size,
            state,
            record,
        })
    }

    pub fn leb_size(&self) -> u32 {
        self.leb_size
    }

    pub fn leb_total(&self) -> u32 {
        self.leb_total
    }

    pub fn is_done(&self) -> bool {
        self.state == GenState::Done
    }

    /// Build the PEB holding the next LEB of the volume.
    pub fn emit_next_leb(&mut self, actions: Actions) -> Result<Peb, GenError> {
        let lnum = match self.state {
            GenState::Init => 0,
            GenState::Emitting { emitted } => emitted,
            GenState::Done => return Err(GenError::GeneratorExhausted(self.leb_total)),
        };

        let expected = std::cmp::min(u64::from(self.leb_size), self.remaining) as usize;
        let mut data = Vec::with_capacity(expected);
        self.source.read_to_vec(&mut data, expected)?;

        if data.len() < expected {
            match self.vid.vol_type {
                VolType::Static => {
                    return Err(GenError::ShortRead {
                        lnum,
                        expected,
                        got: data.len(),
                    })
                }
                // Dynamic contents aren't size-tracked; the rest stays erased
                VolType::Dynamic => {}
            }
        }
        self.remaining -= expected as u64;

        let mut vid = Vid { lnum, ..self.vid };
        if actions.contains(Actions::MARK_AS_UPDATE) {
            vid.copy_flag = true;
        }
        if vid.tracks_data() {
            vid.data_size = data.len() as u32;
            vid.data_crc = UBI_CRC.checksum(&data);
        }
        if actions.contains(Actions::BROKEN_DATA_CRC) {
            vid.data_crc ^= 1;
        }
        if actions.contains(Actions::BROKEN_DATA_SIZE) {
            vid.data_size += 1;
        }

        let mut vid_bytes = vid.to_bytes();
        if actions.contains(Actions::BROKEN_HDR_CRC) {
            if let Some(low) = vid_bytes.last_mut() {
                *low ^= 1;
            }
        }

        let buf = self.geometry.build_peb(self.ec, &vid_bytes, &data)?;

        self.state = match lnum + 1 {
            emitted if emitted == self.leb_total => GenState::Done,
            emitted => GenState::Emitting { emitted },
        };

        Ok(Peb {
            ec: self.ec,
            vid,
            data: buf.freeze(),
        })
    }

    /// Write every remaining PEB of the volume to `sink`, returning how many were written.
    pub fn write_all<W: Write>(&mut self, sink: &mut W) -> Result<u32, GenError> {
        let mut written = 0;
        while !self.is_done() {
            self.emit_next_leb(Actions::NO_ERROR)?.write_to(sink)?;
            written += 1;
        }
        Ok(written)
    }

    /// The volume table record describing this volume.
    pub fn vtbl_record(&self) -> VolTableRecord {
        self.record.clone()
    }
}

impl<R: Read> Iterator for ImageGenerator<R> {
    type Item = Result<Peb, GenError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.is_done() {
            true => None,
            false => Some(self.emit_next_leb(Actions::NO_ERROR)),
        }
    }
}

/// Build both copies of the layout volume, holding `table`, with erase counters `ec1`/`ec2`.
pub fn layout_volume_pebs(
    geometry: &Geometry,
    table: &VolumeTable,
    ec1: u64,
    ec2: u64,
) -> Result<[Peb; 2], GenError> {
    let leb_size = geometry.max_leb_size();
    if table.leb_size() != leb_size {
        return Err(GenError::InvalidVolume(
            "volume table was sized for another LEB size",
        ));
    }

    let mut data = table.to_bytes();
    if data.len() > leb_size as usize {
        return Err(GenError::InvalidVolume("volume table does not fit in a LEB"));
    }
    data.resize(leb_size as usize, 0u8);

    let vid = Vid {
        vol_id: UBI_LAYOUT_VOLUME_ID,
        vol_type: UBI_LAYOUT_VOLUME_TYPE,
        compat: UBI_LAYOUT_VOLUME_COMPAT,
        ..Default::default()
    };

    let build = |lnum: u32, ec: u64| -> Result<Peb, GenError> {
        let ec = geometry.ec_header(ec);
        let mut vid = vid;
        vid.lnum = lnum;
        let buf = geometry.build_peb(ec, &vid.to_bytes(), &data)?;
        Ok(Peb {
            ec,
            vid,
            data: buf.freeze(),
        })
    };

    Ok([build(0, ec1)?, build(1, ec2)?])
}

/// Write both copies of the layout volume to `sink`.
pub fn emit_layout_volume<W: Write>(
    geometry: &Geometry,
    table: &VolumeTable,
    ec1: u64,
    ec2: u64,
    sink: &mut W,
) -> Result<(), GenError> {
    for peb in layout_volume_pebs(geometry, table, ec1, ec2)? {
        peb.write_to(sink)?;
    }
    Ok(())
}

/// Given a sequence of volumes and the flash geometry, writes the PEBs of a complete image: every
/// volume in turn, then the layout volume describing them.
pub struct Ubinizer<'a> {
    geometry: Geometry,
    volumes: Vec<(VolumeDescriptor, Box<dyn Read + 'a>)>,
    layout_ec: u64,
}

impl<'a> Ubinizer<'a> {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            volumes: Vec::new(),
            layout_ec: 0,
        }
    }

    /// Add a volume, with the source of its contents.
    pub fn volume(mut self, descriptor: VolumeDescriptor, source: impl Read + 'a) -> Self {
        self.volumes.push((descriptor, Box::new(source)));
        self
    }

    /// Set the erase counter of the layout volume's PEBs.
    pub fn layout_ec(mut self, ec: u64) -> Self {
        self.layout_ec = ec;
        self
    }

    /// How many PEBs the image will contain.
    pub fn estimate_blocks(&self) -> Result<u32, GenError> {
        let mut blocks = UBI_LAYOUT_VOLUME_EBS;
        for (descriptor, _) in &self.volumes {
            blocks = blocks
                .checked_add(descriptor.leb_count(&self.geometry)?)
                .ok_or(GenError::InvalidVolume("image too large"))?;
        }
        Ok(blocks)
    }

    /// Reserve a slot in `table` for every volume, giving volumes without an ID the first free
    /// one. The slots hold placeholders until the volumes are generated.
    fn assign_ids(&mut self, table: &mut VolumeTable) -> Result<(), GenError> {
        let placeholder = |descriptor: &VolumeDescriptor| VolTableRecord {
            vol_type: descriptor.vtype,
            name: descriptor.name.clone(),
            ..Default::default()
        };

        for (descriptor, _) in &self.volumes {
            if let Some(id) = descriptor.id {
                if table.get(id).is_some() {
                    return Err(GenError::InvalidVolume("volume ID used twice"));
                }
                table.store_record(id, placeholder(descriptor))?;
            }
        }

        for (descriptor, _) in self.volumes.iter_mut().filter(|(d, _)| d.id.is_none()) {
            let id = table
                .allocate_id()
                .ok_or(GenError::InvalidVolume("volume table is full"))?;
            table.store_record(id, placeholder(descriptor))?;
            descriptor.id = Some(id);
        }

        Ok(())
    }

    /// Write the whole image to `sink`, returning the volume table that was written into it.
    pub fn write_image<W: Write>(mut self, sink: &mut W) -> Result<VolumeTable, GenError> {
        let mut table = VolumeTable::new(self.geometry.max_leb_size());
        self.assign_ids(&mut table)?;

        let rpt = howudoin::new()
            .label("Generating image")
            .set_len(u64::from(self.estimate_blocks()?));

        for (descriptor, source) in self.volumes {
            let mut generator = ImageGenerator::new(self.geometry, &descriptor, source)?;
            while !generator.is_done() {
                generator.emit_next_leb(Actions::NO_ERROR)?.write_to(sink)?;
                rpt.inc();
            }

            let vol_id = descriptor.id.unwrap_or_default();
            tracing::debug!(vol_id, lebs = generator.leb_total(), "volume generated");
            table.store_record(vol_id, generator.vtbl_record())?;
        }

        for peb in layout_volume_pebs(&self.geometry, &table, self.layout_ec, self.layout_ec)? {
            peb.write_to(sink)?;
            rpt.inc();
        }
        rpt.close();

        Ok(table)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ubi::vtbl::decode_table;

    /// 64-byte I/O units, so EC at 0, VID at 64, data at 128, and 1 KiB LEBs
    fn test_geometry() -> Geometry {
        Geometry::new(1024 + 128, NonZeroU32::new(64).unwrap()).unwrap()
    }

    #[test]
    fn test_geometry_defaults() -> anyhow::Result<()> {
        let geometry = Geometry::new(128 * 1024, NonZeroU32::new(2048).unwrap())?;
        assert_eq!(geometry.get_vid_hdr_offset(), 2048);
        assert_eq!(geometry.data_offset(), 4096);
        assert_eq!(geometry.max_leb_size(), 126976);

        let align = NonZeroU32::new(4000).unwrap();
        assert_eq!(geometry.data_pad(align), 126976 % 4000);
        assert_eq!(geometry.leb_size(align), 124000);

        // Sub-page VID header
        let geometry = geometry.vid_hdr_offset(512)?;
        assert_eq!(geometry.data_offset(), 2048);

        assert!(matches!(
            Geometry::new(2048, NonZeroU32::new(2048).unwrap()),
            Err(GenError::InvalidGeometry(_))
        ));
        assert!(matches!(
            geometry.vid_hdr_offset(32),
            Err(GenError::InvalidGeometry(_))
        ));

        Ok(())
    }

    #[test]
    fn test_static_volume() -> anyhow::Result<()> {
        let geometry = test_geometry();
        let descriptor = VolumeDescriptor::new(VolType::Static)
            .id(7)
            .size(4096)
            .name("firmware");
        let mut generator = generate(geometry, &descriptor, std::io::repeat(0x11))?;
        assert_eq!(generator.leb_total(), 4);

        for i in 0..4 {
            let peb = generator.emit_next_leb(Actions::NO_ERROR)?;
            assert_eq!(
                peb.vid,
                Vid {
                    vol_type: VolType::Static,
                    copy_flag: false,
                    compat: 0,
                    vol_id: 7,
                    lnum: i,
                    leb_ver: 0,
                    data_size: 1024,
                    used_ebs: 4,
                    data_pad: 0,
                    data_crc: 0x8d746e93,
                    ivol_data: Default::default(),
                }
            );

            assert_eq!(peb.data.len(), 1152);
            assert_eq!(Ec::decode(&peb.data), Ok(peb.ec));
            assert_eq!(Vid::decode(&peb.data[64..]), Ok(peb.vid));
            assert!(peb.data[128..].iter().all(|&b| b == 0x11));
        }
        assert!(generator.is_done());
        assert!(matches!(
            generator.emit_next_leb(Actions::NO_ERROR),
            Err(GenError::GeneratorExhausted(4))
        ));

        assert_eq!(
            generator.vtbl_record(),
            VolTableRecord {
                reserved_pebs: 4,
                alignment: 1,
                vol_type: VolType::Static,
                name: "firmware".to_string(),
                ..Default::default()
            }
        );

        Ok(())
    }

    #[test]
    fn test_dynamic_volume() -> anyhow::Result<()> {
        let geometry = test_geometry();
        let descriptor = VolumeDescriptor::new(VolType::Dynamic)
            .id(0)
            .size(1500)
            .ec(9);
        let pebs = generate(geometry, &descriptor, &[0xA5u8; 1500][..])?
            .collect::<Result<Vec<_>, _>>()?;

        assert_eq!(pebs.len(), 2);
        for (peb, lnum) in pebs.iter().zip(0..) {
            assert_eq!(peb.ec.ec, 9);
            assert_eq!(peb.vid.lnum, lnum);
            assert_eq!(peb.vid.data_size, 0);
            assert_eq!(peb.vid.data_crc, 0);
            assert_eq!(peb.vid.used_ebs, 0);
        }

        // The tail of the last LEB stays erased
        assert!(pebs[1].data[128..][..476].iter().all(|&b| b == 0xA5));
        assert!(pebs[1].data[128 + 476..].iter().all(|&b| b == 0xFF));

        Ok(())
    }

    #[test]
    fn test_actions() -> anyhow::Result<()> {
        let geometry = test_geometry();
        let descriptor = VolumeDescriptor::new(VolType::Dynamic).id(1).size(3072);
        let mut generator = generate(geometry, &descriptor, std::io::repeat(0x11))?;

        // A copied dynamic LEB tracks its data like a static one
        let peb = generator.emit_next_leb(Actions::MARK_AS_UPDATE)?;
        assert!(peb.vid.copy_flag);
        assert_eq!(peb.vid.data_size, 1024);
        assert_eq!(peb.vid.data_crc, 0x8d746e93);
        assert!(peb.vid.check_data(&peb.data[128..]));

        let peb = generator.emit_next_leb(Actions::MARK_AS_UPDATE | Actions::BROKEN_DATA_CRC)?;
        assert_eq!(Vid::decode(&peb.data[64..]), Ok(peb.vid));
        assert!(!peb.vid.check_data(&peb.data[128..]));

        let peb = generator.emit_next_leb(Actions::BROKEN_HDR_CRC)?;
        assert_eq!(peb.vid.lnum, 2);
        assert!(Vid::decode(&peb.data[64..]).unwrap_err().is_crc());

        Ok(())
    }

    #[test]
    fn test_short_read() -> anyhow::Result<()> {
        let geometry = test_geometry();
        let descriptor = VolumeDescriptor::new(VolType::Static).id(2).size(2048);
        let mut generator = generate(geometry, &descriptor, &[0u8; 1500][..])?;

        generator.emit_next_leb(Actions::NO_ERROR)?;
        assert!(matches!(
            generator.emit_next_leb(Actions::NO_ERROR),
            Err(GenError::ShortRead {
                lnum: 1,
                expected: 1024,
                got: 476
            })
        ));

        Ok(())
    }

    #[test]
    fn test_bad_descriptors() {
        let geometry = test_geometry();
        let source = std::io::empty();

        assert!(matches!(
            generate(geometry, &VolumeDescriptor::new(VolType::Static), source),
            Err(GenError::InvalidVolume(_))
        ));
        assert!(matches!(
            generate(
                geometry,
                &VolumeDescriptor::new(VolType::Static)
                    .id(0)
                    .align(NonZeroU32::new(1024).unwrap()),
                std::io::empty()
            ),
            Err(GenError::Table(TableError::AlignmentTooLarge { .. }))
        ));
        assert!(matches!(
            generate(
                geometry,
                &VolumeDescriptor::new(VolType::Static).id(UBI_LAYOUT_VOLUME_ID),
                std::io::empty()
            ),
            Err(GenError::InvalidVolume(_))
        ));
    }

    #[test]
    fn test_layout_volume() -> anyhow::Result<()> {
        let geometry = test_geometry();
        let mut table = VolumeTable::new(geometry.max_leb_size());
        table.add_record(0, 3, NonZeroU32::MIN, VolType::Dynamic, "data")?;

        let mut sink = Vec::new();
        emit_layout_volume(&geometry, &table, 4, 5, &mut sink)?;
        assert_eq!(sink.len(), 2 * 1152);

        for (peb, lnum) in sink.chunks_exact(1152).zip(0..) {
            let ec = Ec::decode(peb)?;
            let vid = Vid::decode(&peb[64..])?;
            assert_eq!(ec.ec, 4 + u64::from(lnum));
            assert_eq!(vid.vol_id, UBI_LAYOUT_VOLUME_ID);
            assert_eq!(vid.vol_type, VolType::Dynamic);
            assert_eq!(vid.compat, UBI_LAYOUT_VOLUME_COMPAT);
            assert_eq!(vid.lnum, lnum);

            let records = decode_table(&peb[128..]);
            assert_eq!(records.len(), 1024 / 172);
            assert_eq!(records[0], Ok(table.get(0).cloned()));
            // Zero-filled past the table
            assert!(peb[128 + records.len() * 172..].iter().all(|&b| b == 0));
        }

        let small = VolumeTable::new(512);
        assert!(matches!(
            layout_volume_pebs(&geometry, &small, 0, 0),
            Err(GenError::InvalidVolume(_))
        ));

        Ok(())
    }

    #[test]
    fn test_ubinizer() -> anyhow::Result<()> {
        let geometry = test_geometry();
        let ubinizer = Ubinizer::new(geometry)
            .volume(
                VolumeDescriptor::new(VolType::Dynamic).name("auto").size(100),
                std::io::repeat(1),
            )
            .volume(
                VolumeDescriptor::new(VolType::Static)
                    .id(0)
                    .name("fixed")
                    .size(2000),
                std::io::repeat(2),
            );
        assert_eq!(ubinizer.estimate_blocks()?, 1 + 2 + 2);

        let mut sink = Vec::new();
        let table = ubinizer.write_image(&mut sink)?;
        assert_eq!(sink.len(), 5 * 1152);

        assert_eq!(table.get(0).map(|x| x.name.as_str()), Some("fixed"));
        assert_eq!(table.get(1).map(|x| x.name.as_str()), Some("auto"));
        assert_eq!(table.get(1).map(|x| x.reserved_pebs), Some(1));

        let vids = sink
            .chunks_exact(1152)
            .map(|peb| Vid::decode(&peb[64..]))
            .collect::<Result<Vec<_>, _>>()?;
        let ids: Vec<_> = vids.iter().map(|x| (x.vol_id, x.lnum)).collect();
        assert_eq!(
            ids,
            [
                (1, 0),
                (0, 0),
                (0, 1),
                (UBI_LAYOUT_VOLUME_ID, 0),
                (UBI_LAYOUT_VOLUME_ID, 1)
            ]
        );

        Ok(())
    }

    #[test]
    fn test_ubinizer_bad_volumes() {
        let geometry = test_geometry();

        // Alignment beyond the LEB size must be refused before anything is sized or written
        let mut sink = Vec::new();
        let result = Ubinizer::new(geometry)
            .volume(
                VolumeDescriptor::new(VolType::Dynamic)
                    .id(0)
                    .size(10)
                    .align(NonZeroU32::new(2048).unwrap()),
                std::io::repeat(1),
            )
            .write_image(&mut sink);
        assert!(matches!(
            result,
            Err(GenError::Table(TableError::AlignmentTooLarge {
                alignment: 2048,
                leb_size: 1024
            }))
        ));
        assert!(sink.is_empty());

        let twice = Ubinizer::new(geometry)
            .volume(VolumeDescriptor::new(VolType::Dynamic).id(2), std::io::empty())
            .volume(VolumeDescriptor::new(VolType::Static).id(2), std::io::empty())
            .write_image(&mut sink);
        assert!(matches!(twice, Err(GenError::InvalidVolume(_))));

        let out_of_range = Ubinizer::new(geometry)
            .volume(VolumeDescriptor::new(VolType::Dynamic).id(6), std::io::empty())
            .write_image(&mut sink);
        assert!(matches!(
            out_of_range,
            Err(GenError::Table(TableError::IdOutOfRange { id: 6, max: 5 }))
        ));
    }
}
