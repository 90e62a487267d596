//! The volume table: the array of records, indexed by volume ID, that the layout volume carries.
//!
//! Unlike the per-PEB headers, a damaged record does not spoil the table: [decode_table] reports
//! each slot separately, so that one corrupt record only makes one volume disappear.

use super::headers::{ComputeCrc, DekuContainerRead, DekuContainerWrite, VolType, UBI_CRC};
use income::VtblRecord;
use thiserror::Error;

use std::num::NonZeroU32;

pub const UBI_VTBL_RECORD_SIZE: usize = 0xAC;
pub const UBI_MAX_VOLUMES: usize = 128;

/// Longest volume name; the name field is always NUL-terminated on flash.
pub const UBI_VOL_NAME_MAX: usize = 127;

/// Volume IDs from here to the top of the (signed) 32-bit ID space are reserved for internal
/// volumes.
pub const UBI_INTERNAL_VOL_START: u32 = 0x7FFF_FFFF - 4096;

/// The internal volume holding the volume table.
pub const UBI_LAYOUT_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START;

const VTBL_FLAG_AUTORESIZE: u8 = 0x01;

/// Reasons a volume table operation can fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("volume ID {id} out of range (the table holds {max} records)")]
    IdOutOfRange { id: u32, max: usize },

    #[error("alignment {alignment} is not smaller than the LEB size {leb_size}")]
    AlignmentTooLarge { alignment: u32, leb_size: u32 },

    #[error("volume name is {len} bytes long, at most 127 are allowed")]
    NameTooLong { len: usize },

    #[error("volume table record {id}: CRC mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    RecordCrcMismatch { id: u32, stored: u32, computed: u32 },

    #[error("volume table record {id} is malformed: {reason}")]
    BadRecord { id: u32, reason: &'static str },
}

/// The decoded state of one slot of the table: `Ok(None)` for an unused ID.
pub type RecordSlot = Result<Option<VolTableRecord>, TableError>;

impl ComputeCrc for VtblRecord {
    fn get_crc(&self) -> u32 {
        self.crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.crc = crc;
    }
}

/// How many records fit in the table for a given LEB size.
pub fn max_records(leb_size: u32) -> usize {
    std::cmp::min(leb_size as usize / UBI_VTBL_RECORD_SIZE, UBI_MAX_VOLUMES)
}

/// Build a table with every slot unused.
pub fn encode_empty_table(leb_size: u32) -> VolumeTable {
    VolumeTable::new(leb_size)
}

/// Decode every record in `bytes` (up to [max_records] of them), each independently.
pub fn decode_table(bytes: &[u8]) -> Vec<RecordSlot> {
    let count = max_records(u32::try_from(bytes.len()).unwrap_or(u32::MAX));
    bytes
        .chunks_exact(UBI_VTBL_RECORD_SIZE)
        .take(count)
        .zip(0u32..)
        .map(|(record, id)| VolTableRecord::decode(record, id))
        .collect()
}

/// This represents the specific fields we care about in a volume table record
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// The total number of PEBs allocated to this volume.
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size.
    pub alignment: u32,

    /// The number of bytes reserved from the end of each PEB to ensure alignment.
    pub data_pad: u32,

    /// The type of volume.
    pub vol_type: VolType,

    /// Set to `true` during a whole-volume update, so that if interrupted, it's possible to detect
    /// that the volume is corrupt.
    pub upd_marker: bool,

    /// The name of the volume. This code supports any UTF-8 string, but as other UBI implementors
    /// might assume only ASCII, it's best to stick to that.
    pub name: String,

    /// Any flags set on this volume.
    pub flags: u8,
}

impl VolTableRecord {
    /// Whether the volume should grow to fill the flash on first attach.
    pub fn autoresize(&self) -> bool {
        self.flags & VTBL_FLAG_AUTORESIZE != 0
    }

    /// Convert the record for volume `id` from a byte slice; an all-zero record is `None`.
    pub fn decode(bytes: &[u8], id: u32) -> RecordSlot {
        let bytes = bytes.get(..UBI_VTBL_RECORD_SIZE).ok_or(TableError::BadRecord {
            id,
            reason: "record truncated",
        })?;
        let (_, vtblrec) = VtblRecord::from_bytes((bytes, 0)).map_err(|_| TableError::BadRecord {
            id,
            reason: "record truncated",
        })?;

        let body = &bytes[..UBI_VTBL_RECORD_SIZE - std::mem::size_of::<u32>()];
        let (stored, computed) = (vtblrec.get_crc(), UBI_CRC.checksum(body));
        if stored != computed {
            return Err(TableError::RecordCrcMismatch {
                id,
                stored,
                computed,
            });
        }

        if body.iter().all(|&b| b == 0) {
            return Ok(None);
        }

        Self::try_from(vtblrec)
            .map(Some)
            .map_err(|reason| TableError::BadRecord { id, reason })
    }

    /// Write into a Vec<u8>
    pub fn into_bytes(self) -> Vec<u8> {
        VtblRecord::from(self)
            .to_bytes()
            .expect("fixed-size UBI structures always serialize")
    }

    /// Represent an empty entry in the volume table
    pub fn none_into_bytes() -> Vec<u8> {
        let mut record = VtblRecord {
            reserved_pebs: Default::default(),
            alignment: Default::default(),
            data_pad: Default::default(),
            vol_type: Default::default(),
            upd_marker: Default::default(),
            name: std::array::from_fn(|_| 0u8),
            name_len: Default::default(),
            flags: Default::default(),
            crc: Default::default(),
            padding: Default::default(),
        };
        record.fix_crc();
        record
            .to_bytes()
            .expect("fixed-size UBI structures always serialize")
    }
}

pub trait OptionIntoBytes {
    fn into_bytes(self) -> Vec<u8>;
}

impl OptionIntoBytes for Option<VolTableRecord> {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Some(x) => x.into_bytes(),
            None => VolTableRecord::none_into_bytes(),
        }
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = &'static str;

    fn try_from(value: VtblRecord) -> Result<Self, Self::Error> {
        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,
            ..
        } = value;

        let vol_type = vol_type.try_into().map_err(|_| "bad volume type")?;
        let upd_marker = upd_marker != 0;
        let name = name
            .get(..name_len as usize)
            .filter(|_| name_len as usize <= UBI_VOL_NAME_MAX)
            .ok_or("name length out of range")?;
        let name = std::str::from_utf8(name)
            .map_err(|_| "name is not UTF-8")?
            .to_string();

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        })
    }
}

impl From<VolTableRecord> for VtblRecord {
    fn from(value: VolTableRecord) -> VtblRecord {
        let VolTableRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        } = value;

        let vol_type = vol_type.into();
        let upd_marker = upd_marker.into();

        // Over-long names never get this far; `VolumeTable` rejects them.
        let name_bytes = &name.as_bytes()[..name.len().min(UBI_VOL_NAME_MAX)];
        let name_len = name_bytes.len() as _;
        let mut name = std::array::from_fn(|_| 0u8);
        name[..name_bytes.len()].copy_from_slice(name_bytes);

        let mut target = Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,

            crc: Default::default(),
            padding: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// The volume table of one flash, sized for its LEB size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeTable {
    leb_size: u32,
    records: Vec<Option<VolTableRecord>>,
}

impl VolumeTable {
    /// Begin building a new, empty volume table. The LEB size must be known ahead of time.
    pub fn new(leb_size: u32) -> Self {
        let records = vec![Default::default(); max_records(leb_size)];
        Self { leb_size, records }
    }

    pub fn leb_size(&self) -> u32 {
        self.leb_size
    }

    /// All slots, indexed by volume ID.
    pub fn records(&self) -> &[Option<VolTableRecord>] {
        &self.records
    }

    pub fn get(&self, id: u32) -> Option<&VolTableRecord> {
        self.records.get(id as usize)?.as_ref()
    }

    /// Find some unused volume ID, from the (still-available) record slots
    ///
    /// The ID is not considered unavailable until a record is stored in it
    pub fn allocate_id(&self) -> Option<u32> {
        self.records
            .iter()
            .position(|x| x.is_none())
            .map(|x| x as u32)
    }

    /// Describe a volume in slot `id`, replacing whatever was there.
    ///
    /// `data_pad` is derived from the alignment, so that LEBs are a multiple of it.
    pub fn add_record(
        &mut self,
        id: u32,
        reserved_pebs: u32,
        alignment: NonZeroU32,
        vol_type: VolType,
        name: &str,
    ) -> Result<(), TableError> {
        let alignment = u32::from(alignment);
        if alignment >= self.leb_size {
            return Err(TableError::AlignmentTooLarge {
                alignment,
                leb_size: self.leb_size,
            });
        }

        self.store_record(
            id,
            VolTableRecord {
                reserved_pebs,
                alignment,
                data_pad: self.leb_size % alignment,
                vol_type,
                name: name.to_string(),
                ..Default::default()
            },
        )
    }

    /// Store a fully-formed volume table record in slot `id`.
    pub fn store_record(&mut self, id: u32, record: VolTableRecord) -> Result<(), TableError> {
        let max = self.records.len();
        let slot = self
            .records
            .get_mut(id as usize)
            .ok_or(TableError::IdOutOfRange { id, max })?;

        if record.name.len() > UBI_VOL_NAME_MAX {
            return Err(TableError::NameTooLong {
                len: record.name.len(),
            });
        }

        *slot = Some(record);
        Ok(())
    }

    /// Serialize every record, in ID order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(UBI_VTBL_RECORD_SIZE * self.records.len());
        self.records
            .iter()
            .for_each(|record| data.append(&mut record.clone().into_bytes()));
        data
    }
}

#[cfg(test)]
const TEST_LEB_SIZE: u32 = 126976;

#[test]
fn test_record_roundtrip() {
    let vtbl = VolTableRecord {
        reserved_pebs: 12,
        alignment: 1024,
        data_pad: 4,
        vol_type: VolType::Static,
        upd_marker: true,
        name: "example".to_string(),
        flags: VTBL_FLAG_AUTORESIZE,
    };
    assert!(vtbl.autoresize());

    let vec = vtbl.clone().into_bytes();
    assert_eq!(vec.len(), UBI_VTBL_RECORD_SIZE);
    assert_eq!(VolTableRecord::decode(&vec, 0), Ok(Some(vtbl)));
}

#[test]
fn test_max_records() {
    assert_eq!(max_records(TEST_LEB_SIZE), UBI_MAX_VOLUMES);
    assert_eq!(max_records(16 * 1024), 16 * 1024 / UBI_VTBL_RECORD_SIZE);
    assert_eq!(max_records(100), 0);
}

#[test]
fn test_empty_table() {
    let bytes = encode_empty_table(TEST_LEB_SIZE).to_bytes();
    assert_eq!(bytes.len(), UBI_MAX_VOLUMES * UBI_VTBL_RECORD_SIZE);
    assert_eq!(bytes, encode_empty_table(TEST_LEB_SIZE).to_bytes());

    // Each record is zero except for the CRC of those zeroes
    let zero_crc = UBI_CRC.checksum(&[0u8; UBI_VTBL_RECORD_SIZE - 4]);
    for record in bytes.chunks_exact(UBI_VTBL_RECORD_SIZE) {
        assert!(record[..UBI_VTBL_RECORD_SIZE - 4].iter().all(|&b| b == 0));
        assert_eq!(record[UBI_VTBL_RECORD_SIZE - 4..], zero_crc.to_be_bytes());
    }

    assert!(decode_table(&bytes).into_iter().all(|x| x == Ok(None)));
}

#[test]
fn test_add_record() -> anyhow::Result<()> {
    let mut table = encode_empty_table(TEST_LEB_SIZE);
    let align = NonZeroU32::new(2048).unwrap();

    table.add_record(5, 10, align, VolType::Dynamic, "rootfs")?;
    let record = table.get(5).unwrap();
    assert_eq!(record.data_pad, TEST_LEB_SIZE % 2048);
    assert_eq!(record.name, "rootfs");
    assert_eq!(table.allocate_id(), Some(0));
    table.add_record(0, 1, align, VolType::Static, "boot")?;
    assert_eq!(table.allocate_id(), Some(1));

    assert_eq!(
        table.add_record(128, 1, align, VolType::Dynamic, "x"),
        Err(TableError::IdOutOfRange { id: 128, max: 128 })
    );
    assert!(matches!(
        table.add_record(0x7FFF_EFFF, 1, align, VolType::Dynamic, "layout"),
        Err(TableError::IdOutOfRange { .. })
    ));
    assert!(matches!(
        table.add_record(
            1,
            1,
            NonZeroU32::new(TEST_LEB_SIZE).unwrap(),
            VolType::Static,
            "x"
        ),
        Err(TableError::AlignmentTooLarge { .. })
    ));
    assert_eq!(
        table.add_record(1, 1, align, VolType::Static, &"n".repeat(128)),
        Err(TableError::NameTooLong { len: 128 })
    );

    let decoded = decode_table(&table.to_bytes());
    assert_eq!(decoded.len(), 128);
    assert_eq!(decoded[5], Ok(table.get(5).cloned()));
    assert_eq!(decoded[1], Ok(None));

    Ok(())
}

#[test]
fn test_partial_corruption() -> anyhow::Result<()> {
    let mut table = encode_empty_table(TEST_LEB_SIZE);
    let align = NonZeroU32::new(1).unwrap();
    for id in 0..4 {
        table.add_record(id, id + 1, align, VolType::Dynamic, &format!("vol{id}"))?;
    }

    let mut bytes = table.to_bytes();
    bytes[2 * UBI_VTBL_RECORD_SIZE + 20] ^= 0x10;

    let decoded = decode_table(&bytes);
    assert_eq!(decoded.len(), 128);
    assert_eq!(decoded.iter().filter(|x| x.is_ok()).count(), 127);
    assert!(matches!(
        decoded[2],
        Err(TableError::RecordCrcMismatch { id: 2, .. })
    ));
    assert_eq!(decoded[3].as_ref().unwrap().as_ref().unwrap().name, "vol3");

    Ok(())
}

#[test]
fn test_bad_record_contents() {
    let mut record = VtblRecord::from(VolTableRecord {
        vol_type: VolType::Static,
        name: "ok".to_string(),
        ..Default::default()
    });
    record.vol_type = 7;
    record.fix_crc();

    let bytes = record.to_bytes().unwrap();
    assert_eq!(
        VolTableRecord::decode(&bytes, 9),
        Err(TableError::BadRecord {
            id: 9,
            reason: "bad volume type"
        })
    );
}
