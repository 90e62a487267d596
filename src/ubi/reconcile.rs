//! This module picks, for every LEB found on flash, the one PEB that holds its current contents.
//!
//! Several PEBs can claim the same `vol_id:lnum` at once: a wear-leveling move writes the new copy
//! before erasing the old one, and power can be lost anywhere in between. The copy with the newest
//! LEB version wins, except that a copy with the copy flag set is only trusted if its data CRC
//! checks out (otherwise the move that wrote it never finished). Losing copies are kept, newest
//! first, as the history of their LEB.

use super::headers::{Ec, Vid, VolType};
use super::source::PebReader;
use super::vtbl::{decode_table, RecordSlot, UBI_LAYOUT_VOLUME_ID};
use crate::util::ERASED_BYTE;

use thiserror::Error;

use std::cmp::Ordering;
use std::collections::btree_map::{BTreeMap, Entry};
use std::fmt;
use std::io::{self, Write};

/// Decide whether LEB version `a` is newer than `b`, allowing for the counter wrapping around.
///
/// The numerically larger version is newer unless the two are more than 2^31 apart, in which case
/// the larger one must be from before the wrap.
pub fn leb_ver_newer(a: u32, b: u32) -> bool {
    const HALF: u32 = 0x8000_0000;

    match a.cmp(&b) {
        Ordering::Greater => a - b <= HALF,
        Ordering::Less => b - a > HALF,
        Ordering::Equal => false,
    }
}

/// Reasons reconciled data cannot be produced.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("volume {0} has no LEBs on flash")]
    VolumeNotFound(u32),

    #[error("volume {vol_id} is missing LEB {lnum}")]
    MissingLeb { vol_id: u32, lnum: u32 },

    #[error("cannot read PEB {pnum} (volume {vol_id}, LEB {lnum}): {source}")]
    ReadPeb {
        pnum: u32,
        vol_id: u32,
        lnum: u32,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What to do when a volume being rebuilt lacks some LEB
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum GapPolicy {
    /// Stop with [ReconcileError::MissingLeb]
    #[default]
    Fail,

    /// Emit a LEB's worth of erased bytes in its place
    Pad,
}

/// The identity of a LEB
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Hash)]
pub struct LebKey {
    pub vol_id: u32,
    pub lnum: u32,
}

/// What the scanner learned about one PEB that carries a VID header.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct ScannedEraseblock {
    /// The PEB's position on flash
    pub pnum: u32,

    /// The EC header; only meaningful if `ec_ok`
    pub ec: Ec,

    /// The VID header; only meaningful if `vid_ok`
    pub vid: Vid,

    pub ec_ok: bool,
    pub vid_ok: bool,

    /// Whether the data matches `vid.data_crc`. Only checked when the VID header tracks data
    /// (static volumes and copied LEBs); `true` otherwise.
    pub data_ok: bool,

    /// Where the LEB's data starts within the PEB
    pub data_offset: u32,
}

impl ScannedEraseblock {
    pub fn key(&self) -> LebKey {
        LebKey {
            vol_id: self.vid.vol_id,
            lnum: self.vid.lnum,
        }
    }

    /// How many bytes of this PEB belong to the volume's contents.
    fn payload_len(&self, peb_size: u32) -> u32 {
        let leb_size = self.leb_size(peb_size);
        match self.vid.vol_type {
            VolType::Static => std::cmp::min(self.vid.data_size, leb_size),
            VolType::Dynamic => leb_size,
        }
    }

    fn leb_size(&self, peb_size: u32) -> u32 {
        peb_size
            .saturating_sub(self.data_offset)
            .saturating_sub(self.vid.data_pad)
    }
}

/// Why a PEB was kept out of its LEB's history altogether
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Rejection {
    /// The VID header did not decode, so the PEB's LEB is unknown
    BadVidHeader,

    /// The copy flag is set but the data CRC is wrong: an interrupted move
    InterruptedCopy,
}

/// The effect of inserting a PEB into a [Reconciler]
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Insertion {
    /// First copy of its LEB seen so far
    NewLeb,

    /// Newer than the previous authoritative copy, which became history
    Superseded { previous: u32 },

    /// Older than (or as old as) the authoritative copy; filed as history
    History { current: u32 },

    /// Not usable; see [Reconciler::rejected]
    Rejected(Rejection),
}

/// A descriptor plus its link to the next-older copy of the same LEB
#[derive(Debug)]
struct Node {
    eb: ScannedEraseblock,
    older: Option<usize>,
}

/// One reconciliation session: owns every descriptor it has been given.
///
/// Descriptors live in an arena and refer to each other by index, so the chains can be walked and
/// spliced freely without any ownership juggling.
#[derive(Debug)]
pub struct Reconciler {
    peb_size: u32,
    nodes: Vec<Node>,
    heads: BTreeMap<LebKey, usize>,
    rejected: Vec<usize>,
}

/// Run a whole reconciliation over scanned PEBs of size `peb_size`.
pub fn reconcile<I>(peb_size: u32, ebs: I) -> Reconciler
where
    I: IntoIterator<Item = ScannedEraseblock>,
{
    let mut reconciler = Reconciler::new(peb_size);
    for eb in ebs {
        reconciler.insert(eb);
    }
    reconciler
}

impl Reconciler {
    pub fn new(peb_size: u32) -> Self {
        Self {
            peb_size,
            nodes: Vec::new(),
            heads: BTreeMap::new(),
            rejected: Vec::new(),
        }
    }

    pub fn peb_size(&self) -> u32 {
        self.peb_size
    }

    /// File a newly-scanned PEB under its LEB.
    pub fn insert(&mut self, eb: ScannedEraseblock) -> Insertion {
        let rejection = if !eb.vid_ok {
            Some(Rejection::BadVidHeader)
        } else if eb.vid.copy_flag && !eb.data_ok {
            Some(Rejection::InterruptedCopy)
        } else {
            None
        };

        let (key, pnum, leb_ver) = (eb.key(), eb.pnum, eb.vid.leb_ver);
        let idx = self.nodes.len();
        self.nodes.push(Node { eb, older: None });

        if let Some(rejection) = rejection {
            tracing::debug!(pnum, ?rejection, "PEB rejected");
            self.rejected.push(idx);
            return Insertion::Rejected(rejection);
        }

        let current = match self.heads.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(idx);
                return Insertion::NewLeb;
            }
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if leb_ver_newer(leb_ver, self.nodes[current].eb.vid.leb_ver) {
                    entry.insert(idx);
                    self.nodes[idx].older = Some(current);

                    let previous = self.nodes[current].eb.pnum;
                    tracing::debug!(pnum, previous, ?key, "PEB supersedes older copy");
                    return Insertion::Superseded { previous };
                }
                current
            }
        };

        // Walk the history, newest first, to find the first copy older than this one
        let mut prev = current;
        while let Some(next) = self.nodes[prev].older {
            if leb_ver_newer(leb_ver, self.nodes[next].eb.vid.leb_ver) {
                break;
            }
            prev = next;
        }
        self.nodes[idx].older = self.nodes[prev].older.replace(idx);

        Insertion::History {
            current: self.nodes[current].eb.pnum,
        }
    }

    /// How many distinct LEBs have an authoritative copy
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// The PEB currently holding `vol_id:lnum`
    pub fn authoritative(&self, vol_id: u32, lnum: u32) -> Option<&ScannedEraseblock> {
        let idx = self.heads.get(&LebKey { vol_id, lnum })?;
        Some(&self.nodes[*idx].eb)
    }

    /// The superseded copies of `vol_id:lnum`, newest first
    pub fn history(&self, vol_id: u32, lnum: u32) -> impl Iterator<Item = &ScannedEraseblock> {
        let head = self.heads.get(&LebKey { vol_id, lnum }).copied();
        let first = head.and_then(|idx| self.nodes[idx].older);
        std::iter::successors(first, |&idx| self.nodes[idx].older).map(|idx| &self.nodes[idx].eb)
    }

    /// Every authoritative copy, ordered by volume ID and LEB number
    pub fn lebs(&self) -> impl Iterator<Item = &ScannedEraseblock> {
        self.heads.values().map(|&idx| &self.nodes[idx].eb)
    }

    /// The authoritative copies of one volume's LEBs, in LEB order
    pub fn volume_lebs(&self, vol_id: u32) -> impl Iterator<Item = &ScannedEraseblock> {
        let range = LebKey { vol_id, lnum: 0 }..=LebKey {
            vol_id,
            lnum: u32::MAX,
        };
        self.heads.range(range).map(|(_, &idx)| &self.nodes[idx].eb)
    }

    /// The IDs of all volumes with at least one LEB, in ascending order
    pub fn volume_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.heads.keys().map(|key| key.vol_id).collect();
        ids.dedup();
        ids
    }

    /// The PEBs that could not be trusted at all, in scan order
    pub fn rejected(&self) -> impl Iterator<Item = &ScannedEraseblock> {
        self.rejected.iter().map(|&idx| &self.nodes[idx].eb)
    }

    /// Write the contents of volume `vol_id` to `sink`, reading PEBs back through `reader`.
    ///
    /// Dynamic LEBs contribute their whole LEB size, static ones `data_size` bytes. A LEB missing
    /// from flash is handled as `policy` says.
    pub fn rebuild_volume<P, W>(
        &self,
        vol_id: u32,
        mut reader: P,
        sink: &mut W,
        policy: GapPolicy,
    ) -> Result<RebuildReport, ReconcileError>
    where
        P: PebReader,
        W: Write,
    {
        let last = self
            .volume_lebs(vol_id)
            .last()
            .ok_or(ReconcileError::VolumeNotFound(vol_id))?;

        let leb_count = match last.vid.vol_type {
            VolType::Static => std::cmp::max(last.vid.used_ebs, last.vid.lnum + 1),
            VolType::Dynamic => last.vid.lnum + 1,
        };

        let mut report = RebuildReport::default();
        let mut buf = Vec::with_capacity(last.leb_size(self.peb_size) as usize);
        for lnum in 0..leb_count {
            let eb = match self.authoritative(vol_id, lnum) {
                Some(eb) => eb,
                None => match policy {
                    GapPolicy::Fail => return Err(ReconcileError::MissingLeb { vol_id, lnum }),
                    GapPolicy::Pad => {
                        tracing::warn!(vol_id, lnum, "LEB missing, padding with erased bytes");
                        buf.clear();
                        buf.resize(self.gap_len(vol_id, lnum, last) as usize, ERASED_BYTE);
                        sink.write_all(&buf)?;
                        report.padded.push(lnum);
                        report.bytes += buf.len() as u64;
                        continue;
                    }
                },
            };

            buf.clear();
            buf.resize(eb.payload_len(self.peb_size) as usize, 0u8);
            reader
                .read_peb(eb.pnum, eb.data_offset, &mut buf)
                .map_err(|source| ReconcileError::ReadPeb {
                    pnum: eb.pnum,
                    vol_id,
                    lnum,
                    source,
                })?;
            sink.write_all(&buf)?;
            report.lebs += 1;
            report.bytes += buf.len() as u64;
        }

        Ok(report)
    }

    /// How many erased bytes stand in for missing LEB `vol_id:lnum`, given the volume's last LEB.
    ///
    /// A static LEB's size is only recorded in its own VID header, so a rejected copy with a sound
    /// header is the one place left to find it. Otherwise a whole LEB is assumed, which is exact
    /// for every static LEB but the final one.
    fn gap_len(&self, vol_id: u32, lnum: u32, last: &ScannedEraseblock) -> u32 {
        let leb_size = last.leb_size(self.peb_size);
        match last.vid.vol_type {
            VolType::Dynamic => leb_size,
            VolType::Static => {
                let key = LebKey { vol_id, lnum };
                self.rejected()
                    .find(|eb| eb.vid_ok && eb.key() == key)
                    .map_or(leb_size, |eb| eb.payload_len(self.peb_size))
            }
        }
    }

    /// Read back and decode the volume table from the layout volume.
    ///
    /// The first copy is preferred; the second is used if the first is missing or has any damaged
    /// record. If both are damaged, the first one is returned with its per-record errors.
    pub fn volume_table<P: PebReader>(&self, mut reader: P) -> Result<Vec<RecordSlot>, ReconcileError> {
        let mut fallback = None;
        for lnum in 0..2 {
            let Some(eb) = self.authoritative(UBI_LAYOUT_VOLUME_ID, lnum) else {
                continue;
            };

            let mut buf = vec![0u8; eb.leb_size(self.peb_size) as usize];
            reader
                .read_peb(eb.pnum, eb.data_offset, &mut buf)
                .map_err(|source| ReconcileError::ReadPeb {
                    pnum: eb.pnum,
                    vol_id: UBI_LAYOUT_VOLUME_ID,
                    lnum,
                    source,
                })?;

            let records = decode_table(&buf);
            if records.iter().all(|x| x.is_ok()) {
                return Ok(records);
            }
            tracing::warn!(pnum = eb.pnum, lnum, "volume table copy has damaged records");
            fallback.get_or_insert(records);
        }

        fallback.ok_or(ReconcileError::VolumeNotFound(UBI_LAYOUT_VOLUME_ID))
    }
}

/// Prints every LEB with the PEB holding it, followed by its history.
impl fmt::Display for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn line(f: &mut fmt::Formatter<'_>, eb: &ScannedEraseblock) -> fmt::Result {
            write!(f, "PEB {:5} ver {:#010x}", eb.pnum, eb.vid.leb_ver)?;
            if eb.vid.copy_flag {
                write!(f, " copy")?;
            }
            if !eb.data_ok {
                write!(f, " bad-data")?;
            }
            writeln!(f)
        }

        for (key, &idx) in &self.heads {
            write!(f, "vol {:#010x} LEB {:5}: ", key.vol_id, key.lnum)?;
            line(f, &self.nodes[idx].eb)?;
            for eb in self.history(key.vol_id, key.lnum) {
                write!(f, "{:>28}", "older: ")?;
                line(f, eb)?;
            }
        }

        for eb in self.rejected() {
            write!(f, "rejected: ")?;
            line(f, eb)?;
        }

        Ok(())
    }
}

/// The outcome of a successful [Reconciler::rebuild_volume]
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct RebuildReport {
    /// LEBs copied from flash
    pub lebs: u32,

    /// LEBs that were missing and replaced by erased bytes
    pub padded: Vec<u32>,

    /// Total bytes written to the sink
    pub bytes: u64,
}
