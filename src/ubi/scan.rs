//! This module contains code to scan a raw image PEB by PEB, determine each PEB's contents (per
//! UBI), and hand every PEB carrying a VID header to a [Reconciler].

use super::headers::*;
use super::reconcile::{Reconciler, ScannedEraseblock};
use super::ubinize::Geometry;
use crate::util::{PageUtil, ReadExt};

use thiserror::Error;

use std::collections::BTreeSet;
use std::fmt;
use std::io::{self, Read};

/// These are the states that a given PEB may be detected in
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockContent {
    /// The PEB is bad, and cannot be accessed
    Bad,

    /// The PEB is fully erased, perhaps because UBI has never used it
    Erased,

    /// The PEB is erased, but has a UBI EC header that should be preserved
    EcErased(Ec),

    /// The PEB is in normal use, with a UBI EC header and (if it decoded) a VID header
    EcData(Ec, Option<Vid>),

    /// The PEB's EC header is damaged, but the VID header where one is expected is intact
    RawVid(Vid),

    /// The PEB is in some other (invalid, per UBI) state, and needs to be erased
    Garbage,
}

/// The (E)rase(b)lock (t)able. A map of the state of every PEB as determined by [scan_image].
pub type Ebt = Box<[BlockContent]>;

/// Describes the flash behind the byte stream to be scanned.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScanConfig {
    peb_size: u32,
    peb_count: Option<u32>,
    bad_blocks: BTreeSet<u32>,
    offsets: Option<(u32, u32)>,
}

impl ScanConfig {
    pub fn new(peb_size: u32) -> Self {
        Self {
            peb_size,
            peb_count: None,
            bad_blocks: BTreeSet::new(),
            offsets: None,
        }
    }

    /// Take PEB size and header offsets from a known [Geometry], instead of learning the offsets
    /// from the first good EC header.
    pub fn from_geometry(geometry: &Geometry) -> Self {
        Self::new(geometry.peb_size()).offsets(geometry.get_vid_hdr_offset(), geometry.data_offset())
    }

    /// Expect this many PEBs; only used to size the progress report.
    pub fn peb_count(mut self, count: u32) -> Self {
        self.peb_count = Some(count);
        self
    }

    /// Mark a PEB as bad, so its contents are never looked at.
    pub fn bad_block(mut self, pnum: u32) -> Self {
        self.bad_blocks.insert(pnum);
        self
    }

    /// Preset the VID header and data offsets.
    pub fn offsets(mut self, vid_hdr_offset: u32, data_offset: u32) -> Self {
        self.offsets = Some((vid_hdr_offset, data_offset));
        self
    }

    pub fn peb_size(&self) -> u32 {
        self.peb_size
    }

    /// Can these offsets describe a PEB of this size?
    fn offsets_fit(&self, (vid_hdr_offset, data_offset): (u32, u32)) -> bool {
        let vid_end = vid_hdr_offset as u64 + UBI_VID_HDR_SIZE as u64;
        vid_hdr_offset >= UBI_EC_HDR_SIZE as u32
            && vid_end <= data_offset as u64
            && data_offset < self.peb_size
    }
}

/// Kinds of format errors found while scanning
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum IssueKind {
    EcHeader(HeaderError),
    VidHeader(HeaderError),

    /// The EC header names offsets other than the ones the rest of the flash uses
    InconsistentOffsets { vid_hdr_offset: u32, data_offset: u32 },

    /// The data doesn't match the CRC in the VID header
    DataCrc,

    /// The stream ended partway through the PEB
    TruncatedPeb { got: usize },
}

/// A format error found at a given place on flash.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct ScanIssue {
    pub pnum: u32,

    /// Offset of the damaged structure within the PEB
    pub offset: u32,

    pub kind: IssueKind,
}

impl fmt::Display for ScanIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PEB {} offset {:#x}: ", self.pnum, self.offset)?;
        match self.kind {
            IssueKind::EcHeader(e) => write!(f, "bad EC header: {e}"),
            IssueKind::VidHeader(e) => write!(f, "bad VID header: {e}"),
            IssueKind::InconsistentOffsets {
                vid_hdr_offset,
                data_offset,
            } => write!(
                f,
                "EC header has unexpected offsets (VID {vid_hdr_offset:#x}, data {data_offset:#x})"
            ),
            IssueKind::DataCrc => write!(f, "data CRC mismatch"),
            IssueKind::TruncatedPeb { got } => write!(f, "image ends after {got} bytes of PEB"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid scan configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("I/O error at PEB {pnum}: {source}")]
    Io {
        pnum: u32,
        #[source]
        source: io::Error,
    },
}

/// Everything learned from one pass over the flash
#[derive(Debug)]
pub struct Scan {
    pub ebt: Ebt,
    pub issues: Vec<ScanIssue>,
    pub reconciler: Reconciler,

    /// The VID header and data offsets in effect, if any PEB revealed them
    pub offsets: Option<(u32, u32)>,
}

/// Per-scan state, carried from one PEB to the next
struct Scanner<'a> {
    config: &'a ScanConfig,
    offsets: Option<(u32, u32)>,
    issues: Vec<ScanIssue>,
    reconciler: Reconciler,
}

impl Scanner<'_> {
    fn issue(&mut self, pnum: u32, offset: u32, kind: IssueKind) {
        let issue = ScanIssue { pnum, offset, kind };
        tracing::warn!(pnum, offset, ?kind, "{issue}");
        self.issues.push(issue);
    }

    /// Characterize one PEB's content, feeding the reconciler as a side effect
    fn scan_peb(&mut self, pnum: u32, buf: &[u8]) -> BlockContent {
        if buf.is_erased() {
            return BlockContent::Erased;
        }

        let ec = match Ec::decode(buf) {
            Ok(ec) => ec,
            Err(e) => {
                self.issue(pnum, 0, IssueKind::EcHeader(e));
                return self.scan_headless(pnum, buf);
            }
        };

        let offsets = (ec.vid_hdr_offset, ec.data_offset);
        match self.offsets {
            None if self.config.offsets_fit(offsets) => {
                tracing::debug!(pnum, ?offsets, "learned header offsets");
                self.offsets = Some(offsets);
            }
            Some(expected) if expected == offsets => {}
            _ => {
                self.issue(
                    pnum,
                    0,
                    IssueKind::InconsistentOffsets {
                        vid_hdr_offset: ec.vid_hdr_offset,
                        data_offset: ec.data_offset,
                    },
                );
                return BlockContent::EcData(ec, None);
            }
        }

        let (vid_hdr_offset, data_offset) = offsets;
        let vid_bytes = &buf[vid_hdr_offset as usize..][..UBI_VID_HDR_SIZE];
        if vid_bytes.is_erased() {
            return match buf[UBI_EC_HDR_SIZE..].is_erased() {
                true => BlockContent::EcErased(ec),
                false => BlockContent::EcData(ec, None),
            };
        }

        let vid = match Vid::decode(vid_bytes) {
            Ok(vid) => vid,
            Err(e) => {
                self.issue(pnum, vid_hdr_offset, IssueKind::VidHeader(e));
                self.reconciler.insert(ScannedEraseblock {
                    pnum,
                    ec,
                    vid: Vid::default(),
                    ec_ok: true,
                    vid_ok: false,
                    data_ok: false,
                    data_offset,
                });
                return BlockContent::EcData(ec, None);
            }
        };

        let data_ok = self.check_data(pnum, &vid, buf, data_offset);
        self.reconciler.insert(ScannedEraseblock {
            pnum,
            ec,
            vid,
            ec_ok: true,
            vid_ok: true,
            data_ok,
            data_offset,
        });

        BlockContent::EcData(ec, Some(vid))
    }

    /// A PEB without a usable EC header can still hold a good VID header at the usual place.
    fn scan_headless(&mut self, pnum: u32, buf: &[u8]) -> BlockContent {
        let Some((vid_hdr_offset, data_offset)) = self.offsets else {
            return BlockContent::Garbage;
        };

        let Ok(vid) = Vid::decode(&buf[vid_hdr_offset as usize..]) else {
            return BlockContent::Garbage;
        };

        let data_ok = self.check_data(pnum, &vid, buf, data_offset);
        self.reconciler.insert(ScannedEraseblock {
            pnum,
            ec: Ec::default(),
            vid,
            ec_ok: false,
            vid_ok: true,
            data_ok,
            data_offset,
        });

        BlockContent::RawVid(vid)
    }

    fn check_data(&mut self, pnum: u32, vid: &Vid, buf: &[u8], data_offset: u32) -> bool {
        if !vid.tracks_data() {
            return true;
        }

        let ok = vid.check_data(&buf[data_offset as usize..]);
        if !ok {
            self.issue(pnum, data_offset, IssueKind::DataCrc);
        }
        ok
    }
}

/// Read PEBs from `reader` until it runs out, returning the [Ebt], every format error found, and
/// the reconciled LEBs.
///
/// Format errors never stop the scan; only I/O errors do.
pub fn scan_image<R: Read>(mut reader: R, config: &ScanConfig) -> Result<Scan, ScanError> {
    let peb_size = config.peb_size as usize;
    if peb_size < UBI_EC_HDR_SIZE + UBI_VID_HDR_SIZE {
        return Err(ScanError::InvalidConfig("PEB size too small for UBI headers"));
    }
    if let Some(offsets) = config.offsets {
        if !config.offsets_fit(offsets) {
            return Err(ScanError::InvalidConfig("header offsets don't fit in a PEB"));
        }
    }

    let mut scanner = Scanner {
        config,
        offsets: config.offsets,
        issues: Vec::new(),
        reconciler: Reconciler::new(config.peb_size),
    };

    let rpt = howudoin::new()
        .label("Scanning blocks")
        .set_len(config.peb_count.map(u64::from));

    let mut ebt = Vec::new();
    let mut buf = Vec::with_capacity(peb_size);
    for pnum in 0.. {
        buf.clear();
        reader
            .read_to_vec(&mut buf, peb_size)
            .map_err(|source| ScanError::Io { pnum, source })?;

        match buf.len() {
            0 => break,
            got if got < peb_size => {
                scanner.issue(pnum, 0, IssueKind::TruncatedPeb { got });
                break;
            }
            _ => {}
        }

        let content = match config.bad_blocks.contains(&pnum) {
            true => BlockContent::Bad,
            false => scanner.scan_peb(pnum, &buf),
        };
        ebt.push(content);
        rpt.inc();
    }

    rpt.close();

    Ok(Scan {
        ebt: ebt.into(),
        issues: scanner.issues,
        reconciler: scanner.reconciler,
        offsets: scanner.offsets,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ubi::ubinize::{generate, Actions, VolumeDescriptor};

    use std::num::NonZeroU32;

    fn test_geometry() -> Geometry {
        Geometry::new(1152, NonZeroU32::new(64).unwrap()).unwrap()
    }

    #[test]
    fn test_scan_states() -> anyhow::Result<()> {
        let geometry = test_geometry();
        let descriptor = VolumeDescriptor::new(VolType::Static).id(3).size(2048);
        let mut generator = generate(geometry, &descriptor, std::io::repeat(0x5A))?;

        let good = generator.emit_next_leb(Actions::NO_ERROR)?;
        let bad_data = generator.emit_next_leb(Actions::BROKEN_DATA_CRC)?;

        let ec = geometry.ec_header(7);
        let mut ec_only = vec![0xFF; 1152];
        ec.encode(&mut ec_only)?;

        let mut headless = good.data.to_vec();
        headless[10] ^= 0x40;

        let mut garbage = vec![0xFF; 1152];
        garbage[500] = 0;

        let mut unaligned = ec_only.clone();
        let ec_elsewhere = Ec {
            vid_hdr_offset: 512,
            data_offset: 576,
            ..ec
        };
        ec_elsewhere.encode(&mut unaligned)?;

        let pebs: [&[u8]; 7] = [
            &good.data,
            &vec![0xFF; 1152],
            &ec_only,
            &bad_data.data,
            &headless,
            &garbage,
            &unaligned,
        ];
        let image: Vec<u8> = pebs.concat();
        let config = ScanConfig::new(1152).bad_block(5).peb_count(7);
        let scan = scan_image(&image[..], &config)?;

        assert_eq!(
            scan.ebt[..],
            [
                BlockContent::EcData(good.ec, Some(good.vid)),
                BlockContent::Erased,
                BlockContent::EcErased(ec),
                BlockContent::EcData(bad_data.ec, Some(bad_data.vid)),
                BlockContent::RawVid(good.vid),
                BlockContent::Bad,
                BlockContent::EcData(ec_elsewhere, None),
            ]
        );
        assert_eq!(scan.offsets, Some((64, 128)));

        let kinds: Vec<_> = scan.issues.iter().map(|x| (x.pnum, x.kind)).collect();
        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds[0], (3, IssueKind::DataCrc));
        assert!(matches!(kinds[1], (4, IssueKind::EcHeader(e)) if e.is_crc()));
        assert_eq!(
            kinds[2],
            (
                6,
                IssueKind::InconsistentOffsets {
                    vid_hdr_offset: 512,
                    data_offset: 576
                }
            )
        );

        // PEB 4 carries the same LEB as PEB 0, and loses the tie
        let r = &scan.reconciler;
        assert_eq!(r.authoritative(3, 0).map(|x| x.pnum), Some(0));
        assert_eq!(r.history(3, 0).map(|x| x.pnum).collect::<Vec<_>>(), [4]);
        assert_eq!(r.authoritative(3, 1).map(|x| (x.pnum, x.data_ok)), Some((3, false)));

        Ok(())
    }

    #[test]
    fn test_bad_vid_header() -> anyhow::Result<()> {
        let geometry = test_geometry();
        let descriptor = VolumeDescriptor::new(VolType::Dynamic).id(0).size(1024);
        let peb = generate(geometry, &descriptor, std::io::repeat(0))?
            .emit_next_leb(Actions::BROKEN_HDR_CRC)?;

        let scan = scan_image(&peb.data[..], &ScanConfig::from_geometry(&geometry))?;
        assert_eq!(scan.ebt[..], [BlockContent::EcData(peb.ec, None)]);
        assert_eq!(scan.issues.len(), 1);
        assert_eq!(scan.issues[0].offset, 64);
        assert!(matches!(scan.issues[0].kind, IssueKind::VidHeader(e) if e.is_crc()));
        assert!(scan.reconciler.is_empty());
        assert_eq!(scan.reconciler.rejected().count(), 1);

        Ok(())
    }

    #[test]
    fn test_truncated() -> anyhow::Result<()> {
        let image = vec![0xFF; 1152 + 100];
        let scan = scan_image(&image[..], &ScanConfig::new(1152))?;
        assert_eq!(scan.ebt[..], [BlockContent::Erased]);
        assert_eq!(
            scan.issues,
            [ScanIssue {
                pnum: 1,
                offset: 0,
                kind: IssueKind::TruncatedPeb { got: 100 }
            }]
        );
        assert_eq!(
            scan.issues[0].to_string(),
            "PEB 1 offset 0x0: image ends after 100 bytes of PEB"
        );

        assert!(matches!(
            scan_image(&image[..], &ScanConfig::new(64)),
            Err(ScanError::InvalidConfig(_))
        ));
        assert!(matches!(
            scan_image(&image[..], &ScanConfig::new(1152).offsets(64, 1152)),
            Err(ScanError::InvalidConfig(_))
        ));

        Ok(())
    }
}
