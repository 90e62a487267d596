//! This module implements the on-flash format of UBI, in both directions: building images for
//! flashing, and reading raw images back into volumes.
//!
//! Every PEB UBI has touched starts with an "erase counter" ("EC") header, and if the PEB holds
//! data, a "volume ID" ("VID") header at a fixed offset further in:
//!
//! ```text
//! +- PEB ---------------------------------------------------------+
//! | EC hdr | (pad) | VID hdr | (pad) | LEB data ...     | data_pad |
//! +---------------------------------------------------------------+
//! 0        64      vid_hdr_offset    data_offset                  peb_size
//! ```
//!
//! The VID header maps the PEB to one LEB (`vol_id:lnum`) of a volume. Over time, several PEBs may
//! claim the same LEB; the LEB version in each VID header says which one is current. Volume
//! metadata (names, sizes, types) lives in the volume table, stored twice in the internal layout
//! volume.
//!
//! The pieces stack up as follows:
//! - [headers]: EC/VID header encoding, decoding, and CRC checks.
//! - [vtbl]: the volume table and its records.
//! - [ubinize]: image generation, one PEB at a time.
//! - [reconcile]: picking the current copy of every LEB and rebuilding volumes.
//! - [scan]: walking a raw image and feeding the reconciler.

pub mod headers;
pub mod reconcile;
pub mod scan;
pub mod source;
pub mod ubinize;
pub mod vtbl;

pub use headers::{Ec, HeaderError, Vid, VolType};
pub use reconcile::{leb_ver_newer, reconcile, GapPolicy, ReconcileError, Reconciler};
pub use scan::{scan_image, BlockContent, Ebt, ScanConfig, ScanError};
pub use source::{ImageReader, PebReader};
pub use ubinize::{generate, Actions, GenError, Geometry, ImageGenerator, Ubinizer, VolumeDescriptor};
pub use vtbl::{decode_table, encode_empty_table, max_records, TableError, VolumeTable};
