//! Reading and writing UBI flash images.
//!
//! See [ubi] for an overview of the format.

pub mod ubi;
pub mod util;
