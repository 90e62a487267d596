//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

/// The byte value of erased flash.
pub const ERASED_BYTE: u8 = 0xFF;

pub trait ReadExt {
    /// Tries to read exactly `read_len` bytes, like `read_exact`, but unlike `read_exact`, is
    /// forgiving of unexpected EOF.
    ///
    /// The returned vector will have exactly `read_len` bytes appended, unless an EOF was
    /// encountered, in which case it will have strictly shorter than `read_len` new bytes added.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        const CHUNK_SIZE: usize = 65536;

        let read_len = read_len + vec.len();
        let mut cursor = vec.len();
        loop {
            if cursor == read_len {
                // All requested reading has been done.
                return Ok(());
            }

            // Make room for the next chunk
            vec.resize(std::cmp::min(read_len, cursor + CHUNK_SIZE), 0u8);

            // Perform the read, handle errors, and advance `cursor`
            cursor += match self.read(&mut vec[cursor..]) {
                // This is an EOF; it means the final read size is `cursor`
                Ok(0) => {
                    vec.truncate(cursor);
                    return Ok(());
                }

                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }
    }
}

/// Convenience methods for operating on `[u8]`s that represent flash contents
pub trait PageUtil {
    /// Does this region contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == ERASED_BYTE)
    }
}

/// Round `value` up to the next multiple of `align`.
pub(crate) fn round_up(value: u32, align: u32) -> Option<u32> {
    value.checked_add(align - 1).map(|x| x - x % align)
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    io::repeat(0xAA).read_to_vec(&mut vec, 4)?;
    assert_eq!(vec, [0xAA; 4]);
    io::repeat(0xBB).read_to_vec(&mut vec, 2)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB]);
    (&[1, 2, 3][..]).read_to_vec(&mut vec, 8)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_is_erased() {
    assert!([0xFFu8; 16][..].is_erased());
    assert!(![0xFF, 0xFF, 0xFE][..].is_erased());
    assert!([][..].is_erased());
}

#[test]
fn test_round_up() {
    assert_eq!(round_up(64, 2048), Some(2048));
    assert_eq!(round_up(2048, 2048), Some(2048));
    assert_eq!(round_up(2049, 512), Some(2560));
    assert_eq!(round_up(u32::MAX, 2), None);
}
