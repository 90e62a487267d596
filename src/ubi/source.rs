//! Random access to PEB contents, for rebuilding volumes after a scan.

use super::ubinize::Peb;

use std::io::{self, Read, Seek, SeekFrom};

/// Something PEB contents can be re-read from, by PEB number
pub trait PebReader {
    /// Fill `buf` with the bytes found `offset` bytes into PEB `pnum`
    fn read_peb(&mut self, pnum: u32, offset: u32, buf: &mut [u8]) -> io::Result<()>;
}

impl<T: PebReader + ?Sized> PebReader for &mut T {
    fn read_peb(&mut self, pnum: u32, offset: u32, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_peb(pnum, offset, buf)
    }
}

/// A raw image (or a device node) laid out as consecutive PEBs
#[derive(Debug)]
pub struct ImageReader<R> {
    inner: R,
    peb_size: u32,
}

impl<R: Read + Seek> ImageReader<R> {
    pub fn new(inner: R, peb_size: u32) -> Self {
        Self { inner, peb_size }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> PebReader for ImageReader<R> {
    fn read_peb(&mut self, pnum: u32, offset: u32, buf: &mut [u8]) -> io::Result<()> {
        if u64::from(offset) + buf.len() as u64 > u64::from(self.peb_size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("read past the end of PEB {pnum}"),
            ));
        }

        let pos = u64::from(pnum) * u64::from(self.peb_size) + u64::from(offset);
        self.inner.seek(SeekFrom::Start(pos))?;
        self.inner.read_exact(buf)
    }
}

/// Generated PEBs, still in memory, numbered by position
impl PebReader for [Peb] {
    fn read_peb(&mut self, pnum: u32, offset: u32, buf: &mut [u8]) -> io::Result<()> {
        let src = self
            .get(pnum as usize)
            .and_then(|peb| peb.data.get(offset as usize..)?.get(..buf.len()))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("PEB {pnum} is not available"),
                )
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

#[test]
fn test_image_reader() -> io::Result<()> {
    let image: Vec<u8> = (0..4u8).flat_map(|x| [x; 16]).collect();
    let mut reader = ImageReader::new(io::Cursor::new(image), 16);

    let mut buf = [0u8; 4];
    reader.read_peb(2, 12, &mut buf)?;
    assert_eq!(buf, [2; 4]);

    assert!(reader.read_peb(2, 13, &mut buf).is_err());
    assert!(reader.read_peb(4, 0, &mut buf).is_err());
    Ok(())
}
