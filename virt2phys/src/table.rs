// Fixed-size record tables keyed by page index (pagemap, kpageflags).

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::RECORD_SIZE;

/// Anything that can be read at an explicit byte offset without a cursor.
pub trait PositionalRead {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl PositionalRead for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        FileExt::read_at(self, buf, offset)
    }
}

impl PositionalRead for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len() as u64 {
            return Ok(0);
        }
        let available = &self[offset as usize..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }
}

impl PositionalRead for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }
}

pub fn record_offset(page_index: u64) -> u64 {
    page_index.wrapping_mul(RECORD_SIZE as u64)
}

pub enum Fetch {
    Record([u8; RECORD_SIZE]),
    /// Fewer bytes than a record and no error: past the end of the table.
    Short(usize),
}

pub struct RecordTable<R> {
    source: R,
    path: PathBuf,
}

impl RecordTable<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        // This is why we need to run the program as root
        let file = File::open(path).map_err(|e| Error::resource(path.display().to_string(), e))?;
        Ok(RecordTable::new(file, path))
    }
}

impl<R: PositionalRead> RecordTable<R> {
    pub fn new<P: Into<PathBuf>>(source: R, path: P) -> Self {
        RecordTable {
            source,
            path: path.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &R {
        &self.source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One positional read of a whole record. A real I/O error comes back as
    /// `MalformedRecord`; a clean short read is `Fetch::Short`.
    pub fn fetch(&self, page_index: u64) -> Result<Fetch> {
        let offset = record_offset(page_index);
        let mut buf = [0u8; RECORD_SIZE];
        match self.source.read_at(&mut buf, offset) {
            Ok(n) if n == RECORD_SIZE => Ok(Fetch::Record(buf)),
            Ok(n) => Ok(Fetch::Short(n)),
            Err(source) => Err(Error::MalformedRecord {
                offset: Some(offset),
                len: 0,
                source: Some(source),
            }),
        }
    }
}
