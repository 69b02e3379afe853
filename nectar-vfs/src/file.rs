use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use zip::ZipArchive;

/// How far past the requested offset a fill extends. Refilling restarts the
/// entry's decompression stream, so larger steps amortize repeated short
/// reads without inflating whole files for a small prefix.
const FILL_CHUNK: u64 = 32 * 1024;

/// An open file backed by a compressed zip entry.
///
/// Every open carries its own offset and a buffer that grows only as far as
/// reads demand, so concurrent opens of the same entry are independent.
pub struct ZipEntry {
    archive: Arc<Mutex<ZipArchive<File>>>,
    index: usize,
    size: u64,
    offset: u64,
    buf: Vec<u8>,
}

impl ZipEntry {
    pub(crate) fn new(archive: Arc<Mutex<ZipArchive<File>>>, index: usize, size: u64) -> Self {
        ZipEntry {
            archive,
            index,
            size,
            offset: 0,
            buf: Vec::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Extend the buffer so it covers at least `target` bytes of the entry.
    fn fill_to(&mut self, target: u64) -> io::Result<()> {
        let target = target.min(self.size);
        if (self.buf.len() as u64) >= target {
            return Ok(());
        }
        let goal = (target + FILL_CHUNK).min(self.size);

        let mut archive = self
            .archive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let reader = archive
            .by_index(self.index)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        // The decompression stream is sequential, so skip what we already
        // buffered and append the delta.
        let already = self.buf.len() as u64;
        let mut reader = reader;
        io::copy(&mut (&mut reader).take(already), &mut io::sink())?;
        (&mut reader)
            .take(goal - already)
            .read_to_end(&mut self.buf)?;
        Ok(())
    }

    pub fn read_at(&mut self, out: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let want = (out.len() as u64).min(self.size - offset) as usize;
        self.fill_to(offset + want as u64)?;
        let start = offset as usize;
        let end = (start + want).min(self.buf.len());
        let n = end.saturating_sub(start);
        out[..n].copy_from_slice(&self.buf[start..end]);
        Ok(n)
    }
}

impl Read for ZipEntry {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at_current(out)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl ZipEntry {
    fn read_at_current(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let offset = self.offset;
        self.read_at(out, offset)
    }
}

impl Seek for ZipEntry {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let next = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.offset as i64 + d,
            SeekFrom::End(d) => self.size as i64 + d,
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.offset = next as u64;
        Ok(self.offset)
    }
}

impl Write for ZipEntry {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "read-only filesystem",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
