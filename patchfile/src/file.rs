//! Byte-oriented file handle with endian negotiation and a staging buffer.
//!
//! Every multi-byte integer read or written through the handle honors the
//! handle's endian mode, which the RIFF engine flips when it sees a "RIFX"
//! outer chunk. The staging buffer serves two purposes: readers prefetch a
//! header region with [`FileHandle::buf_load`] for cheap random access, and
//! writers assemble a region with `buf_write`/`buf_seek` before committing
//! it in one piece so header fields can be patched after the fact.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Result, bail};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::utils::errors::FileError;

pub trait FileIo: Read + Write + Seek + Send {}
impl<T: Read + Write + Seek + Send> FileIo for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

pub struct FileHandle {
    stream: Box<dyn FileIo>,
    endian: Endian,
    buf: Vec<u8>,
    buf_pos: usize,
    dirty: bool,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("endian", &self.endian)
            .field("buf_len", &self.buf.len())
            .field("buf_pos", &self.buf_pos)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl FileHandle {
    pub fn new<T: FileIo + 'static>(stream: T) -> Self {
        Self {
            stream: Box::new(stream),
            endian: Endian::Little,
            buf: Vec::new(),
            buf_pos: 0,
            dirty: false,
        }
    }

    /// Open an existing file for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(File::open(path)?))
    }

    /// Create (or truncate) a file for writing. The file stays readable so
    /// sample stores can be rebound to the written data afterwards.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(file))
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn set_little_endian(&mut self) {
        self.endian = Endian::Little;
    }

    pub fn set_big_endian(&mut self) {
        self.endian = Endian::Big;
    }

    pub fn read(&mut self, out: &mut [u8]) -> Result<()> {
        let mut got = 0;
        while got < out.len() {
            let n = self.stream.read(&mut out[got..])?;
            if n == 0 {
                bail!(FileError::ShortRead {
                    wanted: out.len(),
                    got,
                });
            }
            got += n;
        }
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        Ok(())
    }

    /// Seek the underlying stream. Rejected while staged writes have not
    /// been committed; a clean prefetch buffer is simply dropped.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        if self.dirty {
            bail!(FileError::DirtyBuffer);
        }
        self.buf_clear();
        Ok(self.stream.seek(pos)?)
    }

    pub fn skip(&mut self, bytes: i64) -> Result<u64> {
        self.seek(SeekFrom::Current(bytes))
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.stream.stream_position()?)
    }

    pub fn size(&mut self) -> Result<u64> {
        let pos = self.stream.stream_position()?;
        let end = self.stream.seek(SeekFrom::End(0))?;
        self.stream.seek(SeekFrom::Start(pos))?;
        Ok(end)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(&mut b)?;
        Ok(b[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read(&mut b)?;
        Ok(match self.endian {
            Endian::Little => LittleEndian::read_u16(&b),
            Endian::Big => BigEndian::read_u16(&b),
        })
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(&mut b)?;
        Ok(match self.endian {
            Endian::Little => LittleEndian::read_u32(&b),
            Endian::Big => BigEndian::read_u32(&b),
        })
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(&[val])
    }

    pub fn write_i8(&mut self, val: i8) -> Result<()> {
        self.write(&[val as u8])
    }

    pub fn write_u16(&mut self, val: u16) -> Result<()> {
        let mut b = [0u8; 2];
        match self.endian {
            Endian::Little => LittleEndian::write_u16(&mut b, val),
            Endian::Big => BigEndian::write_u16(&mut b, val),
        }
        self.write(&b)
    }

    pub fn write_i16(&mut self, val: i16) -> Result<()> {
        self.write_u16(val as u16)
    }

    pub fn write_u32(&mut self, val: u32) -> Result<()> {
        let mut b = [0u8; 4];
        match self.endian {
            Endian::Little => LittleEndian::write_u32(&mut b, val),
            Endian::Big => BigEndian::write_u32(&mut b, val),
        }
        self.write(&b)
    }

    pub fn write_i32(&mut self, val: i32) -> Result<()> {
        self.write_u32(val as u32)
    }

    /* ---- staging buffer ---- */

    /// Prefetch up to `len` bytes from the stream into the buffer for
    /// random access reads. Short reads near end of file are fine; the
    /// loaded length is returned.
    pub fn buf_load(&mut self, len: usize) -> Result<usize> {
        if self.dirty {
            bail!(FileError::DirtyBuffer);
        }
        self.buf.clear();
        self.buf.resize(len, 0);
        let mut got = 0;
        while got < len {
            let n = self.stream.read(&mut self.buf[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        self.buf.truncate(got);
        self.buf_pos = 0;
        Ok(got)
    }

    /// Reserve `len` zero bytes in the staging buffer at the cursor.
    pub fn buf_zero(&mut self, len: usize) {
        let end = self.buf_pos + len;
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        } else {
            self.buf[self.buf_pos..end].fill(0);
        }
        self.buf_pos = end;
        self.dirty = true;
    }

    pub fn buf_write(&mut self, data: &[u8]) {
        let end = self.buf_pos + data.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.buf_pos..end].copy_from_slice(data);
        self.buf_pos = end;
        self.dirty = true;
    }

    pub fn buf_write_u8(&mut self, val: u8) {
        self.buf_write(&[val]);
    }

    pub fn buf_write_i8(&mut self, val: i8) {
        self.buf_write(&[val as u8]);
    }

    pub fn buf_write_u16(&mut self, val: u16) {
        let mut b = [0u8; 2];
        match self.endian {
            Endian::Little => LittleEndian::write_u16(&mut b, val),
            Endian::Big => BigEndian::write_u16(&mut b, val),
        }
        self.buf_write(&b);
    }

    pub fn buf_write_i16(&mut self, val: i16) {
        self.buf_write_u16(val as u16);
    }

    pub fn buf_write_u32(&mut self, val: u32) {
        let mut b = [0u8; 4];
        match self.endian {
            Endian::Little => LittleEndian::write_u32(&mut b, val),
            Endian::Big => BigEndian::write_u32(&mut b, val),
        }
        self.buf_write(&b);
    }

    pub fn buf_read(&mut self, out: &mut [u8]) -> Result<()> {
        let end = self.buf_pos + out.len();
        if end > self.buf.len() {
            bail!(FileError::BufRange {
                pos: self.buf_pos,
                len: self.buf.len(),
            });
        }
        out.copy_from_slice(&self.buf[self.buf_pos..end]);
        self.buf_pos = end;
        Ok(())
    }

    pub fn buf_read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.buf_read(&mut b)?;
        Ok(b[0])
    }

    pub fn buf_read_i8(&mut self) -> Result<i8> {
        Ok(self.buf_read_u8()? as i8)
    }

    pub fn buf_read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.buf_read(&mut b)?;
        Ok(match self.endian {
            Endian::Little => LittleEndian::read_u16(&b),
            Endian::Big => BigEndian::read_u16(&b),
        })
    }

    pub fn buf_read_i16(&mut self) -> Result<i16> {
        Ok(self.buf_read_u16()? as i16)
    }

    pub fn buf_read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.buf_read(&mut b)?;
        Ok(match self.endian {
            Endian::Little => LittleEndian::read_u32(&b),
            Endian::Big => BigEndian::read_u32(&b),
        })
    }

    /// Move the cursor within the staging buffer only.
    pub fn buf_seek(&mut self, pos: SeekFrom) -> Result<usize> {
        let new = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(n) => self.buf_pos as i64 + n,
            SeekFrom::End(n) => self.buf.len() as i64 + n,
        };
        if new < 0 {
            bail!(FileError::BufRange {
                pos: self.buf_pos,
                len: self.buf.len(),
            });
        }
        self.buf_pos = new as usize;
        Ok(self.buf_pos)
    }

    pub fn buf_position(&self) -> usize {
        self.buf_pos
    }

    /// Truncate or zero-extend the staging buffer.
    pub fn buf_set_size(&mut self, len: usize) {
        self.buf.resize(len, 0);
        if self.buf_pos > len {
            self.buf_pos = len;
        }
        self.dirty = true;
    }

    /// Flush the staging buffer to the stream at the current file position
    /// and advance past it.
    pub fn buf_commit(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.stream.write_all(&self.buf)?;
        }
        self.buf_clear();
        Ok(())
    }

    pub fn buf_clear(&mut self) {
        self.buf.clear();
        self.buf_pos = 0;
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn typed_reads_honor_endian_mode() -> Result<()> {
        let mut handle = FileHandle::new(Cursor::new(vec![0x12, 0x34, 0x56, 0x78]));

        assert_eq!(handle.read_u16()?, 0x3412);
        handle.seek(SeekFrom::Start(0))?;

        handle.set_big_endian();
        assert_eq!(handle.read_u32()?, 0x12345678);
        Ok(())
    }

    #[test]
    fn staged_writes_commit_in_one_piece() -> Result<()> {
        let mut handle = FileHandle::new(Cursor::new(Vec::new()));

        handle.buf_zero(8);
        handle.buf_seek(SeekFrom::Start(4))?;
        handle.buf_write_u32(0xAABBCCDD);
        handle.buf_seek(SeekFrom::Start(0))?;
        handle.buf_write_u16(0x1122);
        handle.buf_commit()?;

        handle.seek(SeekFrom::Start(0))?;
        let mut out = [0u8; 8];
        handle.read(&mut out)?;
        assert_eq!(out, [0x22, 0x11, 0, 0, 0xDD, 0xCC, 0xBB, 0xAA]);
        Ok(())
    }

    #[test]
    fn seek_rejected_with_dirty_buffer() {
        let mut handle = FileHandle::new(Cursor::new(Vec::new()));

        handle.buf_write_u8(1);
        assert!(handle.seek(SeekFrom::Start(0)).is_err());

        handle.buf_commit().unwrap();
        assert!(handle.seek(SeekFrom::Start(0)).is_ok());
    }

    #[test]
    fn buf_load_allows_short_reads() -> Result<()> {
        let mut handle = FileHandle::new(Cursor::new(vec![1u8, 2, 3]));

        assert_eq!(handle.buf_load(64)?, 3);
        assert_eq!(handle.buf_read_u16()?, 0x0201);
        assert!(handle.buf_read_u16().is_err());
        Ok(())
    }
}
