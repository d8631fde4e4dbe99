//! RIFF container parser/composer.
//!
//! Walks or emits a tree of FOURCC chunks over a [`FileHandle`],
//! maintaining a stack of open chunks whose cursors track the file
//! position at all times. Used for DLS, SoundFont and other RIFF-shaped
//! instrument files.
//!
//! The engine is driven by format-specific readers and writers: it knows
//! chunk framing (headers, sizes, padding, nesting bounds), never chunk
//! semantics. Failures are sticky: after any error the status becomes
//! [`RiffStatus::Fail`] and every further operation reports
//! [`RiffError::EngineFailed`] until [`Riff::reset`].

use std::io::SeekFrom;

use anyhow::{Error, Result, bail};

use crate::file::{Endian, FileHandle};
use crate::utils::errors::RiffError;

/// Size of a chunk header (FOURCC id plus u32 size).
pub const HEADER_SIZE: u32 = 8;

/// Size of a FOURCC id.
pub const FOURCC_SIZE: u32 = 4;

/// Size of a list chunk header (header plus secondary FOURCC).
pub const LIST_HEADER_SIZE: u32 = HEADER_SIZE + FOURCC_SIZE;

/// Four character chunk identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

pub const FOURCC_RIFF: FourCc = FourCc(*b"RIFF");
pub const FOURCC_RIFX: FourCc = FourCc(*b"RIFX");
pub const FOURCC_LIST: FourCc = FourCc(*b"LIST");

impl FourCc {
    pub const fn new(bytes: &[u8; 4]) -> Self {
        FourCc(*bytes)
    }

    /// FOURCC bytes must be alphanumeric, with trailing space padding
    /// allowed after at least one non-space character.
    pub fn verify(&self) -> bool {
        let mut i = 0;
        while i < 4 && self.0[i].is_ascii_alphanumeric() {
            i += 1;
        }

        if i < 4 && i > 0 && self.0[i] == b' ' {
            while i < 4 && self.0[i] == b' ' {
                i += 1;
            }
        }

        i == 4
    }
}

impl std::fmt::Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FourCc({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Toplevel "RIFF" (or "RIFX") list chunk.
    Riff,
    /// A "LIST" chunk.
    List,
    /// Opaque sub chunk.
    Sub,
}

impl ChunkKind {
    pub const fn is_list(self) -> bool {
        matches!(self, ChunkKind::Riff | ChunkKind::List)
    }
}

/// An open chunk on the chunk stack.
#[derive(Debug, Clone, Copy)]
pub struct Chunk {
    pub kind: ChunkKind,
    /// Chunk id; the secondary FOURCC for list chunks.
    pub id: FourCc,
    /// Current cursor within the chunk payload.
    pub position: i64,
    /// Payload size in bytes, excluding the 8-byte header.
    pub size: u32,
    /// File offset of the chunk payload (the secondary FOURCC for lists).
    pub filepos: u64,
}

impl Chunk {
    /// Payload size rounded up to the even boundary chunks align to.
    pub fn padded_size(&self) -> u64 {
        (self.size as u64 + 1) & !1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiffStatus {
    /// Parsing has not yet begun.
    Begin,
    /// At least one chunk is open.
    Normal,
    /// The current chunk has no more children (or is a sub chunk).
    ChunkEnd,
    /// The toplevel chunk was closed.
    Finished,
    /// An error occurred; sticky until reset.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RiffMode {
    Read,
    Write,
}

/// RIFF parser/composer state machine.
pub struct Riff {
    status: RiffStatus,
    mode: RiffMode,
    handle: FileHandle,
    chunks: Vec<Chunk>,
    state_stack: Vec<Vec<Chunk>>,
    fail_msg: Option<String>,
}

impl Riff {
    pub fn new(handle: FileHandle) -> Self {
        Self {
            status: RiffStatus::Begin,
            mode: RiffMode::Read,
            handle,
            chunks: Vec::new(),
            state_stack: Vec::new(),
            fail_msg: None,
        }
    }

    pub fn status(&self) -> RiffStatus {
        self.status
    }

    /// Direct access to the underlying handle for payload reads/writes.
    /// Chunk cursors are resynchronized on the next engine operation.
    pub fn handle_mut(&mut self) -> &mut FileHandle {
        &mut self.handle
    }

    pub fn into_handle(self) -> FileHandle {
        self.handle
    }

    /// Number of open chunks.
    pub fn chunk_level(&self) -> usize {
        self.chunks.len()
    }

    /// Chunk at `level`, -1 for the innermost.
    pub fn chunk(&mut self, level: i32) -> Option<Chunk> {
        self.update_positions().ok()?;
        let index = if level == -1 {
            self.chunks.len().checked_sub(1)?
        } else {
            level as usize
        };
        self.chunks.get(index).copied()
    }

    /// Total size of the toplevel chunk including its header.
    pub fn total_size(&mut self) -> u32 {
        let _ = self.update_positions();
        self.chunks.first().map_or(0, |c| c.size + HEADER_SIZE)
    }

    /// Current offset within the toplevel chunk, including its header.
    pub fn position(&mut self) -> u32 {
        let _ = self.update_positions();
        self.chunks
            .first()
            .map_or(0, |c| c.position as u32 + HEADER_SIZE)
    }

    /// Reset to the pristine state, clearing any sticky failure.
    pub fn reset(&mut self) {
        self.status = RiffStatus::Begin;
        self.mode = RiffMode::Read;
        self.chunks.clear();
        self.fail_msg = None;
    }

    fn check_fail(&self) -> Result<()> {
        if self.status == RiffStatus::Fail {
            bail!(RiffError::EngineFailed(
                self.fail_msg.clone().unwrap_or_default()
            ));
        }
        Ok(())
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.status = RiffStatus::Fail;
        self.fail_msg = Some(err.to_string());
        Err(err)
    }

    /// Recompute every open chunk's cursor from the file position.
    fn update_positions(&mut self) -> Result<()> {
        if self.chunks.is_empty() {
            return Ok(());
        }

        let filepos = self.handle.position()?;
        for chunk in &mut self.chunks {
            chunk.position = filepos as i64 - chunk.filepos as i64;
        }
        Ok(())
    }

    /// Save the current chunk state and file position.
    pub fn push_state(&mut self) -> Result<()> {
        self.update_positions()?;
        self.state_stack.push(self.chunks.clone());
        Ok(())
    }

    /// Restore the most recently pushed state, seeking the file back to
    /// the saved position. A seek failure here is fatal.
    pub fn pop_state(&mut self) -> Result<()> {
        let Some(saved) = self.state_stack.pop() else {
            bail!(RiffError::EmptyStateStack);
        };

        self.chunks = saved;

        let pos = self
            .chunks
            .first()
            .map_or(0, |c| (c.filepos as i64 + c.position) as u64);

        match self.handle.seek(SeekFrom::Start(pos)) {
            Ok(_) => Ok(()),
            Err(err) => self.fail(err),
        }
    }

    /// Start parsing at the beginning of a RIFF file: reads the toplevel
    /// chunk, requires it to be "RIFF" or "RIFX" and configures the handle
    /// byte order accordingly.
    pub fn start_read(&mut self) -> Result<Chunk> {
        self.check_fail()?;
        self.reset();

        let Some(chunk) = self.read_chunk()? else {
            return self.fail(RiffError::NotRiff.into());
        };

        if chunk.kind != ChunkKind::Riff {
            self.chunks.clear();
            return self.fail(RiffError::NotRiff.into());
        }

        Ok(chunk)
    }

    /// Start parsing at an arbitrary chunk. The caller is responsible for
    /// the handle's byte order.
    pub fn start_read_chunk(&mut self) -> Result<Chunk> {
        self.check_fail()?;
        self.reset();

        match self.read_chunk()? {
            Some(chunk) => Ok(chunk),
            None => self.fail(RiffError::UnexpectedChunkEnd(FourCc(*b"????")).into()),
        }
    }

    /// Parse the next chunk header. Returns `None` when the current chunk
    /// has ended (status [`RiffStatus::ChunkEnd`]).
    pub fn read_chunk(&mut self) -> Result<Option<Chunk>> {
        self.check_fail()?;
        debug_assert_eq!(self.mode, RiffMode::Read);

        if matches!(self.status, RiffStatus::Finished | RiffStatus::ChunkEnd) {
            return Ok(None);
        }

        if !self.chunks.is_empty() {
            self.update_positions()?;
            let top = self.chunks.last().unwrap();

            if top.kind == ChunkKind::Sub || top.position >= top.size as i64 {
                self.status = RiffStatus::ChunkEnd;
                return Ok(None);
            }
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        if let Err(err) = self.handle.read(&mut header) {
            return self.fail(err);
        }

        let container_id = FourCc([header[0], header[1], header[2], header[3]]);

        if container_id == FOURCC_RIFF && !self.chunks.is_empty() {
            return self.fail(RiffError::NestedRiff.into());
        }

        let filepos = self.handle.position()?;

        let (kind, id, position) = if container_id == FOURCC_LIST
            || container_id == FOURCC_RIFF
            || container_id == FOURCC_RIFX
        {
            let kind = if container_id == FOURCC_LIST {
                ChunkKind::List
            } else {
                if container_id == FOURCC_RIFF {
                    self.handle.set_little_endian();
                } else {
                    self.handle.set_big_endian();
                }
                ChunkKind::Riff
            };

            let mut secondary = [0u8; FOURCC_SIZE as usize];
            if let Err(err) = self.handle.read(&mut secondary) {
                return self.fail(err);
            }
            (kind, FourCc(secondary), 4i64)
        } else {
            (ChunkKind::Sub, container_id, 0i64)
        };

        if !id.verify() {
            return self.fail(RiffError::InvalidId(id.0).into());
        }

        let size = match self.handle.endian() {
            Endian::Little => u32::from_le_bytes(header[4..8].try_into().unwrap()),
            Endian::Big => u32::from_be_bytes(header[4..8].try_into().unwrap()),
        };

        // list chunk sizes must be even; sub chunks may be odd (padded)
        if kind.is_list() && size % 2 != 0 {
            return self.fail(RiffError::OddSize { id, size }.into());
        }

        let padded = (size as u64 + 1) & !1;

        self.update_positions()?;

        // the new chunk's extent must fit inside every open ancestor
        let child_level = self.chunks.len();
        let exceeded = self
            .chunks
            .iter()
            .enumerate()
            .find(|(_, parent)| parent.position + padded as i64 - position > parent.size as i64)
            .map(|(level, parent)| RiffError::SizeExceeded {
                child: id,
                child_size: size,
                child_level,
                parent: parent.id,
                parent_size: parent.size,
                parent_level: level,
            });
        if let Some(err) = exceeded {
            return self.fail(err.into());
        }

        let chunk = Chunk {
            kind,
            id,
            position,
            size,
            filepos,
        };
        self.chunks.push(chunk);
        self.status = RiffStatus::Normal;

        Ok(Some(chunk))
    }

    /// Like [`Riff::read_chunk`] but requires the next chunk to match
    /// `kind` and `id`; running out of chunks is an error.
    pub fn read_chunk_verify(&mut self, kind: ChunkKind, id: FourCc) -> Result<Chunk> {
        self.check_fail()?;

        let Some(chunk) = self.read_chunk()? else {
            return self.fail(RiffError::UnexpectedChunkEnd(id).into());
        };

        if chunk.kind != kind || chunk.id != id {
            return self.fail(
                RiffError::UnexpectedId {
                    found: chunk.id,
                    expected: id,
                }
                .into(),
            );
        }

        Ok(chunk)
    }

    /// Open a new chunk for writing: emits a header with a zero size field
    /// that gets patched when the chunk is closed.
    pub fn write_chunk(&mut self, kind: ChunkKind, id: FourCc) -> Result<()> {
        self.check_fail()?;

        if !id.verify() {
            return self.fail(RiffError::InvalidId(id.0).into());
        }

        self.mode = RiffMode::Write;

        let mut header = Vec::with_capacity(LIST_HEADER_SIZE as usize);
        let position;

        if kind.is_list() {
            let container = if kind == ChunkKind::List {
                FOURCC_LIST
            } else if self.handle.endian() == Endian::Big {
                FOURCC_RIFX
            } else {
                FOURCC_RIFF
            };
            header.extend_from_slice(&container.0);
            header.extend_from_slice(&[0u8; 4]);
            header.extend_from_slice(&id.0);
            position = 4i64;
        } else {
            header.extend_from_slice(&id.0);
            header.extend_from_slice(&[0u8; 4]);
            position = 0i64;
        }

        if let Err(err) = self.handle.write(&header) {
            return self.fail(err);
        }

        self.update_positions()?;

        let filepos = self.handle.position()? - position as u64;
        self.chunks.push(Chunk {
            kind,
            id,
            position,
            size: position as u32,
            filepos,
        });

        Ok(())
    }

    pub fn write_list_chunk(&mut self, id: FourCc) -> Result<()> {
        self.write_chunk(ChunkKind::List, id)
    }

    pub fn write_sub_chunk(&mut self, id: FourCc) -> Result<()> {
        self.write_chunk(ChunkKind::Sub, id)
    }

    /// Close the chunk at `level` (-1 for the innermost) and all chunks
    /// inside it.
    ///
    /// In write mode the size fields of the closed chunks are patched and
    /// odd-sized chunks get a NUL pad byte; on success the file position
    /// is back where it was (after any pad). In read mode the file is
    /// positioned at the start of the next chunk and the status becomes
    /// [`RiffStatus::Normal`] or [`RiffStatus::Finished`].
    pub fn close_chunk(&mut self, level: i32) -> Result<()> {
        self.check_fail()?;

        if self.chunks.is_empty() {
            bail!(RiffError::InvalidLevel(level));
        }

        let level = if level == -1 {
            self.chunks.len() - 1
        } else {
            let level = level as usize;
            if level >= self.chunks.len() {
                bail!(RiffError::InvalidLevel(level as i32));
            }
            level
        };

        self.update_positions()?;

        if self.mode == RiffMode::Read {
            let chunk = self.chunks[level];
            let seek = chunk.padded_size() as i64 - chunk.position;

            self.chunks.truncate(level);

            if seek != 0 {
                if let Err(err) = self.handle.seek(SeekFrom::Current(seek)) {
                    return self.fail(err);
                }
                self.update_positions()?;
            }

            self.status = if level > 0 {
                RiffStatus::Normal
            } else {
                RiffStatus::Finished
            };

            return Ok(());
        }

        // write mode: patch sizes from innermost outwards, tracking the
        // net displacement so the original position can be restored with
        // one relative seek
        let mut offset: i64 = 0;
        let result = self.close_chunk_write(level, &mut offset);

        if offset != 0 {
            let restore = self.handle.seek(SeekFrom::Current(-offset));
            if let Err(err) = restore {
                if result.is_ok() {
                    return self.fail(err);
                }
            }
        }

        match result {
            Ok(()) => {
                self.chunks.truncate(level);
                Ok(())
            }
            Err(err) => self.fail(err),
        }
    }

    fn close_chunk_write(&mut self, level: usize, offset: &mut i64) -> Result<()> {
        for i in (level..self.chunks.len()).rev() {
            let size = self.chunks[i].position;
            if size < 0 {
                bail!(RiffError::InvalidLevel(i as i32));
            }

            // pad to even size; the pad byte is not counted in the size
            // but does advance every open chunk's cursor
            if self.chunks[i].position % 2 != 0 {
                self.handle.write(&[0u8])?;
                for chunk in &mut self.chunks[..=i] {
                    chunk.position += 1;
                }
            }

            let seek = -self.chunks[i].position - 4 - *offset;
            if seek != 0 {
                self.handle.seek(SeekFrom::Current(seek))?;
            }
            *offset += seek;

            self.handle.write_u32(size as u32)?;
            *offset += 4;

            self.chunks[i].size = size as u32;
        }

        Ok(())
    }

    /// Close the innermost chunk.
    pub fn end_chunk(&mut self) -> Result<()> {
        self.close_chunk(-1)
    }

    /// Skip `count` chunks at the current level.
    pub fn skip_chunks(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            if self.read_chunk()?.is_none() {
                bail!(RiffError::UnexpectedChunkEnd(FourCc(*b"????")));
            }
            self.close_chunk(-1)?;
        }
        Ok(())
    }

    /// Skip a single chunk.
    pub fn skip_chunk(&mut self) -> Result<()> {
        self.skip_chunks(1)
    }

    /// Produce a diagnostic message with the offset within the toplevel
    /// chunk and a parent trace of every open chunk.
    pub fn message_detail(&mut self, level: i32, msg: &str) -> String {
        let _ = self.update_positions();

        let level = if level == -1 {
            self.chunks.len() as i32 - 1
        } else {
            level
        };

        let riff_pos = self.chunks.first().map_or(0, |c| c.position);
        let mut detail = format!("{msg} (ofs={riff_pos:#x}, traceback [");

        if self.chunks.is_empty() {
            detail.push_str("<none>");
        } else {
            let mut i = level;
            while i >= 0 {
                let chunk = &self.chunks[i as usize];
                detail.push_str(&format!(
                    "'{}' ofs={:#X}, size={}{}",
                    chunk.id,
                    riff_pos - chunk.position,
                    chunk.size,
                    if i != 0 { " <= " } else { "" }
                ));
                i -= 1;
            }
        }

        detail.push_str("])");
        detail
    }
}
