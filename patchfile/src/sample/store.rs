//! Sample storage back ends.
//!
//! A store exposes a uniform frame-oriented read/write surface over audio
//! data living in RAM, in a byte range of a file, or computed from edit
//! lists (the virtual store). Reads and writes operate in the store's
//! declared format; callers wanting another format go through
//! [`SampleReader`] or [`SampleStore::duplicate`], which route through the
//! transform engine.

use std::io::SeekFrom;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Result, bail, ensure};

use crate::file::FileHandle;
use crate::sample::list::SampleList;
use crate::sample::transform::Transform;
use crate::sample::{ChannelMap, SampleFormat, UNITY_CHANNEL_MAP, pool};
use crate::utils::errors::StoreError;

pub struct SampleStore {
    format: SampleFormat,
    size: usize,
    rate: u32,
    backend: Backend,
}

enum Backend {
    /// format, size and rate are fixed at construction and read without
    /// synchronization; only the sample data itself sits behind the lock.
    Ram(RwLock<Vec<u8>>),
    File {
        handle: Arc<Mutex<FileHandle>>,
        offset: u64,
    },
    Virtual(Vec<SampleList>),
}

impl std::fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backend {
            Backend::Ram(_) => "ram",
            Backend::File { .. } => "file",
            Backend::Virtual(_) => "virtual",
        };
        f.debug_struct("SampleStore")
            .field("backend", &kind)
            .field("format", &self.format)
            .field("size", &self.size)
            .field("rate", &self.rate)
            .finish()
    }
}

impl SampleStore {
    /// RAM store of `size` zero frames. The data buffer is allocated on
    /// first write; reads before that yield silence.
    pub fn new_ram(format: SampleFormat, size: usize, rate: u32) -> Self {
        Self {
            format,
            size,
            rate,
            backend: Backend::Ram(RwLock::new(Vec::new())),
        }
    }

    /// RAM store taking ownership of existing sample data.
    pub fn from_data(format: SampleFormat, rate: u32, data: Vec<u8>) -> Self {
        let size = data.len() / format.frame_size();
        Self {
            format,
            size,
            rate,
            backend: Backend::Ram(RwLock::new(data)),
        }
    }

    /// Store backed by a byte range of a file starting at `offset`.
    pub fn new_file(
        handle: Arc<Mutex<FileHandle>>,
        offset: u64,
        format: SampleFormat,
        size: usize,
        rate: u32,
    ) -> Self {
        Self {
            format,
            size,
            rate,
            backend: Backend::File { handle, offset },
        }
    }

    /// Virtual store rendering one edit list per output channel. All lists
    /// must cover the same number of frames.
    pub fn new_virtual(format: SampleFormat, rate: u32, lists: Vec<SampleList>) -> Result<Self> {
        ensure!(
            lists.len() == format.channels(),
            "virtual store needs one list per channel ({} != {})",
            lists.len(),
            format.channels()
        );

        let size = lists[0].size();
        for (chan, list) in lists.iter().enumerate() {
            ensure!(
                list.size() == size,
                "virtual store list {chan} covers {} frames, expected {size}",
                list.size()
            );
        }

        Ok(Self {
            format,
            size,
            rate,
            backend: Backend::Virtual(lists),
        })
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Frame count.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    fn check_range(&self, offset: usize, frames: usize) -> Result<()> {
        if offset + frames > self.size {
            bail!(StoreError::OutOfRange {
                offset,
                end: offset + frames,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Read `frames` frames starting at `offset` into `out`, in the
    /// store's declared format.
    pub fn read(&self, offset: usize, frames: usize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, frames)?;
        let frame_size = self.format.frame_size();
        let byte_len = frames * frame_size;
        ensure!(out.len() >= byte_len, "read buffer too small");

        match &self.backend {
            Backend::Ram(data) => {
                let data = data.read().unwrap();
                let start = offset * frame_size;
                if data.is_empty() {
                    out[..byte_len].fill(0);
                } else {
                    out[..byte_len].copy_from_slice(&data[start..start + byte_len]);
                }
            }
            Backend::File {
                handle,
                offset: base,
            } => {
                let mut handle = handle.lock().unwrap();
                handle.seek(SeekFrom::Start(base + (offset * frame_size) as u64))?;
                handle.read(&mut out[..byte_len])?;
            }
            Backend::Virtual(lists) => {
                self.read_virtual(lists, offset, frames, out)?;
            }
        }

        Ok(())
    }

    fn read_virtual(
        &self,
        lists: &[SampleList],
        offset: usize,
        frames: usize,
        out: &mut [u8],
    ) -> Result<()> {
        let channels = self.format.channels();
        let sample_size = self.format.sample_size();
        let mono_format = self.format.with_channels(1);

        for (chan, list) in lists.iter().enumerate() {
            for (segment, src_offset, run_frames, dest_pos) in list.resolve(offset, frames) {
                let src_format = segment.store.format();

                let mut raw = vec![0u8; run_frames * src_format.frame_size()];
                segment.store.read(src_offset, run_frames, &mut raw)?;

                let map = ChannelMap::from_bits(segment.channel.index() as u32);
                let mut transform = pool::acquire(src_format, mono_format, map)?;
                let mut mono = vec![0u8; run_frames * mono_format.frame_size()];
                transform.convert(&raw, &mut mono, run_frames)?;
                pool::release(transform);

                // scatter the mono run into this store's channel lane
                for frame in 0..run_frames {
                    let src = frame * sample_size;
                    let dst = ((dest_pos + frame) * channels + chan) * sample_size;
                    out[dst..dst + sample_size].copy_from_slice(&mono[src..src + sample_size]);
                }
            }
        }

        Ok(())
    }

    /// Write `frames` frames starting at `offset`, in the store's declared
    /// format. Virtual stores are read only.
    pub fn write(&self, offset: usize, frames: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, frames)?;
        let frame_size = self.format.frame_size();
        let byte_len = frames * frame_size;
        ensure!(data.len() >= byte_len, "write buffer too small");

        match &self.backend {
            Backend::Ram(buf) => {
                let mut buf = buf.write().unwrap();
                if buf.is_empty() {
                    buf.resize(self.size * frame_size, 0);
                }
                let start = offset * frame_size;
                buf[start..start + byte_len].copy_from_slice(&data[..byte_len]);
            }
            Backend::File {
                handle,
                offset: base,
            } => {
                let mut handle = handle.lock().unwrap();
                handle.seek(SeekFrom::Start(base + (offset * frame_size) as u64))?;
                handle.write(&data[..byte_len])?;
            }
            Backend::Virtual(_) => bail!(StoreError::ReadOnly),
        }

        Ok(())
    }

    /// Render this store into a new RAM store of `dest_format`, converting
    /// through the transform engine with unity channel mapping.
    pub fn duplicate(&self, dest_format: SampleFormat) -> Result<SampleStore> {
        let mut transform = pool::acquire(self.format, dest_format, UNITY_CHANNEL_MAP)?;

        let src_frame = self.format.frame_size();
        let dest_frame = dest_format.frame_size();
        let mut out = vec![0u8; self.size * dest_frame];
        let batch = transform.max_frames().max(1);
        let mut raw = vec![0u8; batch * src_frame];

        let mut done = 0;
        while done < self.size {
            let frames = batch.min(self.size - done);
            self.read(done, frames, &mut raw)?;
            transform.convert(
                &raw,
                &mut out[done * dest_frame..(done + frames) * dest_frame],
                frames,
            )?;
            done += frames;
        }

        pool::release(transform);
        Ok(SampleStore::from_data(dest_format, self.rate, out))
    }
}

/// Read handle converting from a store's format to a requested format and
/// channel mapping through a pooled transform.
pub struct SampleReader<'a> {
    store: &'a SampleStore,
    transform: Option<Transform>,
    dest_format: SampleFormat,
    raw: Vec<u8>,
    out: Vec<u8>,
}

impl<'a> SampleReader<'a> {
    pub fn new(store: &'a SampleStore, format: SampleFormat, map: ChannelMap) -> Result<Self> {
        let transform = pool::acquire(store.format(), format, map)?;
        Ok(Self {
            store,
            transform: Some(transform),
            dest_format: format,
            raw: Vec::new(),
            out: Vec::new(),
        })
    }

    /// Largest number of frames a single [`SampleReader::read`] may request.
    pub fn max_frames(&self) -> usize {
        self.transform.as_ref().unwrap().max_frames()
    }

    pub fn dest_format(&self) -> SampleFormat {
        self.dest_format
    }

    /// Read and convert `frames` frames starting at `offset`.
    pub fn read(&mut self, offset: usize, frames: usize) -> Result<&[u8]> {
        let transform = self.transform.as_mut().unwrap();
        ensure!(
            frames <= transform.max_frames(),
            "read of {frames} frames exceeds batch size {}",
            transform.max_frames()
        );

        let src_len = frames * self.store.format().frame_size();
        let dest_len = frames * self.dest_format.frame_size();
        self.raw.resize(src_len, 0);
        self.out.resize(dest_len, 0);

        self.store.read(offset, frames, &mut self.raw)?;
        transform.convert(&self.raw, &mut self.out, frames)?;
        Ok(&self.out[..dest_len])
    }
}

impl Drop for SampleReader<'_> {
    fn drop(&mut self) {
        if let Some(transform) = self.transform.take() {
            pool::release(transform);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::list::{SampleChannel, SampleSegment};
    use crate::sample::{HOST_ENDIAN, SampleWidth};
    use std::io::Cursor;

    fn stereo16() -> SampleFormat {
        SampleFormat::new(SampleWidth::Bit16, 2, true, HOST_ENDIAN)
    }

    fn frames_i16(data: &[i16]) -> Vec<u8> {
        data.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn to_i16(data: &[u8]) -> Vec<i16> {
        data.chunks_exact(2)
            .map(|c| i16::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn ram_store_read_write() -> Result<()> {
        let store = SampleStore::new_ram(SampleFormat::DEFAULT, 8, 44100);

        // unwritten data reads back as silence
        let mut out = vec![0xFFu8; 8];
        store.read(2, 4, &mut out)?;
        assert_eq!(&out[..8], &[0; 8]);

        store.write(4, 2, &frames_i16(&[123, -77]))?;
        let mut out = vec![0u8; 4];
        store.read(4, 2, &mut out)?;
        assert_eq!(to_i16(&out), [123, -77]);

        assert!(store.read(7, 2, &mut out).is_err());
        Ok(())
    }

    #[test]
    fn file_store_reads_byte_range() -> Result<()> {
        let mut bytes = vec![0u8; 16];
        bytes.extend_from_slice(&frames_i16(&[10, 20, 30, 40]));
        let handle = Arc::new(Mutex::new(FileHandle::new(Cursor::new(bytes))));

        let store = SampleStore::new_file(handle, 16, SampleFormat::DEFAULT, 4, 22050);
        let mut out = vec![0u8; 4];
        store.read(1, 2, &mut out)?;
        assert_eq!(to_i16(&out), [20, 30]);

        store.write(0, 1, &frames_i16(&[99]))?;
        let mut first = vec![0u8; 2];
        store.read(0, 1, &mut first)?;
        assert_eq!(to_i16(&first), [99]);
        Ok(())
    }

    #[test]
    fn file_store_round_trips_on_disk() -> Result<()> {
        let handle = Arc::new(Mutex::new(FileHandle::new(tempfile::tempfile()?)));
        let store = SampleStore::new_file(handle, 0, SampleFormat::DEFAULT, 32, 44100);

        let wave: Vec<i16> = (0..32).map(|i| i * 1000 - 16000).collect();
        store.write(0, 32, &frames_i16(&wave))?;

        let mut out = vec![0u8; 64];
        store.read(0, 32, &mut out)?;
        assert_eq!(to_i16(&out), wave);
        Ok(())
    }

    #[test]
    fn virtual_store_renders_edit_lists() -> Result<()> {
        // source: stereo, left channel ascending, right channel descending
        let frames = 64;
        let mut wave = Vec::with_capacity(frames * 2);
        for i in 0..frames as i16 {
            wave.push(i);
            wave.push(-i);
        }
        let src = Arc::new(SampleStore::from_data(stereo16(), 44100, frames_i16(&wave)));

        // rebuild both channels from quarters, out of order operations
        let q = frames / 4;
        let mut left = SampleList::new();
        left.append(SampleSegment::new(Arc::clone(&src), 0, frames, SampleChannel::Left));
        left.cut(q, q)?;
        left.insert(
            q,
            SampleSegment::new(Arc::clone(&src), q, q, SampleChannel::Left),
        )?;

        let mut right = SampleList::new();
        right.prepend(SampleSegment::new(
            Arc::clone(&src),
            q * 2,
            q,
            SampleChannel::Right,
        ));
        right.prepend(SampleSegment::new(Arc::clone(&src), 0, q * 2, SampleChannel::Right));
        right.append(SampleSegment::new(
            Arc::clone(&src),
            q * 3,
            q,
            SampleChannel::Right,
        ));

        let vstore = SampleStore::new_virtual(stereo16(), 44100, vec![left, right])?;
        assert_eq!(vstore.size(), frames);

        let mut out = vec![0u8; frames * 4];
        vstore.read(0, frames, &mut out)?;
        assert_eq!(to_i16(&out), wave);
        Ok(())
    }

    #[test]
    fn virtual_store_rejects_writes() -> Result<()> {
        let src = Arc::new(SampleStore::new_ram(SampleFormat::DEFAULT, 4, 44100));
        let mut list = SampleList::new();
        list.append(SampleSegment::new(src, 0, 4, SampleChannel::Left));

        let vstore = SampleStore::new_virtual(SampleFormat::DEFAULT, 44100, vec![list])?;
        assert!(vstore.write(0, 1, &[0, 0]).is_err());
        Ok(())
    }

    #[test]
    fn duplicate_converts_format() -> Result<()> {
        let store = SampleStore::from_data(
            SampleFormat::DEFAULT,
            44100,
            frames_i16(&[0x0100, -0x0100, 0x7F00]),
        );

        let dup = store.duplicate(SampleFormat::DEFAULT.with_width(SampleWidth::Bit8))?;
        assert_eq!(dup.size(), 3);

        let mut out = vec![0u8; 3];
        dup.read(0, 3, &mut out)?;
        let vals: Vec<i8> = out.iter().map(|&b| b as i8).collect();
        assert_eq!(vals, [1, -1, 0x7F]);
        Ok(())
    }

    #[test]
    fn sample_reader_converts_on_the_fly() -> Result<()> {
        let store = SampleStore::from_data(SampleFormat::DEFAULT, 44100, frames_i16(&[256, -512]));

        let dest = SampleFormat::DEFAULT.with_width(SampleWidth::Bit8);
        let mut reader = SampleReader::new(&store, dest, UNITY_CHANNEL_MAP)?;
        assert!(reader.max_frames() > 0);

        let out = reader.read(0, 2)?;
        let vals: Vec<i8> = out.iter().map(|&b| b as i8).collect();
        assert_eq!(vals, [1, -2]);
        Ok(())
    }
}
