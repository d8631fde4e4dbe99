//! Spectralis SLI/SLC file writer.
//!
//! Saves a duplicated [`Sli`] tree: instruments are partitioned into
//! groups by transitive sample sharing, each group's headers are staged
//! in the handle's buffer (so counts and offsets can be patched before
//! anything hits the file), then sample data is streamed out as 16 bit
//! signed little endian through the transform engine. The duplicate
//! isolates the save from concurrent edits of the original tree; sample
//! stores themselves are shared, not copied.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::SeekFrom;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};

use crate::file::{Endian, FileHandle};
use crate::riff::HEADER_SIZE;
use crate::sample::store::{SampleReader, SampleStore};
use crate::sample::{SampleFormat, SampleWidth, UNITY_CHANNEL_MAP};
use crate::sli::r#gen::{Gen, SAMPLE_MODE_LOOP};
use crate::sli::layout::{
    FOURCC_SIFI, FOURCC_SIIG, HEAD_SIZE, INST_SIZE, InstHeader, SIFI_SIZE, SIIG_SIZE, SMPL_SIZE,
    SPECHDR, SampleHeader, SiDp, SiFi, SiIg, WireWrite, ZONE_SIZE, name_bytes,
};
use crate::sli::model::{Sli, SliSample, Zone, name_hash};
use crate::utils::errors::SliError;

/// Fixed sample data output format, minus the channel field.
fn output_format(channels: usize) -> SampleFormat {
    SampleFormat::new(SampleWidth::Bit16, channels, true, Endian::Little)
}

/// Zero samples appended after each sample's data, per channel.
const GAP_SAMPLES: usize = 64;

#[derive(Debug, Clone, Copy)]
struct SampleInfo {
    /// Sample index within its group.
    index: u16,
    /// Absolute file position of the written sample data.
    position: u64,
    /// Byte offset within the group's sample data region.
    offset: u32,
    /// Data length in bytes.
    length: u32,
    channels: u8,
}

pub struct SliWriter {
    handle: Arc<Mutex<FileHandle>>,
    sli: Sli,
    sample_info: HashMap<usize, SampleInfo>,
    saved: bool,
}

impl SliWriter {
    /// Create a writer for `sli`, duplicating the tree so the original
    /// can keep being edited while the save runs.
    pub fn new(handle: FileHandle, sli: &Sli) -> Self {
        Self {
            handle: Arc::new(Mutex::new(handle)),
            sli: sli.clone(),
            sample_info: HashMap::new(),
            saved: false,
        }
    }

    /// The shared output handle; stores from
    /// [`SliWriter::create_stores`] keep it alive.
    pub fn handle(&self) -> Arc<Mutex<FileHandle>> {
        Arc::clone(&self.handle)
    }

    /// Write the collection to the file. A failure after the file header
    /// was written leaves a truncated file behind; the duplicated tree
    /// stays consistent and the save can be retried on a fresh handle.
    pub fn save(&mut self) -> Result<()> {
        let groups = find_groups(&self.sli)?;

        let handle = Arc::clone(&self.handle);
        let mut guard = handle.lock().unwrap();
        let handle = &mut *guard;

        write_sifi(handle, groups.len() as u16)?;

        for group in &groups {
            let result = write_group(handle, &self.sli, group, &mut self.sample_info);
            if result.is_err() {
                handle.buf_clear();
                return result;
            }
        }

        // patch the total length into the file header
        let len = handle.position()?;
        handle.seek(SeekFrom::Start(4))?;
        handle.write_u32(len as u32)?;

        self.saved = true;
        Ok(())
    }

    /// After a successful save, build file-backed stores pointing at the
    /// written sample data, for rebinding live samples to the new file.
    /// Returned pairs are `(sample index, store)`.
    pub fn create_stores(&self) -> Result<Vec<(usize, Arc<SampleStore>)>> {
        anyhow::ensure!(self.saved, "create_stores before a successful save");

        let mut stores = Vec::with_capacity(self.sample_info.len());

        for (&index, info) in &self.sample_info {
            let sample = &self.sli.samples[index];
            let store = SampleStore::new_file(
                Arc::clone(&self.handle),
                info.position,
                output_format(info.channels as usize),
                sample.store.size(),
                sample.rate,
            );
            stores.push((index, Arc::new(store)));
        }

        stores.sort_by_key(|(index, _)| *index);
        Ok(stores)
    }
}

/// Partition instruments into groups of transitive sample sharing: two
/// instruments share a group iff a chain of zones connects them through
/// common samples. Union-find over (instrument, sample) incidences.
fn find_groups(sli: &Sli) -> Result<Vec<Vec<usize>>> {
    let count = sli.instruments.len();
    if count == 0 {
        bail!(SliError::NoGroups);
    }

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let mut parent: Vec<usize> = (0..count).collect();
    let mut sample_owner: HashMap<usize, usize> = HashMap::new();

    for (i, inst) in sli.instruments.iter().enumerate() {
        for (z, zone) in inst.zones.iter().enumerate() {
            if zone.sample >= sli.samples.len() {
                bail!(SliError::MissingSample {
                    zone: z,
                    inst: inst.name.clone(),
                });
            }

            match sample_owner.entry(zone.sample) {
                Entry::Occupied(entry) => {
                    let a = find(&mut parent, *entry.get());
                    let b = find(&mut parent, i);
                    if a != b {
                        parent[a] = b;
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(i);
                }
            }
        }
    }

    // groups ordered by their lowest instrument index, members in
    // instrument order
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut slot_of_root: HashMap<usize, usize> = HashMap::new();

    for i in 0..count {
        let root = find(&mut parent, i);
        let slot = *slot_of_root.entry(root).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(i);
    }

    Ok(groups)
}

fn write_sifi(handle: &mut FileHandle, ignum: u16) -> Result<()> {
    let sifi = SiFi {
        ckid: FOURCC_SIFI.0,
        cklen: 0, // patched after the last group
        spechdr: SPECHDR,
        unused: 0,
        ignum,
        igstart_offs: (HEADER_SIZE + SIFI_SIZE) as u16,
    };

    handle.buf_write(&sifi.wire_bytes());
    handle.buf_commit()
}

fn write_group(
    handle: &mut FileHandle,
    sli: &Sli,
    insts: &[usize],
    sample_info: &mut HashMap<usize, SampleInfo>,
) -> Result<()> {
    let pos = handle.position()?;

    // stage the whole header region; everything below patches into it
    handle.buf_zero(HEAD_SIZE as usize);

    let mut group_samples: Vec<usize> = Vec::new();
    let mut allzones: u32 = 0;
    let mut maxzones: u32 = 0;
    let mut smpdata_size: u32 = 0;

    for (i, &inst_index) in insts.iter().enumerate() {
        let inst = &sli.instruments[inst_index];
        let cnt = inst.zones.len() as u32;

        let ihdr = InstHeader {
            name: name_bytes(&inst.name),
            sound_id: if inst.sound_id != 0 {
                inst.sound_id
            } else {
                name_hash(&inst.name)
            },
            unused1: 0,
            category: inst.category,
            unused2: 0,
            zone_idx: allzones as u16,
            zones_num: cnt as u16,
        };

        let zone_base = allzones;
        maxzones = maxzones.max(cnt);
        allzones += cnt;

        handle.buf_seek(SeekFrom::Start((SIIG_SIZE + i as u32 * INST_SIZE) as u64))?;
        handle.buf_write(&ihdr.wire_bytes());

        handle.buf_seek(SeekFrom::Start(
            (SIIG_SIZE + insts.len() as u32 * INST_SIZE + zone_base * ZONE_SIZE) as u64,
        ))?;

        for zone in &inst.zones {
            let sample_index = match sample_info.get(&zone.sample) {
                Some(info) => info.index,
                None => {
                    let sample = &sli.samples[zone.sample];
                    let channels = sample.store.format().channels();
                    if channels > 2 {
                        bail!(SliError::UnsupportedChannels(sample.name.clone()));
                    }

                    let format = output_format(channels);
                    let length = (sample.store.size() * format.frame_size()) as u32;
                    let index = group_samples.len() as u16;

                    sample_info.insert(
                        zone.sample,
                        SampleInfo {
                            index,
                            position: 0,
                            offset: smpdata_size,
                            length,
                            channels: channels as u8,
                        },
                    );
                    group_samples.push(zone.sample);

                    smpdata_size += length + (channels * GAP_SAMPLES * 2) as u32;
                    index
                }
            };

            write_zone_header(handle, zone, sample_index);
        }
    }

    let header_len = SIIG_SIZE
        + insts.len() as u32 * INST_SIZE
        + allzones * ZONE_SIZE
        + group_samples.len() as u32 * SMPL_SIZE;

    if header_len >= HEAD_SIZE {
        bail!(SliError::HeaderSizeExceeded(header_len));
    }

    let siig = SiIg {
        ckid: FOURCC_SIIG.0,
        cklen: header_len + smpdata_size,
        spechdr: SPECHDR,
        unused1: 0,
        inst_offs: SIIG_SIZE as u16,
        instnum: insts.len() as u16,
        zones_offs: (SIIG_SIZE + insts.len() as u32 * INST_SIZE) as u16,
        allzones_num: allzones as u16,
        smphdr_offs: (SIIG_SIZE + insts.len() as u32 * INST_SIZE + allzones * ZONE_SIZE) as u16,
        maxzones_num: maxzones as u16,
        smpdata_offs: header_len as u16,
        unused2: 0,
    };

    handle.buf_seek(SeekFrom::Start(0))?;
    handle.buf_write(&siig.wire_bytes());

    // sample headers, in group sample order
    handle.buf_seek(SeekFrom::Start(siig.smphdr_offs as u64))?;
    for &sample_index in &group_samples {
        let info = sample_info.get_mut(&sample_index).unwrap();
        info.position = pos + siig.smpdata_offs as u64 + info.offset as u64;

        let sample = &sli.samples[sample_index];
        let shdr = SampleHeader {
            name: name_bytes(&sample.name),
            start: info.offset,
            end: info.offset + info.length,
            loop_start: sample.loop_start * 2,
            loop_end: sample.loop_end * 2,
            fine_tune: sample.fine_tune,
            root_note: sample.root_note,
            channels: info.channels,
            bits_per_sample: 16,
            sample_rate: sample.rate,
        };

        handle.buf_write(&shdr.wire_bytes());
    }

    // headers are assembled, commit them and stream the sample data
    handle.buf_set_size(siig.smpdata_offs as usize);
    handle.buf_commit()?;

    for &sample_index in &group_samples {
        write_sample_data(handle, &sli.samples[sample_index])?;
    }

    let sidp_bytes = SiDp::new().wire_bytes();
    for _ in insts {
        handle.buf_write(&sidp_bytes);
    }
    handle.buf_commit()
}

fn write_zone_header(handle: &mut FileHandle, zone: &Zone, sample_index: u16) {
    let gens = &zone.genarray;

    let amount = gens.amount(Gen::NoteRange);
    handle.buf_write_u8(amount.range_low());
    handle.buf_write_u8(amount.range_high());

    let amount = gens.amount(Gen::VelocityRange);
    handle.buf_write_u8(amount.range_low());
    handle.buf_write_u8(amount.range_high());

    let offs = ((gens.amount(Gen::SampleCoarseStart).uword() as u32) << 16)
        + ((gens.amount(Gen::SampleStart).uword() as u32) << 1);
    handle.buf_write_u32(offs);
    handle.buf_write_u32(offs);

    handle.buf_write_u32(0); // reserved
    handle.buf_write_u32(0); // reserved

    let coarse_tune = gens.amount(Gen::CoarseTune).sword() as i8;
    handle.buf_write_i8(coarse_tune);
    let fine_tune = gens.amount(Gen::FineTuneOverride).sword() as i8;
    handle.buf_write_i8(fine_tune);

    let mut flags = zone.flags;
    if gens.amount(Gen::SampleModes).uword() as u8 & SAMPLE_MODE_LOOP != 0 {
        flags |= SAMPLE_MODE_LOOP;
    }
    handle.buf_write_u8(flags);

    let root = gens.get(Gen::RootNoteOverride).map_or(0, |a| a.sword());
    handle.buf_write_i8(root as i8);

    let scale = gens.get(Gen::ScaleTune).map_or(0, |a| a.uword());
    handle.buf_write_u16(scale);

    handle.buf_write_i8(coarse_tune);
    handle.buf_write_i8(fine_tune);

    handle.buf_write_i16(gens.amount(Gen::ModLfoToPitch).sword());
    handle.buf_write_i16(gens.amount(Gen::VibLfoToPitch).sword());
    handle.buf_write_i16(gens.amount(Gen::ModEnvToPitch).sword());

    let cutoff = gens.get(Gen::FilterCutoff).map_or(0, |a| a.uword());
    handle.buf_write_u16(cutoff);
    handle.buf_write_u16(gens.amount(Gen::FilterQ).uword());

    handle.buf_write_i16(gens.amount(Gen::ModLfoToFilterCutoff).sword());
    handle.buf_write_i16(gens.amount(Gen::ModEnvToFilterCutoff).sword());
    handle.buf_write_i16(gens.amount(Gen::ModLfoToVolume).sword());
    handle.buf_write_i16(gens.amount(Gen::ModLfoFreq).sword());
    handle.buf_write_i16(gens.amount(Gen::VibLfoFreq).sword());

    handle.buf_write_u16(gens.amount(Gen::ModEnvSustain).uword());
    handle.buf_write_i16(gens.amount(Gen::NoteToModEnvHold).sword());
    handle.buf_write_i16(gens.amount(Gen::NoteToModEnvDecay).sword());
    handle.buf_write_u16(gens.amount(Gen::VolEnvSustain).uword());
    handle.buf_write_i16(gens.amount(Gen::NoteToVolEnvHold).sword());
    handle.buf_write_i16(gens.amount(Gen::NoteToVolEnvDecay).sword());

    handle.buf_write_i8((gens.amount(Gen::Pan).sword() / 5) as i8);

    for r#gen in [
        Gen::ModLfoDelay,
        Gen::VibLfoDelay,
        Gen::ModEnvAttack,
        Gen::ModEnvHold,
        Gen::ModEnvDecay,
        Gen::ModEnvRelease,
        Gen::VolEnvAttack,
        Gen::VolEnvHold,
        Gen::VolEnvDecay,
        Gen::VolEnvRelease,
    ] {
        let amount = gens.get(r#gen).map_or(0, |a| a.sword());
        handle.buf_write_i8((amount / 100) as i8);
    }

    handle.buf_write_u8((gens.amount(Gen::Attenuation).uword() / 10) as u8);

    handle.buf_write_u16(sample_index);
    handle.buf_write_u16(0); // reserved
}

fn write_sample_data(handle: &mut FileHandle, sample: &SliSample) -> Result<()> {
    let channels = sample.store.format().channels();
    let format = output_format(channels);

    let mut reader = SampleReader::new(&sample.store, format, UNITY_CHANNEL_MAP)?;
    let batch = reader.max_frames();
    let total = sample.store.size();

    let mut offs = 0;
    while offs < total {
        let frames = batch.min(total - offs);
        let converted = reader.read(offs, frames)?;
        handle.write(converted)?;
        offs += frames;
    }

    // inter-sample gap of zero samples, one run per channel
    handle.buf_zero(channels * GAP_SAMPLES * 2);
    handle.buf_commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sli::r#gen::GenAmount;
    use crate::sli::model::Instrument;
    use crate::sli::reader::SliReader;
    use std::io::Cursor;

    fn make_sample(name: &str, frames: usize, seed: i16) -> SliSample {
        let data: Vec<u8> = (0..frames)
            .flat_map(|i| ((i as i16).wrapping_mul(seed)).to_le_bytes())
            .collect();
        SliSample {
            name: name.into(),
            loop_start: 4,
            loop_end: frames as u32 - 4,
            rate: 44100,
            root_note: 60,
            fine_tune: -3,
            store: Arc::new(SampleStore::from_data(SampleFormat::DEFAULT, 44100, data)),
        }
    }

    fn make_zone(sample: usize) -> Zone {
        let mut zone = Zone {
            flags: SAMPLE_MODE_LOOP,
            sample,
            ..Default::default()
        };
        zone.genarray
            .set(Gen::NoteRange, GenAmount::from_range(30, 90));
        zone.genarray
            .set(Gen::VelocityRange, GenAmount::from_range(10, 100));
        zone.genarray.set(Gen::Pan, GenAmount(25));
        zone.genarray.set(Gen::Attenuation, GenAmount(40));
        zone.genarray.set(Gen::CoarseTune, GenAmount(3));
        zone.genarray.set(Gen::FilterCutoff, GenAmount(5000));
        zone.genarray.set(Gen::SampleStart, GenAmount(100));
        zone.genarray.set(Gen::VolEnvAttack, GenAmount(700));
        zone.genarray
            .set(Gen::SampleModes, GenAmount::from_u16(SAMPLE_MODE_LOOP as u16));
        zone
    }

    fn make_inst(name: &str, samples: &[usize]) -> Instrument {
        Instrument {
            name: name.into(),
            sound_id: 0,
            category: 7,
            zones: samples.iter().map(|&s| make_zone(s)).collect(),
        }
    }

    /// I1+I2 share S0, I2+I3 share S1, I3 uses S2, I4 uses S3 alone:
    /// two groups, {I1 I2 I3} and {I4}.
    fn chained_sli() -> Sli {
        Sli {
            instruments: vec![
                make_inst("I1", &[0]),
                make_inst("I2", &[0, 1]),
                make_inst("I3", &[1, 2]),
                make_inst("I4", &[3]),
            ],
            samples: vec![
                make_sample("S1", 32, 3),
                make_sample("S2", 48, 5),
                make_sample("S3", 64, 7),
                make_sample("S4", 40, 11),
            ],
        }
    }

    #[test]
    fn partitions_by_transitive_sharing() -> Result<()> {
        let sli = chained_sli();
        let groups = find_groups(&sli)?;

        assert_eq!(groups, vec![vec![0, 1, 2], vec![3]]);
        Ok(())
    }

    #[test]
    fn write_read_round_trip() -> Result<()> {
        let sli = chained_sli();

        let mut writer = SliWriter::new(FileHandle::new(Cursor::new(Vec::new())), &sli);
        writer.save()?;

        let shared = writer.handle();
        shared.lock().unwrap().seek(SeekFrom::Start(0))?;

        let loaded = SliReader::from_shared(shared).load()?;

        assert_eq!(loaded.instruments.len(), 4);
        assert_eq!(loaded.samples.len(), 4);

        for (orig, read) in sli.instruments.iter().zip(&loaded.instruments) {
            assert_eq!(orig.name, read.name);
            assert_eq!(read.sound_id, name_hash(&orig.name));
            assert_eq!(orig.category, read.category);
            assert_eq!(orig.zones.len(), read.zones.len());

            for (oz, rz) in orig.zones.iter().zip(&read.zones) {
                assert_eq!(oz.genarray, rz.genarray);
                assert_eq!(rz.flags & SAMPLE_MODE_LOOP, SAMPLE_MODE_LOOP);
            }
        }

        // zones of I1 and I2 point at the same loaded sample
        assert_eq!(
            loaded.instruments[0].zones[0].sample,
            loaded.instruments[1].zones[0].sample
        );

        // sample metadata and audio survive
        for (orig, read) in sli.samples.iter().zip(&loaded.samples) {
            assert_eq!(orig.name, read.name);
            assert_eq!(orig.loop_start, read.loop_start);
            assert_eq!(orig.loop_end, read.loop_end);
            assert_eq!(orig.rate, read.rate);
            assert_eq!(orig.fine_tune, read.fine_tune);
            assert_eq!(orig.store.size(), read.store.size());

            let frames = orig.store.size();
            let mut want = vec![0u8; frames * 2];
            orig.store.read(0, frames, &mut want)?;
            let mut got = vec![0u8; frames * 2];
            read.store.read(0, frames, &mut got)?;
            assert_eq!(want, got, "audio of '{}'", orig.name);
        }

        Ok(())
    }

    #[test]
    fn written_file_header_matches_file_size() -> Result<()> {
        let sli = chained_sli();
        let mut writer = SliWriter::new(FileHandle::new(Cursor::new(Vec::new())), &sli);
        writer.save()?;

        let shared = writer.handle();
        let mut guard = shared.lock().unwrap();
        let size = guard.size()?;

        guard.seek(SeekFrom::Start(0))?;
        let mut ckid = [0u8; 4];
        guard.read(&mut ckid)?;
        assert_eq!(&ckid, b"SiFi");
        assert_eq!(guard.read_u32()? as u64, size);
        Ok(())
    }

    #[test]
    fn create_stores_point_at_written_data() -> Result<()> {
        let sli = chained_sli();
        let mut writer = SliWriter::new(FileHandle::new(Cursor::new(Vec::new())), &sli);
        writer.save()?;

        let stores = writer.create_stores()?;
        assert_eq!(stores.len(), 4);

        for (index, store) in stores {
            let orig = &sli.samples[index];
            assert_eq!(store.size(), orig.store.size());

            let frames = orig.store.size();
            let mut want = vec![0u8; frames * 2];
            orig.store.read(0, frames, &mut want)?;
            let mut got = vec![0u8; frames * 2];
            store.read(0, frames, &mut got)?;
            assert_eq!(want, got);
        }
        Ok(())
    }

    #[test]
    fn header_budget_is_enforced() -> Result<()> {
        let mut sli = Sli::new();
        sli.samples.push(make_sample("S", 32, 1));
        // enough zones to push the header region past 64 KiB
        sli.instruments.push(Instrument {
            name: "Huge".into(),
            sound_id: 1,
            category: 0,
            zones: (0..900).map(|_| make_zone(0)).collect(),
        });

        let mut writer = SliWriter::new(FileHandle::new(Cursor::new(Vec::new())), &sli);
        let err = writer.save().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SliError>(),
            Some(SliError::HeaderSizeExceeded(_))
        ));
        Ok(())
    }

    #[test]
    fn more_than_two_channels_is_unsupported() -> Result<()> {
        let mut sli = Sli::new();
        let format = SampleFormat::new(SampleWidth::Bit16, 4, true, Endian::Little);
        sli.samples.push(SliSample {
            name: "Quad".into(),
            loop_start: 0,
            loop_end: 0,
            rate: 44100,
            root_note: 60,
            fine_tune: 0,
            store: Arc::new(SampleStore::new_ram(format, 64, 44100)),
        });
        sli.instruments.push(make_inst("I", &[0]));

        let mut writer = SliWriter::new(FileHandle::new(Cursor::new(Vec::new())), &sli);
        let err = writer.save().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SliError>(),
            Some(SliError::UnsupportedChannels(_))
        ));
        Ok(())
    }

    #[test]
    fn stereo_sample_survives_round_trip() -> Result<()> {
        let stereo = SampleFormat::new(SampleWidth::Bit16, 2, true, Endian::Little);
        let frames = 64;
        let data: Vec<u8> = (0..frames * 2)
            .flat_map(|i| (i as i16 - 64).to_le_bytes())
            .collect();

        let mut sli = Sli::new();
        sli.samples.push(SliSample {
            name: "Stereo".into(),
            loop_start: 0,
            loop_end: frames as u32,
            rate: 48000,
            root_note: 64,
            fine_tune: 0,
            store: Arc::new(SampleStore::from_data(stereo, 48000, data.clone())),
        });
        sli.instruments.push(make_inst("I", &[0]));

        let mut writer = SliWriter::new(FileHandle::new(Cursor::new(Vec::new())), &sli);
        writer.save()?;

        let shared = writer.handle();
        shared.lock().unwrap().seek(SeekFrom::Start(0))?;
        let loaded = SliReader::from_shared(shared).load()?;

        let sample = &loaded.samples[0];
        assert_eq!(sample.store.format().channels(), 2);
        assert_eq!(sample.store.size(), frames);

        let mut got = vec![0u8; frames * 4];
        sample.store.read(0, frames, &mut got)?;
        assert_eq!(got, data);
        Ok(())
    }
}
