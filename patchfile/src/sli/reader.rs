//! Spectralis SLI/SLC file reader.
//!
//! The file is nominally RIFF-shaped but breaks RIFF's nesting rules, so
//! it is parsed directly against the file handle. Each group's header
//! region is prefetched into the handle's buffer for random access; the
//! packed sample data is left on disk and exposed through file-backed
//! sample stores.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use log::warn;

use crate::file::{Endian, FileHandle};
use crate::riff::FourCc;
use crate::sample::store::SampleStore;
use crate::sample::{SampleFormat, SampleWidth};
use crate::sli::r#gen::{Gen, GenAmount, SAMPLE_MODE_LOOP};
use crate::sli::layout::{
    FOURCC_SIFI, FOURCC_SIIG, HEAD_SIZE, INST_SIZE, NAME_SIZE, SIDP_SIZE, SIFI_SIZE, SMPL_SIZE,
    ZONE_SIZE, name_str,
};
use crate::sli::model::{Instrument, Sli, SliSample, Zone};
use crate::utils::errors::SliError;

pub struct SliReader {
    handle: Arc<Mutex<FileHandle>>,
}

impl SliReader {
    pub fn new(handle: FileHandle) -> Self {
        Self {
            handle: Arc::new(Mutex::new(handle)),
        }
    }

    pub fn from_shared(handle: Arc<Mutex<FileHandle>>) -> Self {
        Self { handle }
    }

    /// The shared handle; file-backed stores of a loaded [`Sli`] keep it
    /// alive after the reader is dropped.
    pub fn handle(&self) -> Arc<Mutex<FileHandle>> {
        Arc::clone(&self.handle)
    }

    /// Load the file into an object tree. On failure nothing is returned;
    /// the collection is never partially populated.
    pub fn load(&mut self) -> Result<Sli> {
        let shared = Arc::clone(&self.handle);
        let mut handle = self.handle.lock().unwrap();
        let handle = &mut *handle;

        let mut ckid = [0u8; 4];
        handle.read(&mut ckid)?;
        let cklen = handle.read_u32()?;

        if FourCc(ckid) != FOURCC_SIFI {
            bail!(SliError::NotSli(FourCc(ckid)));
        }

        // declared length covers the whole file; disagreement with the
        // filesystem is suspicious but not fatal
        let size = match handle.size() {
            Ok(size) => {
                if size != cklen as u64 {
                    warn!("File size mismatch (chunk size = {cklen}, actual = {size})");
                }
                size
            }
            Err(err) => {
                warn!("File size check failed: {err}");
                cklen as u64
            }
        };

        handle.skip(SIFI_SIZE as i64)?;

        let mut sli = Sli::new();
        let mut pos = handle.position()?;

        while size > pos {
            load_group(handle, &shared, &mut sli, pos, size)?;
            pos = handle.position()?;
        }

        Ok(sli)
    }
}

fn load_group(
    handle: &mut FileHandle,
    shared: &Arc<Mutex<FileHandle>>,
    sli: &mut Sli,
    pos: u64,
    size: u64,
) -> Result<()> {
    handle.buf_load(HEAD_SIZE as usize)?;

    let mut ckid = [0u8; 4];
    handle.buf_read(&mut ckid)?;
    let cklen = handle.buf_read_u32()?;
    let _spechdr = handle.buf_read_u16()?;
    let _unused1 = handle.buf_read_u16()?;
    let inst_offs = handle.buf_read_u16()?;
    let instnum = handle.buf_read_u16()?;
    let zones_offs = handle.buf_read_u16()?;
    let _allzones_num = handle.buf_read_u16()?;
    let smphdr_offs = handle.buf_read_u16()?;
    let _maxzones_num = handle.buf_read_u16()?;
    let smpdata_offs = handle.buf_read_u16()?;

    if FourCc(ckid) != FOURCC_SIIG {
        bail!(SliError::BadGroupId {
            id: FourCc(ckid),
            position: pos,
        });
    }

    if cklen as u64 > size - pos {
        bail!(SliError::GroupSizeMismatch {
            declared: cklen,
            remaining: size - pos,
        });
    }

    if instnum > 0 {
        // sample table capacity: header space between sample headers and
        // sample data
        let sample_count =
            (smpdata_offs.saturating_sub(smphdr_offs) / SMPL_SIZE as u16) as usize;
        let mut sample_map: HashMap<u16, usize> = HashMap::new();

        for i in 0..instnum {
            handle.buf_seek(SeekFrom::Start(
                (inst_offs as u32 + i as u32 * INST_SIZE) as u64,
            ))?;

            let mut name = [0u8; NAME_SIZE];
            handle.buf_read(&mut name)?;
            let sound_id = handle.buf_read_u32()?;
            let _unused1 = handle.buf_read_u32()?;
            let category = handle.buf_read_u16()?;
            let _unused2 = handle.buf_read_u16()?;
            let zone_idx = handle.buf_read_u16()?;
            let zones_num = handle.buf_read_u16()?;

            let mut inst = Instrument {
                name: name_str(&name),
                sound_id,
                category,
                zones: Vec::with_capacity(zones_num as usize),
            };

            for z in 0..zones_num {
                handle.buf_seek(SeekFrom::Start(
                    (zones_offs as u32 + (zone_idx as u32 + z as u32) * ZONE_SIZE) as u64,
                ))?;
                let (mut zone, sample_idx) = load_zone(handle)?;

                if sample_idx as usize >= sample_count {
                    bail!(SliError::BadSampleIndex {
                        index: sample_idx,
                        count: sample_count,
                        zone: z as usize,
                        inst: inst.name.clone(),
                    });
                }

                // materialize each distinct sample once per group
                let sample = match sample_map.get(&sample_idx) {
                    Some(&index) => index,
                    None => {
                        handle.buf_seek(SeekFrom::Start(
                            (smphdr_offs as u32 + sample_idx as u32 * SMPL_SIZE) as u64,
                        ))?;
                        let sample =
                            load_sample(handle, shared, pos + smpdata_offs as u64)?;
                        sli.samples.push(sample);
                        let index = sli.samples.len() - 1;
                        sample_map.insert(sample_idx, index);
                        index
                    }
                };

                zone.sample = sample;
                inst.zones.push(zone);
            }

            sli.instruments.push(inst);
        }
    }

    // seek past the group chunk and its per-instrument terminators
    handle.seek(SeekFrom::Start(pos + cklen as u64))?;
    handle.skip((instnum as u32 * SIDP_SIZE) as i64)?;

    Ok(())
}

fn load_zone(handle: &mut FileHandle) -> Result<(Zone, u16)> {
    let mut zone = Zone::default();

    let low = handle.buf_read_u8()?;
    let high = handle.buf_read_u8()?;
    zone.genarray
        .set_nondefault(Gen::NoteRange, GenAmount::from_range(low, high));

    let low = handle.buf_read_u8()?;
    let high = handle.buf_read_u8()?;
    zone.genarray
        .set_nondefault(Gen::VelocityRange, GenAmount::from_range(low, high));

    let offs = handle.buf_read_u32()?;
    if offs != handle.buf_read_u32()? {
        warn!("Ignoring different 2nd start offset for zone");
    }
    zone.genarray.set_nondefault(
        Gen::SampleCoarseStart,
        GenAmount::from_u16((offs >> 16) as u16),
    );
    zone.genarray
        .set_nondefault(Gen::SampleStart, GenAmount::from_u16((offs as u16) / 2));

    if handle.buf_read_u32()? != 0 {
        warn!("Ignoring 1st unknown value for zone");
    }
    if handle.buf_read_u32()? != 0 {
        warn!("Ignoring 2nd unknown value for zone");
    }

    let coarse_tune = handle.buf_read_i8()?;
    zone.genarray
        .set_nondefault(Gen::CoarseTune, GenAmount(coarse_tune as i16));

    let fine_tune = handle.buf_read_i8()?;
    zone.genarray
        .set_nondefault(Gen::FineTuneOverride, GenAmount(fine_tune as i16));

    zone.flags = handle.buf_read_u8()?;
    if zone.flags & SAMPLE_MODE_LOOP != 0 {
        zone.genarray.set_nondefault(
            Gen::SampleModes,
            GenAmount::from_u16(SAMPLE_MODE_LOOP as u16),
        );
    }

    let root_note = handle.buf_read_i8()?;
    if root_note != 0 {
        zone.genarray
            .set_nondefault(Gen::RootNoteOverride, GenAmount(root_note as i16));
    }

    let scale_tuning = handle.buf_read_u16()?;
    if scale_tuning != 0 {
        zone.genarray
            .set_nondefault(Gen::ScaleTune, GenAmount::from_u16(scale_tuning));
    }

    if zone.genarray.amount(Gen::CoarseTune).sword() != handle.buf_read_i8()? as i16 {
        warn!("Ignoring different 2nd coarse tune value for zone");
    }
    if zone.genarray.amount(Gen::FineTuneOverride).sword() != handle.buf_read_i8()? as i16 {
        warn!("Ignoring different 2nd fine tune value for zone");
    }

    for r#gen in [
        Gen::ModLfoToPitch,
        Gen::VibLfoToPitch,
        Gen::ModEnvToPitch,
    ] {
        let amount = handle.buf_read_i16()?;
        zone.genarray.set_nondefault(r#gen, GenAmount(amount));
    }

    let cutoff = handle.buf_read_u16()?;
    if cutoff != 0 {
        zone.genarray
            .set_nondefault(Gen::FilterCutoff, GenAmount::from_u16(cutoff));
    }

    let q = handle.buf_read_u16()?;
    zone.genarray
        .set_nondefault(Gen::FilterQ, GenAmount::from_u16(q));

    for r#gen in [
        Gen::ModLfoToFilterCutoff,
        Gen::ModEnvToFilterCutoff,
        Gen::ModLfoToVolume,
        Gen::ModLfoFreq,
        Gen::VibLfoFreq,
    ] {
        let amount = handle.buf_read_i16()?;
        zone.genarray.set_nondefault(r#gen, GenAmount(amount));
    }

    let sustain = handle.buf_read_u16()?;
    zone.genarray
        .set_nondefault(Gen::ModEnvSustain, GenAmount::from_u16(sustain));

    for r#gen in [Gen::NoteToModEnvHold, Gen::NoteToModEnvDecay] {
        let amount = handle.buf_read_i16()?;
        zone.genarray.set_nondefault(r#gen, GenAmount(amount));
    }

    let sustain = handle.buf_read_u16()?;
    zone.genarray
        .set_nondefault(Gen::VolEnvSustain, GenAmount::from_u16(sustain));

    for r#gen in [Gen::NoteToVolEnvHold, Gen::NoteToVolEnvDecay] {
        let amount = handle.buf_read_i16()?;
        zone.genarray.set_nondefault(r#gen, GenAmount(amount));
    }

    let pan = handle.buf_read_i8()? as i16 * 5;
    zone.genarray.set_nondefault(Gen::Pan, GenAmount(pan));

    // envelope and LFO timings are stored in centiseconds; zero means the
    // format default, not a zero time
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
        let amount = handle.buf_read_i8()? as i16 * 100;
        if amount != 0 {
            zone.genarray.set_nondefault(r#gen, GenAmount(amount));
        }
    }

    let attenuation = handle.buf_read_u8()? as u16 * 10;
    zone.genarray
        .set_nondefault(Gen::Attenuation, GenAmount::from_u16(attenuation));

    let sample_idx = handle.buf_read_u16()?;
    Ok((zone, sample_idx))
}

fn load_sample(
    handle: &mut FileHandle,
    shared: &Arc<Mutex<FileHandle>>,
    smpdata_offs: u64,
) -> Result<SliSample> {
    let mut name = [0u8; NAME_SIZE];
    handle.buf_read(&mut name)?;
    let start = handle.buf_read_u32()?;
    let end = handle.buf_read_u32()?;
    let loop_start = handle.buf_read_u32()?;
    let loop_end = handle.buf_read_u32()?;
    let fine_tune = handle.buf_read_i8()?;
    let root_note = handle.buf_read_u8()?;
    let channels = handle.buf_read_u8()?;
    let bits_per_sample = handle.buf_read_u8()?;
    let sample_rate = handle.buf_read_u32()?;

    let name = name_str(&name);

    if channels > 2 {
        bail!(SliError::UnsupportedChannels(name));
    }

    if start > end || end - start < 48 {
        warn!("Invalid sample '{name}'");
        return Ok(blank_sample(name));
    }

    let bytes_per_sample = (bits_per_sample / 8).max(1) as u32;
    let length = end - start;

    let mut sample = SliSample {
        name,
        loop_start: 0,
        loop_end: 0,
        rate: sample_rate,
        root_note,
        fine_tune,
        store: Arc::new(SampleStore::new_ram(SampleFormat::DEFAULT, 0, sample_rate)),
    };

    if loop_start <= loop_end && loop_start <= length && loop_end <= length {
        sample.loop_start = loop_start / bytes_per_sample;
        sample.loop_end = loop_end / bytes_per_sample;
    } else {
        warn!("Invalid loop for sample '{}'", sample.name);
    }

    let width = if bits_per_sample == 8 {
        SampleWidth::Bit8
    } else {
        SampleWidth::Bit16
    };
    let format = SampleFormat::new(width, channels.max(1) as usize, true, Endian::Little);

    let frames = (length / bytes_per_sample / channels.max(1) as u32) as usize;
    sample.store = Arc::new(SampleStore::new_file(
        Arc::clone(shared),
        smpdata_offs + start as u64,
        format,
        frames,
        sample_rate,
    ));

    Ok(sample)
}

/// Stand-in for a sample whose header failed sanity checks.
fn blank_sample(name: String) -> SliSample {
    SliSample {
        name,
        loop_start: 0,
        loop_end: 0,
        rate: 44100,
        root_note: 60,
        fine_tune: 0,
        store: Arc::new(SampleStore::new_ram(SampleFormat::DEFAULT, 48, 44100)),
    }
}
