use anyhow::Result;
use serde::Serialize;

use patchfile::file::FileHandle;
use patchfile::sli::r#gen::Gen;
use patchfile::sli::model::Sli;
use patchfile::sli::reader::SliReader;

use super::command::{Cli, InfoArgs};

pub fn cmd_info(args: &InfoArgs, _cli: &Cli) -> Result<()> {
    log::info!("Reading Spectralis file: {}", args.input.display());

    let handle = FileHandle::open(&args.input)?;
    let mut reader = SliReader::new(handle);
    let sli = reader.load()?;

    let summary = BankSummary::from_sli(&args.input.display().to_string(), &sli);

    if args.yaml {
        print!("{}", serde_yaml_ng::to_string(&summary)?);
    } else {
        display_summary(&summary);
    }

    Ok(())
}

#[derive(Serialize)]
struct BankSummary {
    file: String,
    instruments: Vec<InstSummary>,
    samples: Vec<SampleSummary>,
}

#[derive(Serialize)]
struct InstSummary {
    name: String,
    sound_id: u32,
    category: u16,
    zones: Vec<ZoneSummary>,
}

#[derive(Serialize)]
struct ZoneSummary {
    sample: String,
    note_range: String,
    velocity_range: String,
    generators: u32,
}

#[derive(Serialize)]
struct SampleSummary {
    name: String,
    frames: usize,
    rate: u32,
    channels: usize,
    root_note: u8,
    loop_range: String,
}

impl BankSummary {
    fn from_sli(file: &str, sli: &Sli) -> Self {
        let instruments = sli
            .instruments
            .iter()
            .map(|inst| InstSummary {
                name: inst.name.clone(),
                sound_id: inst.sound_id,
                category: inst.category,
                zones: inst
                    .zones
                    .iter()
                    .map(|zone| {
                        let note = zone.genarray.amount(Gen::NoteRange);
                        let vel = zone.genarray.amount(Gen::VelocityRange);
                        ZoneSummary {
                            sample: sli
                                .samples
                                .get(zone.sample)
                                .map_or_else(|| "?".into(), |s| s.name.clone()),
                            note_range: format!("{}..{}", note.range_low(), note.range_high()),
                            velocity_range: format!("{}..{}", vel.range_low(), vel.range_high()),
                            generators: zone.genarray.set_count(),
                        }
                    })
                    .collect(),
            })
            .collect();

        let samples = sli
            .samples
            .iter()
            .map(|sample| SampleSummary {
                name: sample.name.clone(),
                frames: sample.store.size(),
                rate: sample.rate,
                channels: sample.store.format().channels(),
                root_note: sample.root_note,
                loop_range: format!("{}..{}", sample.loop_start, sample.loop_end),
            })
            .collect();

        Self {
            file: file.into(),
            instruments,
            samples,
        }
    }
}

fn display_summary(summary: &BankSummary) {
    println!();
    println!("Spectralis Bank Information");
    println!("===========================");
    println!();
    println!("File                        {}", summary.file);
    println!("Instruments                 {}", summary.instruments.len());
    println!("Samples                     {}", summary.samples.len());
    println!();

    for inst in &summary.instruments {
        println!("Instrument '{}'", inst.name);
        println!("  Sound id                  {:#010X}", inst.sound_id);
        println!("  Category                  {}", inst.category);
        for (i, zone) in inst.zones.iter().enumerate() {
            println!(
                "  Zone {i:<3} sample '{}' notes {} velocities {} ({} generators)",
                zone.sample, zone.note_range, zone.velocity_range, zone.generators
            );
        }
        println!();
    }

    for sample in &summary.samples {
        println!("Sample '{}'", sample.name);
        println!("  Frames                    {}", sample.frames);
        println!("  Rate                      {} Hz", sample.rate);
        println!("  Channels                  {}", sample.channels);
        println!("  Root note                 {}", sample.root_note);
        println!("  Loop                      {}", sample.loop_range);
        println!();
    }
}
