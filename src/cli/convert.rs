use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use patchfile::file::FileHandle;
use patchfile::sli::reader::SliReader;
use patchfile::sli::writer::SliWriter;

use super::command::{Cli, ConvertArgs};

pub fn cmd_convert(args: &ConvertArgs, _cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    log::info!(
        "Converting {} -> {}",
        args.input.display(),
        args.output.display()
    );

    let handle = FileHandle::open(&args.input)?;
    let mut reader = SliReader::new(handle);
    let sli = reader.load()?;

    log::info!(
        "Loaded {} instruments, {} samples",
        sli.instruments.len(),
        sli.samples.len()
    );

    let pb = match multi {
        Some(multi) => {
            let pb = multi.add(ProgressBar::new_spinner());
            pb.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            pb.set_message(format!("Writing {}...", args.output.display()));
            Some(pb)
        }
        None => None,
    };

    let output = FileHandle::create(&args.output)?;
    let mut writer = SliWriter::new(output, &sli);
    let result = writer.save();

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    result?;

    let written = writer.handle().lock().unwrap().size()?;
    println!(
        "Wrote {} ({} bytes, {} instruments, {} samples)",
        args.output.display(),
        written,
        sli.instruments.len(),
        sli.samples.len()
    );

    Ok(())
}
