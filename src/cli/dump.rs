use anyhow::Result;

use patchfile::file::FileHandle;
use patchfile::riff::{ChunkKind, Riff};

use super::command::{Cli, DumpArgs};

pub fn cmd_dump(args: &DumpArgs, _cli: &Cli) -> Result<()> {
    log::info!("Dumping RIFF chunks of: {}", args.input.display());

    let handle = FileHandle::open(&args.input)?;
    let mut riff = Riff::new(handle);

    let outer = riff.start_read()?;
    print_chunk(&outer, 0);

    dump_children(&mut riff, 1, args.raw)?;
    riff.close_chunk(-1)?;

    println!();
    println!("Total size {} bytes", outer.size + 8);
    Ok(())
}

fn dump_children(riff: &mut Riff, depth: usize, raw: bool) -> Result<()> {
    while let Some(chunk) = riff.read_chunk()? {
        print_chunk(&chunk, depth);

        if chunk.kind.is_list() {
            dump_children(riff, depth + 1, raw)?;
        } else if raw {
            dump_payload(riff, chunk.size, depth + 1)?;
        }

        riff.close_chunk(-1)?;
    }
    Ok(())
}

fn print_chunk(chunk: &patchfile::riff::Chunk, depth: usize) {
    let kind = match chunk.kind {
        ChunkKind::Riff => "RIFF",
        ChunkKind::List => "LIST",
        ChunkKind::Sub => "sub ",
    };
    println!(
        "{:indent$}{kind} '{}' size={} ofs={:#X}",
        "",
        chunk.id,
        chunk.size,
        chunk.filepos,
        indent = depth * 2
    );
}

fn dump_payload(riff: &mut Riff, size: u32, depth: usize) -> Result<()> {
    let mut remaining = size as usize;
    let mut offset = 0usize;
    let mut row = [0u8; 16];

    // close_chunk skips whatever the hex dump has not consumed
    while remaining > 0 {
        let len = remaining.min(16);
        riff.handle_mut().read(&mut row[..len])?;

        let hex: Vec<String> = row[..len].iter().map(|b| format!("{b:02X}")).collect();
        let text: String = row[..len]
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();

        println!(
            "{:indent$}{offset:06X}  {:<47}  {text}",
            "",
            hex.join(" "),
            indent = depth * 2
        );

        offset += len;
        remaining -= len;
    }

    Ok(())
}
