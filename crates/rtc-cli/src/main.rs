use std::fs::OpenOptions;
use std::io::{BufWriter, Read};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rtc_container::{
    FileSource, IoSink, Params, Reader, StreamConfig, StreamId, Writer, DEFAULT_SUBUNIT,
    DEFAULT_UNIT,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Ruler Trace Container tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse a container and print its units, frames, and streams.
    Dump(DumpArgs),
    /// Record stdin into a container, timestamping each burst.
    Record(RecordArgs),
}

#[derive(Args, Debug)]
struct DumpArgs {
    /// The input container file.
    input: PathBuf,

    /// Print every frame instead of per-unit summaries.
    #[arg(long)]
    frames: bool,
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// The output container file (appended to if it exists).
    output: PathBuf,

    /// Unit size in bytes (power of two).
    #[arg(long, default_value_t = DEFAULT_UNIT)]
    unit: u64,

    /// Subunit size in bytes (power of two).
    #[arg(long, default_value_t = DEFAULT_SUBUNIT)]
    subunit: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Dump(args) => dump(args),
        Commands::Record(args) => record(args),
    }
}

fn dump(args: DumpArgs) -> anyhow::Result<()> {
    let source = FileSource::open(&args.input)
        .with_context(|| format!("cannot open {}", args.input.display()))?;
    let mut reader = Reader::new(source);
    let mut cursor = reader.cursor();

    let mut units = 0u64;
    let mut frames = 0u64;
    let mut user_bytes = 0u64;
    let mut suspect_units = 0u64;

    while let Some(frame) = cursor.next_frame()? {
        frames += 1;
        let name = cursor
            .stream(frame.stream)
            .map(|desc| desc.config.name.clone())
            .unwrap_or_else(|| format!("#{}", frame.stream));

        match frame.stream {
            StreamId::MARKER => {
                units += 1;
                if args.frames {
                    println!("unit at {:#010x}", frame.header);
                }
            }
            StreamId::INDEX => {
                if let Some(ordinal) = cursor.current_unit_ordinal() {
                    if !args.frames {
                        println!(
                            "unit {ordinal} at {:#010x} (unit size {:?}, subunit size {:?})",
                            frame.header,
                            cursor.unit_size(),
                            cursor.subunit_size()
                        );
                    }
                }
            }
            StreamId::CRC => {
                if cursor.unit_suspect() {
                    suspect_units += 1;
                    println!("unit ending at {:#010x}: CRC MISMATCH", frame.end());
                }
            }
            _ => {}
        }
        if frame.stream >= StreamId::FIRST_USER {
            user_bytes += frame.length as u64;
        }
        if args.frames {
            println!(
                "  {:#010x} {:<12} len {:>5}{}",
                frame.header,
                name,
                frame.length,
                if frame.more { " more" } else { "" }
            );
        }
    }

    println!();
    println!("{units} unit(s), {frames} frame(s), {user_bytes} user payload byte(s)");
    if suspect_units > 0 {
        println!("{suspect_units} unit(s) failed their checksum");
    }

    println!("streams:");
    for desc in cursor.streams() {
        if desc.config.hidden {
            continue;
        }
        let length = match desc.config.frame_length {
            rtc_container::FrameLength::Fixed(n) => format!("fixed {n}"),
            rtc_container::FrameLength::Variable => "variable".to_owned(),
        };
        println!(
            "  {:>4}  {:<16} {}{}{}",
            desc.id,
            desc.config.name,
            length,
            if desc.config.cont { ", cont" } else { "" },
            desc.config
                .content
                .as_deref()
                .map(|c| format!(", content {c:?}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn record(args: RecordArgs) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.output)
        .with_context(|| format!("cannot open {}", args.output.display()))?;
    let sink = IoSink::new(BufWriter::new(file));

    let params = Params { unit: args.unit, subunit: args.subunit };
    let mut writer = Writer::start(sink, params)?;

    let clk = writer.create(StreamConfig::variable("clk").with_content("timespec"))?;
    let stdin_stream = writer.create(
        StreamConfig::variable("stdin").with_cont().with_content("utf-8"),
    )?;

    eprintln!("Recording stdin to {}; press Ctrl+D to stop.", args.output.display());

    let mut input = std::io::stdin().lock();
    let mut buffer = [0u8; 4096];
    loop {
        let n = input.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        write_timestamp(&mut writer, clk)?;
        writer.write(stdin_stream, &buffer[..n], false)?;
    }

    writer.stop()?;
    Ok(())
}

/// One logical clk frame: seconds (u64) chained to nanoseconds (u32).
fn write_timestamp<S: rtc_container::FrameSink>(
    writer: &mut Writer<S>,
    clk: StreamId,
) -> anyhow::Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the epoch")?;
    writer.write(clk, &now.as_secs().to_ne_bytes(), true)?;
    writer.write(clk, &now.subsec_nanos().to_ne_bytes(), false)?;
    Ok(())
}
