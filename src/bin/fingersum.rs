//! Checksum, duration and fingerprint reports for audio files.
//!
//! ```bash
//! fingersum [-c] [-d] [-f] [-o OFFSET]... [-j N] FILE...
//! fingersum --compare A B
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context as _};
use clap::Parser;
use fingersum::{compare, finalize_disc, Actions, Context, Engine, FileSource, Offset};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// AccurateRip checksums and fingerprints of ripped tracks
#[derive(Parser, Debug)]
#[clap(name = "fingersum", version)]
struct Args {
    /// Print v1, v2 and CRC32 for every offset; files are consecutive tracks of one disc
    #[clap(short = 'c', long)]
    checksums: bool,

    /// Print duration and sector count
    #[clap(short = 'd', long)]
    duration: bool,

    /// Print the acoustic fingerprint
    #[clap(short = 'f', long)]
    fingerprint: bool,

    /// Additional read offset in frames (repeatable)
    #[clap(short = 'o', long = "offset", value_name = "OFFSET", allow_hyphen_values = true)]
    offsets: Vec<Offset>,

    /// Worker threads; 0 runs everything on the main thread
    #[clap(short = 'j', long, env = "FINGERSUM_JOBS", default_value = "4")]
    jobs: usize,

    /// Compare the sample data of exactly two files
    #[clap(long)]
    compare: bool,

    /// More log output (repeatable)
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Audio files
    #[clap(required = true, value_name = "FILE")]
    files: Vec<PathBuf>,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();
}

fn open(path: &Path, args: &Args) -> anyhow::Result<Engine> {
    let source = FileSource::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    #[allow(unused_mut)]
    let mut engine = Engine::new(source)?;
    for offset in &args.offsets {
        engine.register_offset(*offset)?;
    }
    if args.fingerprint {
        #[cfg(feature = "chromaprint")]
        engine.set_fingerprinter(fingersum::ChromaprintFingerprinter::new())?;
        #[cfg(not(feature = "chromaprint"))]
        bail!("built without the chromaprint feature");
    }
    Ok(engine)
}

fn run_compare(args: &Args) -> anyhow::Result<ExitCode> {
    let [a, b] = args.files.as_slice() else {
        bail!("--compare needs exactly two files");
    };
    let mut left = FileSource::open(a).with_context(|| format!("cannot open {}", a.display()))?;
    let mut right = FileSource::open(b).with_context(|| format!("cannot open {}", b.display()))?;
    let diff = compare(&mut left, &mut right)?;
    println!(
        "Compared {} and {} frames: {} differing bytes",
        diff.frames_a, diff.frames_b, diff.differing_bytes
    );
    let layout = |mono: bool| if mono { "mono" } else { "stereo" };
    println!("File 1: {}, File 2: {}", layout(diff.mono_a), layout(diff.mono_b));
    Ok(if diff.is_identical() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run(args: &Args) -> anyhow::Result<ExitCode> {
    if args.compare {
        return run_compare(args);
    }

    let mut actions = Actions::empty();
    if args.checksums || args.duration {
        actions |= Actions::CHECKSUM;
    }
    if args.fingerprint {
        actions |= Actions::FINGERPRINT;
    }
    if actions.is_empty() {
        actions = Actions::CHECKSUM;
    }

    let context = Context::new(args.jobs)?;
    let mut failed = false;
    let mut engines: Vec<Option<Engine>> = Vec::new();
    for (index, path) in args.files.iter().enumerate() {
        engines.push(None);
        match open(path, args) {
            Ok(engine) => context.submit(engine, index, actions)?,
            Err(e) => {
                warn!("{e:#}");
                failed = true;
            }
        }
    }

    while let Ok(mut job) = context.retrieve() {
        let index = *job.tag();
        let path = args.files[index].display();
        if !job.is_success() {
            eprintln!("{path}: failed ({:?} of {:?})", job.status(), job.actions());
            failed = true;
        }
        if args.duration && job.status().contains(Actions::CHECKSUM) {
            let engine = job.engine();
            match engine.sector_count() {
                Ok(sectors) => println!("{path}: {:.3} s, {sectors} sectors", engine.duration()),
                Err(e) => println!("{path}: {:.3} s, {e}", engine.duration()),
            }
        }
        if job.status().contains(Actions::FINGERPRINT) {
            let fingerprint = job.engine_mut().fingerprint()?;
            println!("{path}: {fingerprint}");
        }
        if job.status().contains(Actions::CHECKSUM) {
            engines[index] = Some(job.into_engine());
        }
    }
    context.destroy();

    if args.checksums {
        let tracks: Vec<Option<&Engine>> = engines.iter().map(Option::as_ref).collect();
        for (index, results) in finalize_disc(&tracks).into_iter().enumerate() {
            let Some(engine) = tracks[index] else { continue };
            let path = args.files[index].display();
            for (offset, result) in engine.registered_offsets().into_iter().zip(results) {
                match result {
                    Ok(sums) => println!(
                        "{path}: offset {:+5} v1 {:08x} v2 {:08x} crc32 {:08x} crc32-skip-zero {:08x}",
                        sums.offset, sums.v1, sums.v2, sums.crc32, sums.crc32_skip_zero
                    ),
                    Err(e) => {
                        eprintln!("{path}: offset {offset:+5} {e}");
                        failed = true;
                    }
                }
            }
        }
    }

    info!(files = args.files.len(), failed, "done");
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fingersum: {e:#}");
            ExitCode::FAILURE
        }
    }
}
