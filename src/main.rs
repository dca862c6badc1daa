use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::{ArgAction, Parser, Subcommand};
use log::{error, info};

use crate::{
    checksum::DetectLevel,
    delta::DiffMethod,
    error::{SessionError, Stage},
    lvm::LvmTools,
    recv::{RecvOptions, RestoreSession},
    send::{BackupSession, SendOptions},
    stream::StreamHeader,
};

/// Raw block device access with `BLKSSZGET`/`BLKGETSIZE64` ioctls.
///
/// Definitions taken from `/usr/include/linux`.
mod blkdev;
mod checksum;
mod delta;
mod device;
mod error;
mod info;
mod lvm;
mod recv;
mod send;
#[cfg(test)]
mod sim;
mod stream;
mod utils;
mod vgcfg;

const EXIT_USAGE: u8 = 1;
const EXIT_SETUP: u8 = 2;
const EXIT_RUN: u8 = 3;

/// Incremental backup of LVM thin volumes.
///
/// Changed blocks are found by comparing the thin pool's mapping
/// metadata, so only blocks that were written since the basis snapshot
/// are read and sent.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log debug output; repeat for more.
    #[arg(long, global = true, action = ArgAction::Count)]
    debug: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Writes a backup stream of a thin volume.
    ///
    /// Without a basis every mapped block is sent.  With one, only
    /// blocks that differ from the basis are sent, and a restore needs
    /// a copy of the basis to apply the stream to.
    Send {
        /// Volume group.
        #[arg(short = 'g', long = "vg")]
        vg: String,

        /// Thin volume (usually a snapshot) to back up.
        #[arg(short, long)]
        lv: String,

        /// Earlier snapshot, in the same pool, to diff against.
        #[arg(short = 'i', long = "incremental")]
        basis: Option<String>,

        /// How much of the basis to hash so a restore can detect a
        /// diverged basis: 0 off, 1 first run, 2 one block per run,
        /// 3 every run.
        #[arg(short = 'd', long, default_value = "0", value_parser = parse_detect_level)]
        detect_level: DetectLevel,

        /// Extra `key:value` header line; repeatable.
        #[arg(long = "meta", value_parser = parse_meta)]
        metadata: Vec<(String, String)>,

        /// How the changed blocks are found.
        #[arg(long, value_enum, default_value = "delta")]
        method: DiffMethod,

        /// Include unchanged blocks when hashing the basis.
        #[arg(long)]
        sample_unchanged: bool,

        /// Write the stream here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Restores a backup stream as a new thin volume.
    ///
    /// An incremental stream becomes a snapshot of its basis with the
    /// changed blocks written over it.  Nothing is created until the
    /// stream header and the basis have been checked.
    Recv {
        /// Volume group.
        #[arg(short = 'g', long = "vg")]
        vg: String,

        /// Local copy of the basis the stream was taken against.
        #[arg(short, long)]
        lv: Option<String>,

        /// Pool to create a full stream's volume in.
        #[arg(long)]
        pool: Option<String>,

        /// Name of the new volume, instead of the one in the stream.
        #[arg(long)]
        name: Option<String>,

        /// Skip verifying the basis hashes.
        #[arg(long)]
        no_base_check: bool,

        /// Read the stream from here instead of stdin.
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Describes a backup stream.
    Info {
        /// Read every record, checking the block count.
        #[arg(short, long)]
        verbose: bool,

        /// Print JSON.
        #[arg(long)]
        json: bool,

        file: PathBuf,
    },
    /// Merges incremental streams into one.
    Merge { files: Vec<PathBuf> },
}

fn parse_detect_level(s: &str) -> Result<DetectLevel, String> {
    let level: u8 = s.parse().map_err(|e| format!("{e}"))?;
    DetectLevel::try_from(level)
}

fn parse_meta(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected key:value, got {s:?}"))?;
    let (key, value) = (key.trim(), value.trim());
    StreamHeader::check_metadata(key, value)?;
    Ok((key.to_string(), value.to_string()))
}

fn session_failed(e: SessionError) -> ExitCode {
    error!("{}", e);
    match e.stage {
        Stage::Setup => ExitCode::from(EXIT_SETUP),
        Stage::Run => ExitCode::from(EXIT_RUN),
    }
}

fn open_failed(what: &str, e: io::Error) -> ExitCode {
    error!("Can not open {}: {}", what, e);
    ExitCode::from(EXIT_USAGE)
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.use_stderr() {
                true => ExitCode::from(EXIT_USAGE),
                false => ExitCode::SUCCESS,
            };
        }
    };

    let level = match (cli.quiet, cli.debug) {
        (true, _) => log::LevelFilter::Warn,
        (false, 0) => log::LevelFilter::Info,
        (false, 1) => log::LevelFilter::Debug,
        (false, _) => log::LevelFilter::Trace,
    };
    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .init();

    match cli.command {
        Commands::Send {
            vg,
            lv,
            basis,
            detect_level,
            metadata,
            method,
            sample_unchanged,
            output,
        } => {
            let out: Box<dyn Write> = match output {
                Some(path) => match File::create(&path) {
                    Ok(f) => Box::new(BufWriter::new(f)),
                    Err(e) => return open_failed(&path.display().to_string(), e),
                },
                None => Box::new(BufWriter::new(io::stdout().lock())),
            };
            let opts = SendOptions {
                vg,
                lv,
                basis,
                detect_level,
                method,
                include_unchanged: sample_unchanged,
                metadata,
            };
            match BackupSession::new(&LvmTools, &opts).run(out) {
                Ok(summary) => {
                    info!(
                        "Backup of {} complete: {} blocks, payload CRC32 {:08x}",
                        summary.header.name, summary.stream.blocks, summary.stream.digest
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => session_failed(e),
            }
        }
        Commands::Recv {
            vg,
            lv,
            pool,
            name,
            no_base_check,
            input,
        } => {
            let input: Box<dyn BufRead> = match input {
                Some(path) => match File::open(&path) {
                    Ok(f) => Box::new(BufReader::new(f)),
                    Err(e) => return open_failed(&path.display().to_string(), e),
                },
                None => Box::new(io::stdin().lock()),
            };
            let opts = RecvOptions {
                vg,
                basis: lv,
                pool,
                name,
                verify: !no_base_check,
            };
            match RestoreSession::new(&LvmTools, &opts).run(input) {
                Ok(summary) => {
                    info!(
                        "Restored {}: {} blocks, payload CRC32 {:08x}",
                        summary.name, summary.stream.blocks, summary.stream.digest
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => session_failed(e),
            }
        }
        Commands::Info {
            verbose,
            json,
            file,
        } => {
            let input = match File::open(&file) {
                Ok(f) => BufReader::new(f),
                Err(e) => return open_failed(&file.display().to_string(), e),
            };
            match info::do_info(input, &mut io::stdout().lock(), verbose, json) {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => session_failed(SessionError::run(e)),
            }
        }
        Commands::Merge { .. } => {
            error!("merge is not implemented yet");
            ExitCode::from(EXIT_USAGE)
        }
    }
}
