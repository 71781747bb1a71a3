mod info;
mod merge;

use std::fmt::Display;
use std::io::stderr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pds::modis::{APID_MAX, APID_MIN};
use pds::spacepacket::Apid;
use pds::timecode::{DateTime, TimeWindow, Timestamp};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge MODIS packets for a single APID from multiple PDS files.
    ///
    /// Packets are written in time order, dropping duplicates and any packets with a bad
    /// checksum. Packets within the time window are merged, where the window includes
    /// <start> and excludes <end>.
    Merge {
        /// Window start (YYYY/MM/DD,hh:mm:ss), or - for no start.
        #[arg(value_parser = parse_bound, allow_hyphen_values = true)]
        start: Bound,

        /// Window end (YYYY/MM/DD,hh:mm:ss), or - for no end.
        #[arg(value_parser = parse_bound, allow_hyphen_values = true)]
        end: Bound,

        /// APID to merge.
        #[arg(value_parser = parse_apid)]
        apid: Apid,

        /// Input PDS files.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output file path.
        #[arg(short, long, value_name = "path")]
        output: PathBuf,

        /// Delete output file if it already exists
        #[arg(long, action)]
        clobber: bool,

        /// Read each input on its own thread.
        #[arg(long, action)]
        threads: bool,
    },
    /// Show statistics for a PDS file.
    Info {
        /// Input PDS file
        input: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: info::Format,
    },
}

/// Exit status classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Io = 5,
    Resource = 10,
    Usage = 20,
    Internal = 30,
}

/// Error context marking the exit status a failure should produce.
#[derive(Debug)]
struct Failure {
    status: Status,
    msg: String,
}

impl Failure {
    fn io<S: Into<String>>(msg: S) -> Self {
        Failure {
            status: Status::Io,
            msg: msg.into(),
        }
    }

    fn resource<S: Into<String>>(msg: S) -> Self {
        Failure {
            status: Status::Resource,
            msg: msg.into(),
        }
    }

    fn usage<S: Into<String>>(msg: S) -> Self {
        Failure {
            status: Status::Usage,
            msg: msg.into(),
        }
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.msg)
    }
}

impl std::error::Error for Failure {}

fn exit_status(err: &anyhow::Error) -> Status {
    if let Some(failure) = err.downcast_ref::<Failure>() {
        return failure.status;
    }
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<pds::Error>() {
            return match err {
                pds::Error::Truncated { .. } | pds::Error::Io(_) => Status::Io,
                pds::Error::InvalidDate(_)
                | pds::Error::InvalidWindow(_)
                | pds::Error::InvalidApid(_) => Status::Usage,
                _ => Status::Internal,
            };
        }
        if cause.is::<std::io::Error>() {
            return Status::Io;
        }
    }
    Status::Internal
}

/// One end of a time window, `None` if unbounded.
#[derive(Debug, Clone, Copy)]
struct Bound(Option<Timestamp>);

fn parse_bound(s: &str) -> Result<Bound, String> {
    if s == "-" {
        return Ok(Bound(None));
    }
    let rx = regex::Regex::new(r"^(\d{4})/(\d{1,2})/(\d{1,2}),(\d{1,2}):(\d{1,2}):(\d{1,2})$")
        .expect("regex to compile");
    let Some(cap) = rx.captures(s) else {
        return Err("expected YYYY/MM/DD,hh:mm:ss or -".to_string());
    };
    let num = |i: usize| -> Result<u32, String> {
        cap[i].parse::<u32>().map_err(|e| format!("{e}"))
    };
    let year = i32::try_from(num(1)?).map_err(|e| e.to_string())?;
    DateTime::new(year, num(2)?, num(3)?, num(4)?, num(5)?, num(6)?)
        .and_then(|dt| dt.timestamp())
        .map(|ts| Bound(Some(ts)))
        .map_err(|e| e.to_string())
}

fn parse_apid(s: &str) -> Result<Apid, String> {
    let apid: Apid = s.parse().map_err(|_| format!("{s} is not a valid APID"))?;
    if !(APID_MIN..=APID_MAX).contains(&apid) {
        return Err(pds::Error::InvalidApid(apid).to_string());
    }
    Ok(apid)
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Merge {
            start,
            end,
            apid,
            inputs,
            output,
            clobber,
            threads,
        } => {
            if !clobber && output.exists() {
                return Err(Failure::usage(format!("{output:?} exists; use --clobber")).into());
            }
            let window = TimeWindow::new(start.0, end.0)?;
            merge::merge(&inputs, &output, apid, window, threads)
        }
        Commands::Info { input, format } => info::info(&input, &format),
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(Status::Usage as u8)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .without_time()
        .with_env_filter(
            EnvFilter::try_from_env("PDS_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_status(&err) as u8)
        }
    }
}
