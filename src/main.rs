//! stemforge CLI - build a vSphere stemcell from a base VHD and a delta

use std::path::{Path, PathBuf};
use std::process::{self, ExitCode};
use std::thread;

use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use tracing_subscriber::EnvFilter;

use stemforge::{Config, Error, ErrorClass, IoResultExt, Ovftool, Pipeline, StopSignal};

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "stemforge")]
#[command(about = "build a vSphere stemcell from a base VHD and an rdiff delta")]
#[command(after_help = "example: stemforge --vhd base.vhd -d patch.delta -v 1.2 -o out -x")]
struct Cli {
    /// VHD file to patch
    #[arg(long, value_name = "FILE")]
    vhd: PathBuf,

    /// patch file applied to the VHD
    #[arg(short, long, value_name = "FILE")]
    delta: PathBuf,

    /// stemcell version, [DIGITS].[DIGITS] (e.g. 123.01)
    #[arg(short = 'v', long = "version")]
    version: Option<String>,

    /// output directory, default is the current directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// patch file is gzip compressed
    #[arg(short = 'x', long)]
    gzip: bool,

    /// config file (TOML)
    #[arg(long, value_name = "FILE", env = "STEMFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// path to ovftool, default is to search for it
    #[arg(long, value_name = "FILE")]
    ovftool: Option<PathBuf>,

    /// do not require the delta's target checksum
    #[arg(long)]
    no_verify: bool,

    /// print debugging information
    #[arg(long)]
    debug: bool,

    /// colorize log output
    #[arg(long)]
    color: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.color);

    match run(cli) {
        Ok(stemcell) => {
            println!("created stemcell: {}", stemcell.display());
            ExitCode::SUCCESS
        }
        Err(e) if e.class() == ErrorClass::Interrupted => {
            eprintln!("interrupted - cleaned up");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool, color: bool) {
    let default = if debug { "stemforge=debug" } else { "stemforge=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(color)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> stemforge::Result<PathBuf> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(version) = cli.version {
        config.version = version;
    }
    if let Some(output) = cli.output {
        config.output_dir = output;
    }
    if cli.gzip {
        config.gzip_delta = true;
    }
    if cli.no_verify {
        config.verify_checksum = false;
    }
    if let Some(path) = cli.ovftool {
        config.converter = Some(path);
    }

    validate(&config, &cli.vhd, &cli.delta)?;

    let converter = match &config.converter {
        Some(path) => Ovftool::new(path),
        None => Ovftool::locate()?,
    };
    tracing::debug!(ovftool = %converter.path().display(), "using conversion tool");

    let stop = StopSignal::new();
    watch_signals(stop.clone())?;

    let mut pipeline = Pipeline::new(config, converter, stop);
    pipeline.run(&cli.vhd, &cli.delta)
}

// report every bad argument at once
fn validate(config: &Config, vhd: &Path, delta: &Path) -> stemforge::Result<()> {
    let mut problems = Vec::new();

    for (flag, path) in [("vhd", vhd), ("delta", delta)] {
        match path.metadata() {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => problems.push(format!("invalid [{}]: not a regular file: {}", flag, path.display())),
            Err(e) => problems.push(format!("invalid [{}]: {}: {}", flag, path.display(), e)),
        }
    }

    match config.validate() {
        Ok(()) => {}
        Err(Error::InvalidConfig(more)) => problems.extend(more),
        Err(e) => return Err(e),
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidConfig(problems))
    }
}

// signals are blocked here, before any other thread exists, so every thread
// inherits the mask and only the watcher receives them
fn watch_signals(stop: StopSignal) -> stemforge::Result<()> {
    let mut set = SigSet::empty();
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        set.add(signal);
    }
    set.thread_block()
        .map_err(std::io::Error::from)
        .with_path("<signals>")?;

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || loop {
            match set.wait() {
                Ok(signal) if stop.raise() => {
                    tracing::warn!(?signal, "received signal, cleaning up");
                }
                Ok(signal) => {
                    eprintln!("received second signal ({:?}), exiting now", signal);
                    process::exit(1);
                }
                Err(e) => {
                    tracing::warn!("waiting for signals: {}", e);
                    return;
                }
            }
        })
        .with_path("<signals>")?;
    Ok(())
}
