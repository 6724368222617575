use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::Parser;
use log::LevelFilter;

use sms_archive::{run, ExportConfig};

#[derive(Debug, Parser)]
#[command(name = "sms-archive")]
#[command(about = "Export phone-backup messages into per-month text archives")]
struct Cli {
    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Maximum verbosity plus dry run: nothing is written to disk.
    #[arg(long)]
    debug: bool,

    /// Archive output directory.
    output_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let verbosity = if cli.debug { u8::MAX } else { cli.verbose };
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    if let Err(err) = real_main(cli) {
        eprintln!("sms-archive: {err}");
        std::process::exit(1);
    }
}

fn real_main(cli: Cli) -> Result<()> {
    let home = std::env::var("HOME").map_err(|_| anyhow!("HOME is not set"))?;
    let config = ExportConfig::from_home(Path::new(&home), cli.output_dir, cli.debug)?;
    run(&config)?;
    Ok(())
}
