//! `plfx-cli` — the one non-core collaborator this repo owns: turns a path
//! to a `.plf` file on disk into an `export.txt` beside it.
//!
//! File discovery, a GUI file picker, and writing anything other than the
//! flat `<name>, <address>` text export are left to whatever calls this
//! binary; it is deliberately thin, wiring [`plf_extract::Pipeline`] to
//! stdio and the filesystem.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use plf_extract::{Config, Pipeline};

/// Extract PLC block reference addresses from a Siemens TIA Portal `.plf` container.
#[derive(Parser, Debug)]
#[command(name = "plfx-cli", version, about)]
struct Cli {
    /// Path to the input `.plf` file.
    path: PathBuf,

    /// Enable debug-level logging (otherwise only warnings and above).
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli.path) {
        Ok(count) => {
            tracing::info!(count, "export complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("plfx-cli: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(path: &PathBuf) -> plf_extract::Result<usize> {
    let bytes = std::fs::read(path)?;
    let (_pipeline, addresses) = Pipeline::run(&bytes, &Config::default());

    let out_path = path.with_file_name("export.txt");
    let mut out = std::io::BufWriter::new(std::fs::File::create(&out_path)?);
    for address in &addresses {
        writeln!(out, "{}, {}", address.name, address.reference_address)?;
    }
    out.flush()?;

    Ok(addresses.len())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
