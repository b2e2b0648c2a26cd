use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tilt::transcode::{self, Compression, Conversion, ConversionError, PackOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tilt-convert",
    about = "Converts .tilt files between packed (zip) and unpacked (directory) form"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert each path to the other form
    Convert {
        #[command(flatten)]
        pack: PackArgs,
        #[arg(required = true, num_args = 1..)]
        paths: Vec<PathBuf>,
    },
    /// Pack container directories into single files
    Pack {
        #[command(flatten)]
        pack: PackArgs,
        #[arg(required = true, num_args = 1..)]
        paths: Vec<PathBuf>,
    },
    /// Unpack container files into directories
    Unpack {
        #[arg(required = true, num_args = 1..)]
        paths: Vec<PathBuf>,
    },
}

#[derive(Args)]
struct PackArgs {
    /// Deflate members (default: stored)
    #[arg(long)]
    compress: bool,
    /// Deflate level, 0-9; only used with --compress
    #[arg(long)]
    level: Option<i64>,
}

impl PackArgs {
    fn options(&self) -> PackOptions {
        PackOptions {
            compression: Compression::from_flag(self.compress),
            level:       self.level,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut failed = 0usize;
    match Cli::parse().command {

        // ── Convert ──────────────────────────────────────────────────────────
        Commands::Convert { pack, paths } => {
            let opts = pack.options();
            for path in &paths {
                report(path, transcode::convert(path, &opts), &mut failed);
            }
        }

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { pack, paths } => {
            let opts = pack.options();
            for path in &paths {
                let result = transcode::pack(path, &opts).map(|()| Conversion::Packed);
                report(path, result, &mut failed);
            }
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { paths } => {
            for path in &paths {
                let result = transcode::unpack(path).map(|compressed| Conversion::Unpacked { compressed });
                report(path, result, &mut failed);
            }
        }
    }

    if failed == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn report(path: &Path, result: Result<Conversion, ConversionError>, failed: &mut usize) {
    match result {
        Ok(Conversion::Packed) => {
            println!("Converted {} to zip format", path.display());
        }
        Ok(Conversion::Unpacked { compressed }) => {
            let note = if compressed { " (was compressed)" } else { "" };
            println!("Converted {} to directory format{note}", path.display());
        }
        Err(e) => {
            eprintln!("ERROR: {}: {e}", path.display());
            *failed += 1;
        }
    }
}
