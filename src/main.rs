//! oatx - Dump and build Android ART OAT containers.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use oatx::{DexInput, DumpOptions, InstructionSet, OatVersion, Status};

/// Parse, dump and build Android ART OAT containers.
#[derive(Parser, Debug)]
#[command(name = "oatx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, global = true, default_value = "1")]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse an OAT (or ELF-wrapped OAT) file and print its structure
    Dump {
        /// The OAT file to read
        #[arg(short, long)]
        oat: PathBuf,

        /// Print the per-DEX class-status matrix
        #[arg(long)]
        dump_classes: bool,

        /// Print the type-lookup tables
        #[arg(long)]
        dump_tables: bool,

        /// List classes whose status is below verified
        #[arg(short, long)]
        print_unverified_classes: bool,
    },

    /// Build an OAT file from one or more DEX files
    Build {
        /// The OAT file to write
        #[arg(short, long)]
        oat: PathBuf,

        /// A DEX file to embed (repeatable)
        #[arg(short = 'x', long = "dex", required = true)]
        dex: Vec<PathBuf>,

        /// Location string stored for the matching --dex (repeatable; when
        /// given, the count must match)
        #[arg(short = 'l', long = "dex-location")]
        dex_location: Vec<String>,

        /// OAT format version to emit
        #[arg(long = "oat-version")]
        oat_version: String,

        /// Target architecture
        #[arg(short, long, default_value = "x86")]
        arch: String,

        /// Wrap the OAT data in a minimal ELF shell
        #[arg(long)]
        write_elf: bool,

        /// Boot image recorded in the key-value store and, for version 064,
        /// probed for image header fields
        #[arg(long, default_value = "")]
        art_image_location: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    match cli.command {
        Commands::Dump {
            oat,
            dump_classes,
            dump_tables,
            print_unverified_classes,
        } => cmd_dump(oat, dump_classes, dump_tables, print_unverified_classes),
        Commands::Build {
            oat,
            dex,
            dex_location,
            oat_version,
            arch,
            write_elf,
            art_image_location,
        } => cmd_build(
            oat,
            dex,
            dex_location,
            oat_version,
            arch,
            write_elf,
            art_image_location,
        ),
    }
}

/// Log levels indexed by the verbosity flag; values past the end mean debug.
const LOG_LEVELS: [Level; 4] = [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG];

fn setup_logging(verbosity: u8) {
    let level = LOG_LEVELS[(verbosity as usize).min(LOG_LEVELS.len() - 1)];
    tracing_subscriber::fmt()
        .without_time()
        .with_target(false)
        .with_max_level(level)
        .try_init()
        .ok();
}

fn cmd_dump(
    oat: PathBuf,
    dump_classes: bool,
    dump_tables: bool,
    print_unverified_classes: bool,
) -> Result<()> {
    let file = File::open(&oat).with_context(|| format!("failed to open {}", oat.display()))?;
    let mmap = unsafe { memmap2::Mmap::map(&file) }
        .with_context(|| format!("failed to map {}", oat.display()))?;

    let parsed = oatx::parse(&mmap);
    let opts = DumpOptions {
        dump_classes,
        dump_tables,
        print_unverified_classes,
    };
    print!("{}", oatx::render(&parsed, &opts));

    if parsed.status() != Status::ParseSuccess {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_build(
    oat: PathBuf,
    dex: Vec<PathBuf>,
    dex_location: Vec<String>,
    oat_version: String,
    arch: String,
    write_elf: bool,
    art_image_location: String,
) -> Result<()> {
    let version = OatVersion::from_name(&oat_version)
        .ok_or(oatx::Error::BuildUnsupportedVersion(oat_version))
        .context("valid versions: 045, 064, 079, 088")?;
    let isa = InstructionSet::from_name(&arch)
        .ok_or(oatx::Error::UnknownInstructionSet(arch))
        .context("valid architectures: arm, arm64, thumb2, x86, x86_64, mips, mips64")?;

    let inputs: Vec<DexInput> = if dex_location.is_empty() {
        dex.iter()
            .map(|path| DexInput {
                path: path.clone(),
                location: path.display().to_string(),
            })
            .collect()
    } else {
        if dex_location.len() != dex.len() {
            bail!("number of --dex-location arguments must match number of --dex arguments");
        }
        dex.iter()
            .zip(&dex_location)
            .map(|(path, location)| DexInput {
                path: path.clone(),
                location: location.clone(),
            })
            .collect()
    };

    oatx::build(&oat, &inputs, version, isa, write_elf, &art_image_location)
        .with_context(|| format!("failed to build {}", oat.display()))?;
    Ok(())
}
