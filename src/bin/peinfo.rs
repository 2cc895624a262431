//! peinfo - PE image inspector
//!
//! Runs the loader's pre-allocation header validation against a file and
//! prints the layout, section table, and optionally the export and import
//! tables. Useful for checking whether an image would be accepted by the
//! in-memory loader before shipping it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use gateguard::loader::pe::{PeFile, DIR_BASERELOC, DIR_EXPORT, DIR_IMPORT, DIR_TLS};
use gateguard::{GateGuardError, LoadError};

/// Page granularity of the Windows targets these images are linked for.
const PAGE_SIZE: usize = 0x1000;

/// peinfo - PE image inspector
#[derive(Parser, Debug)]
#[command(name = "peinfo")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the PE image to inspect
    image: PathBuf,

    /// List exported symbols
    #[arg(short, long)]
    exports: bool,

    /// List imported libraries
    #[arg(short, long)]
    imports: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt().with_env_filter(filter).with_target(false).init();

    match run(args) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_code(&e)
        }
    }
}

fn run(args: Args) -> Result<(), GateGuardError> {
    tracing::debug!("Inspecting image: {}", args.image.display());
    let data = std::fs::read(&args.image)?;
    let file = PeFile::parse(&data, PAGE_SIZE)?;

    let layout = file.layout();
    let nt = file.nt_headers();
    println!("image:            {}", args.image.display());
    println!("machine:          {:#06x}", nt.file_header.machine);
    println!("kind:             {}", if layout.is_dll { "DLL" } else { "executable" });
    println!("preferred base:   {:#x}", layout.preferred_base);
    println!("size of image:    {:#x}", layout.image_size);
    println!("entry point RVA:  {:#x}", nt.optional_header.address_of_entry_point);
    println!("sections:         {}", file.sections().len());

    println!();
    println!("{:<10} {:>10} {:>10} {:>10}  {}", "name", "rva", "vsize", "raw", "flags");
    for section in file.sections() {
        let name_len = section.name.iter().position(|&b| b == 0).unwrap_or(8);
        let name = String::from_utf8_lossy(&section.name[..name_len]).into_owned();
        println!(
            "{:<10} {:>#10x} {:>#10x} {:>#10x}  {:#010x}",
            name,
            section.virtual_address,
            section.virtual_size(),
            section.size_of_raw_data,
            section.characteristics,
        );
    }

    println!();
    for (label, index) in [
        ("export directory", DIR_EXPORT),
        ("import directory", DIR_IMPORT),
        ("reloc directory", DIR_BASERELOC),
        ("TLS directory", DIR_TLS),
    ] {
        let directory = file.directory(index);
        if directory.size != 0 {
            println!(
                "{:<17} rva {:#x}, {} bytes",
                label, directory.virtual_address, directory.size
            );
        }
    }

    if args.imports {
        println!();
        let libraries = file.import_libraries()?;
        if libraries.is_empty() {
            println!("no imported libraries");
        } else {
            println!("imports:");
            for library in libraries {
                println!("  {}", library);
            }
        }
    }

    if args.exports {
        println!();
        let exports = file.exports()?;
        if exports.is_empty() {
            println!("no exports");
        } else {
            println!("{:>6}  {:>10}  name", "ord", "rva");
            for export in exports {
                println!("{:>6}  {:>#10x}  {}", export.ordinal, export.rva, export.name);
            }
        }
    }

    Ok(())
}

fn exit_code(error: &GateGuardError) -> ExitCode {
    match error {
        GateGuardError::Load(LoadError::BadImage { .. }) => ExitCode::from(2),
        GateGuardError::Load(_) => ExitCode::from(3),
        GateGuardError::Symbol(_) => ExitCode::from(4),
        GateGuardError::System(_) => ExitCode::from(1),
    }
}
