use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use memmap2::{Mmap, MmapOptions};

use crab::{CrabError, CrabFile, DataSource, FileFlags, Purpose, SaveFlags, CRAB_SCHEMA_URL};

#[derive(Parser)]
#[command(name = "crab", version, about = "Inspect and edit CRAB container files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new, empty, CRAB file.
    New { file: PathBuf },
    /// List sections of a CRAB file.
    List { file: PathBuf },
    /// Add sections to a CRAB file.
    Add {
        file: PathBuf,
        /// Schema URL for the added sections.
        #[arg(long)]
        schema: Option<String>,
        /// Purpose code for the added sections.
        #[arg(long)]
        purpose: Option<u16>,
        /// Blob files to attach, one section each; an empty argument
        /// adds a section with no data.
        #[arg(required = true)]
        blobs: Vec<String>,
    },
    /// Assign schema and purpose to a section of a CRAB file.
    Repurpose {
        file: PathBuf,
        section: u32,
        schema: String,
        purpose: u16,
    },
    /// Assign data to a section of a CRAB file.
    Store {
        file: PathBuf,
        section: u32,
        /// Blob file to attach; an empty argument clears the data.
        blob: String,
    },
    /// Remove data from a section of a CRAB file.
    Wipe { file: PathBuf, section: u32 },
    /// Get contents of a section of a CRAB file.
    Dump {
        file: PathBuf,
        section: u32,
        out: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("error")).init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
    };
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn run(command: Command) -> crab::Result<()> {
    match command {
        Command::New { file } => {
            let mut file = CrabFile::open(file, FileFlags::PERROR | FileFlags::NEW)?;
            file.save(SaveFlags::empty())
        }
        Command::List { file } => {
            let file = CrabFile::open(file, FileFlags::PERROR)?;
            println!("{:>4}  {:<42}  {:>5}  {:>10}", "#", "Schema", "P", "sz");
            for i in 0..file.num_sections() {
                let section = file.section(i)?;
                println!(
                    "{:>4}  {:<42}  {:>5}  {:>10}",
                    section.number(),
                    file.section_schema(i)?,
                    section.purpose().to_u16(),
                    section.data_size()
                );
            }
            Ok(())
        }
        Command::Add {
            file,
            schema,
            purpose,
            blobs,
        } => {
            let purpose =
                Purpose::from_u16(purpose.unwrap_or(if schema.is_some() { 0 } else { 1 }));
            let schema = schema.as_deref().unwrap_or(CRAB_SCHEMA_URL);
            let mut file = CrabFile::open(file, FileFlags::PERROR)?;
            for blob in &blobs {
                let index = file.add_section()?;
                file.set_schema_and_purpose(index, schema, purpose)?;
                if !blob.is_empty() {
                    let map = mmap_blob(Path::new(blob))?;
                    file.set_section_data(index, DataSource::Copied(&map[..]))?;
                }
            }
            file.save(SaveFlags::empty())
        }
        Command::Repurpose {
            file,
            section,
            schema,
            purpose,
        } => {
            let mut file = CrabFile::open(file, FileFlags::PERROR)?;
            file.set_schema_and_purpose(section, &schema, Purpose::from_u16(purpose))?;
            file.save(SaveFlags::empty())
        }
        Command::Store {
            file,
            section,
            blob,
        } => {
            let mut file = CrabFile::open(file, FileFlags::PERROR)?;
            if blob.is_empty() {
                file.set_section_data(section, DataSource::Copied(&[]))?;
            } else {
                let map = mmap_blob(Path::new(&blob))?;
                file.set_section_data(section, DataSource::Copied(&map[..]))?;
            }
            file.save(SaveFlags::empty())
        }
        Command::Wipe { file, section } => {
            let mut file = CrabFile::open(file, FileFlags::PERROR)?;
            file.set_section_data(section, DataSource::Copied(&[]))?;
            file.set_schema_and_purpose(section, CRAB_SCHEMA_URL, Purpose::Error)?;
            file.save(SaveFlags::empty())
        }
        Command::Dump { file, section, out } => {
            let file = CrabFile::open(file, FileFlags::PERROR)?;
            let data = file.section_data(section)?;
            fs::write(out, data).map_err(|e| fail(CrabError::io("fopen", e)))
        }
    }
}

/// Maps a blob file read-only, the same way the library maps its own
/// images.
fn mmap_blob(path: &Path) -> crab::Result<Mmap> {
    let fd = File::open(path).map_err(|e| fail(CrabError::io("open", e)))?;
    unsafe { MmapOptions::new().map_copy_read_only(&fd) }
        .map_err(|e| fail(CrabError::io("mmap", e)))
}

/// Logs errors the library did not already report through `PERROR`.
fn fail(err: CrabError) -> CrabError {
    log::error!("{}", err);
    err
}
