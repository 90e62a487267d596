//! A command-line tool for building UBI images and pulling volumes back out of raw flash dumps.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::num::NonZeroU32;
use std::path::PathBuf;

use ubi_engine::ubi::{
    reconcile::GapPolicy, scan_image, vtbl::VolTableRecord, Geometry, ImageReader, ScanConfig,
    Ubinizer, VolType, VolumeDescriptor,
};

#[derive(Args, Debug)]
struct FlashOptions {
    /// Size of a physical eraseblock, in bytes
    #[clap(long)]
    peb_size: u32,

    /// Size of the minimum I/O unit, in bytes
    #[clap(long, default_value = "2048")]
    min_io_size: NonZeroU32,

    /// Offset of the VID header, if not at the first I/O unit after the EC header
    #[clap(long)]
    vid_hdr_offset: Option<u32>,
}

impl FlashOptions {
    fn geometry(&self) -> Result<Geometry> {
        let geometry = Geometry::new(self.peb_size, self.min_io_size)?;
        Ok(match self.vid_hdr_offset {
            Some(offset) => geometry.vid_hdr_offset(offset)?,
            None => geometry,
        })
    }

    /// Scans learn the header offsets from the flash itself, unless they were given
    fn scan_config(&self) -> Result<ScanConfig> {
        Ok(match self.vid_hdr_offset {
            Some(_) => ScanConfig::from_geometry(&self.geometry()?),
            None => ScanConfig::new(self.peb_size),
        })
    }
}

#[derive(Args, Debug, Clone)]
#[group(required = true, id = "vol-type")]
struct UbiVolume {
    /// The type of the volume
    #[clap(long, group = "vol-type")]
    r#static: bool,
    #[clap(long, group = "vol-type")]
    dynamic: bool,

    /// The volume ID
    #[clap(long)]
    id: Option<u32>,

    /// The name of the volume
    #[clap(long)]
    name: Option<String>,

    /// Alignment of the volume's LEBs
    #[clap(long)]
    align: Option<NonZeroU32>,

    /// Erase counter to write into every PEB
    #[clap(long, default_value = "0")]
    ec: u64,

    /// Set the autoresize flag in the volume table
    #[clap(long)]
    autoresize: bool,

    /// The path to the volume contents
    image: PathBuf,
}

impl UbiVolume {
    fn open(&self) -> Result<(VolumeDescriptor, File)> {
        let vol_type = match self.dynamic {
            true => VolType::Dynamic,
            false => VolType::Static,
        };

        let file = File::open(&self.image)
            .with_context(|| format!("could not open {}", self.image.display()))?;
        let size = file.metadata()?.len();

        let mut descriptor = VolumeDescriptor::new(vol_type).size(size).ec(self.ec);
        if let Some(id) = self.id {
            descriptor = descriptor.id(id);
        }
        if let Some(name) = &self.name {
            descriptor = descriptor.name(name.as_str());
        }
        if let Some(align) = self.align {
            descriptor = descriptor.align(align);
        }
        if self.autoresize {
            descriptor = descriptor.autoresize();
        }

        Ok((descriptor, file))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build an image holding one volume and the layout volume
    Generate {
        #[clap(flatten)]
        volume: UbiVolume,

        /// Where to write the image
        #[clap(long, short)]
        output: PathBuf,
    },

    /// Print the content of each PEB, every format error found, and which PEB holds each LEB
    Scan {
        /// PEBs to treat as bad
        #[clap(long)]
        bad_block: Vec<u32>,

        /// The raw image to scan
        image: PathBuf,
    },

    /// Extract the contents of one volume
    Rebuild {
        /// The volume ID
        #[clap(long)]
        id: u32,

        /// Fill missing LEBs with erased bytes instead of failing
        #[clap(long)]
        pad_gaps: bool,

        /// Where to write the volume contents
        #[clap(long, short)]
        output: PathBuf,

        /// The raw image to read
        image: PathBuf,
    },
}

impl Command {
    fn execute(self, flash: &FlashOptions) -> Result<()> {
        let peb_size = flash.peb_size;

        match self {
            Command::Generate { volume, output } => {
                let geometry = flash.geometry()?;
                let (descriptor, file) = volume.open()?;
                let mut sink = BufWriter::new(File::create(output)?);

                let table = Ubinizer::new(geometry)
                    .volume(descriptor, BufReader::new(file))
                    .write_image(&mut sink)?;
                sink.flush()?;

                for (id, record) in table.records().iter().enumerate() {
                    if let Some(record) = record {
                        print_record(id, record);
                    }
                }
            }

            Command::Scan { bad_block, image } => {
                let mut config = flash.scan_config()?;
                for pnum in bad_block {
                    config = config.bad_block(pnum);
                }

                let file = File::open(&image)?;
                config = config.peb_count(peb_count(file.metadata()?.len(), peb_size)?);

                let scan = scan_image(BufReader::new(file), &config)?;
                for (i, content) in scan.ebt.iter().enumerate() {
                    println!("{i:4} => {content:?}");
                }
                for issue in &scan.issues {
                    println!("{issue}");
                }
                print!("{}", scan.reconciler);

                let reader = ImageReader::new(File::open(&image)?, peb_size);
                match scan.reconciler.volume_table(reader) {
                    Ok(records) => {
                        for (id, record) in records.iter().enumerate() {
                            match record {
                                Ok(Some(record)) => print_record(id, record),
                                Ok(None) => {}
                                Err(e) => println!("volume {id}: {e}"),
                            }
                        }
                    }
                    Err(e) => println!("no volume table: {e}"),
                }
            }

            Command::Rebuild {
                id,
                pad_gaps,
                output,
                image,
            } => {
                let config = flash.scan_config()?;
                let scan = scan_image(BufReader::new(File::open(&image)?), &config)?;

                let policy = match pad_gaps {
                    true => GapPolicy::Pad,
                    false => GapPolicy::Fail,
                };
                let reader = ImageReader::new(File::open(&image)?, peb_size);
                let mut sink = BufWriter::new(File::create(output)?);
                let report = scan
                    .reconciler
                    .rebuild_volume(id, reader, &mut sink, policy)?;
                sink.flush()?;

                println!(
                    "Wrote {} bytes from {} LEBs ({} padded)",
                    report.bytes,
                    report.lebs,
                    report.padded.len()
                );
            }
        };

        Ok(())
    }
}

/// How many whole PEBs an image of `len` bytes holds
fn peb_count(len: u64, peb_size: u32) -> Result<u32> {
    let count = len
        .checked_div(u64::from(peb_size))
        .context("PEB size must not be zero")?;
    Ok(u32::try_from(count)?)
}

fn print_record(id: usize, record: &VolTableRecord) {
    println!(
        "volume {id}: {:?} {:?}, {} PEBs, alignment {}",
        record.vol_type, record.name, record.reserved_pebs, record.alignment
    );
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The flash the image is for
    #[clap(flatten)]
    flash: FlashOptions,

    /// The operation to perform
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let result = args.cmd.execute(&args.flash);
    howudoin::disable();
    result
}

#[test]
fn test_peb_count() {
    assert_eq!(peb_count(5 * 1152 + 17, 1152).ok(), Some(5));
    assert!(peb_count(4096, 0).is_err());
    assert!(peb_count(u64::MAX, 1).is_err());
}
