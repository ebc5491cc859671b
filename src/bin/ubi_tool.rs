//! A command-line front end to the UBI layer.
//!
//! It attaches either a simulated NAND image or (on Linux) a real MTD device, so that reads,
//! writes and atomic changes can be exercised by hand and the resulting image inspected.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[cfg(target_os = "linux")]
use ubi_ftl::nand::mtd::MtdNand;
use ubi_ftl::{
    nand::{Nand, NandLayout, SimNand},
    ubi::{scan_all, Ubi, UbiConfig, UbiIo, VolType, VolumeInfo},
    util::ReadExt,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate, as BLOCKSxPAGESxBYTES
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }

            NandImpl::Sim(Arc::new(sim))
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, sim: Option<Arc<SimNand>>) -> Result<()> {
        if self.sim_write {
            if let (Some(path), Some(sim)) = (&self.sim_path, sim) {
                sim.save(&mut File::create(path)?)?;
            }
        }

        Ok(())
    }
}

enum NandImpl {
    Sim(Arc<SimNand>),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

/// One volume table entry, as `ID:dynamic|static:RESERVED_PEBS[:NAME]`
#[derive(Debug, Clone)]
struct VolumeArg(VolumeInfo);

impl FromStr for VolumeArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.splitn(4, ':').collect();
        let [vol_id, vol_type, reserved, rest @ ..] = fields.as_slice() else {
            return Err(anyhow!("expected ID:TYPE:RESERVED[:NAME], got {s:?}"));
        };

        let vol_type = match *vol_type {
            "dynamic" => VolType::Dynamic,
            "static" => VolType::Static,
            other => return Err(anyhow!("unknown volume type {other:?}")),
        };

        let mut info = VolumeInfo::new(vol_id.parse()?, vol_type, reserved.parse()?);
        if let Some(name) = rest.first() {
            info = info.name(*name);
        }
        Ok(Self(info))
    }
}

#[derive(Args, Debug)]
struct UbiOptions {
    /// A volume of the volume table, as ID:dynamic|static:RESERVED_PEBS[:NAME]; may be repeated
    #[clap(long = "volume")]
    volumes: Vec<VolumeArg>,

    /// Erase counter difference that triggers wear-leveling
    #[clap(long)]
    wl_threshold: Option<u64>,

    /// PEBs per 1024 to reserve for bad-block handling
    #[clap(long)]
    beb_limit: Option<u32>,
}

impl UbiOptions {
    fn config(&self) -> UbiConfig {
        let defaults = UbiConfig::default();
        UbiConfig {
            wl_threshold: self.wl_threshold.unwrap_or(defaults.wl_threshold),
            beb_limit_per1024: self.beb_limit.unwrap_or(defaults.beb_limit_per1024),
            ..defaults
        }
    }

    fn volumes(&self) -> Vec<VolumeInfo> {
        self.volumes.iter().map(|arg| arg.0.clone()).collect()
    }
}

#[derive(Args, Debug)]
struct Leb {
    /// The volume ID
    vol_id: u32,

    /// The LEB number within the volume
    lnum: u32,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the headers found in each PEB; this is a read-only operation
    Scan,

    /// Attach, and print a summary of the device and its volumes
    Info,

    /// Read from an LEB to stdout
    Read {
        #[clap(flatten)]
        leb: Leb,

        #[clap(long, default_value_t = 0)]
        offset: usize,

        /// Bytes to read; the rest of the LEB by default
        #[clap(long)]
        len: Option<usize>,
    },

    /// Write stdin into an LEB, which must still be erased from `offset` on
    Write {
        #[clap(flatten)]
        leb: Leb,

        #[clap(long, default_value_t = 0)]
        offset: usize,
    },

    /// Replace the contents of an LEB with stdin, atomically
    Change {
        #[clap(flatten)]
        leb: Leb,
    },

    /// Unmap an LEB
    Unmap {
        #[clap(flatten)]
        leb: Leb,
    },

    /// Replace the contents of a whole volume with stdin
    Update {
        /// The volume ID
        vol_id: u32,
    },
}

impl Command {
    fn execute<N: Nand + 'static>(self, nand: N, ubi_opts: &UbiOptions) -> Result<()> {
        if let Command::Scan = self {
            let io = UbiIo::new(nand)?;
            for (i, content) in scan_all(&io)?.iter().enumerate() {
                println!("{i:4} => {content:?}");
            }
            return Ok(());
        }

        let ubi = Ubi::attach(nand, ubi_opts.volumes(), ubi_opts.config())?;

        match self {
            Command::Scan => unreachable!(),

            Command::Info => {
                println!("{:#?}", ubi.device_info());
                println!("{:#?}", ubi.wl_stats());
                for vol_id in ubi.volume_ids() {
                    println!("{:#?}", ubi.volume_status(vol_id)?);
                }
            }

            Command::Read { leb, offset, len } => {
                let usable = ubi.volume_status(leb.vol_id)?.usable_leb_size;
                let len = len.unwrap_or(usable.saturating_sub(offset));
                let mut buf = vec![0u8; len];
                ubi.read(leb.vol_id, leb.lnum, offset, &mut buf)?;
                std::io::stdout().write_all(&buf)?;
            }

            Command::Write { leb, offset } => {
                let usable = ubi.volume_status(leb.vol_id)?.usable_leb_size;
                let data = read_stdin(usable.saturating_sub(offset))?;
                ubi.write(leb.vol_id, leb.lnum, offset, &data)?;
            }

            Command::Change { leb } => {
                let usable = ubi.volume_status(leb.vol_id)?.usable_leb_size;
                let data = read_stdin(usable)?;
                ubi.atomic_change(leb.vol_id, leb.lnum, &data)?;
            }

            Command::Unmap { leb } => ubi.unmap(leb.vol_id, leb.lnum)?,

            Command::Update { vol_id } => {
                let status = ubi.volume_status(vol_id)?;
                let size = status.usable_leb_size * status.info.reserved_pebs as usize;
                let data = read_stdin(size)?;
                ubi.update_volume(vol_id, &data)?;
                if !ubi.check_volume(vol_id)? {
                    return Err(anyhow!("volume {vol_id} does not read back correctly"));
                }
            }
        }

        ubi.close()?;
        Ok(())
    }
}

fn read_stdin(limit: usize) -> Result<Vec<u8>> {
    Ok(std::io::stdin().lock().read_bounded(limit)?)
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    #[clap(flatten)]
    ubi: UbiOptions,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    howudoin::init(howudoin::consumers::TermLine::default());

    match args.nand.open()? {
        NandImpl::Sim(sim) => {
            args.cmd
                .execute(sim.clone(), &args.ubi)
                .context("command failed")?;
            args.nand.cleanup(Some(sim))?;
        }

        #[cfg(target_os = "linux")]
        NandImpl::Mtd(mtd) => {
            args.cmd.execute(mtd, &args.ubi).context("command failed")?;
            args.nand.cleanup(None)?;
        }
    }

    Ok(())
}
