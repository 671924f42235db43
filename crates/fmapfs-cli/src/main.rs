#![forbid(unsafe_code)]

mod logging;

use anyhow::{Context, Result, bail};
use fmapfs_core::{FmapFs, MountError};
use fmapfs_fuse::MountOptions;
use fmapfs_ondisk::Fmap;
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Exit status for bad command lines and mount failures.
const EXIT_USAGE: i32 = 1;
/// Exit status when the image cannot be read or is not a valid FMAP image.
const EXIT_BAD_IMAGE: i32 = 2;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Help,
    Inspect {
        image: PathBuf,
        json: bool,
    },
    Mount {
        image: PathBuf,
        mountpoint: PathBuf,
        options: MountFlags,
    },
}

/// Flags accepted by the mount form.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct MountFlags {
    foreground: bool,
    read_only: bool,
    allow_other: bool,
    auto_unmount: bool,
}

impl MountFlags {
    fn apply_o(&mut self, list: &str) -> Result<()> {
        for opt in list.split(',').filter(|opt| !opt.is_empty()) {
            match opt {
                "ro" => self.read_only = true,
                "rw" => self.read_only = false,
                "allow_other" => self.allow_other = true,
                "auto_unmount" => self.auto_unmount = true,
                _ => bail!("unsupported mount option: {opt}"),
            }
        }
        Ok(())
    }

    fn to_mount_options(self) -> MountOptions {
        MountOptions {
            read_only: self.read_only,
            allow_other: self.allow_other,
            auto_unmount: self.auto_unmount,
            owner: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct InspectArea {
    name: String,
    offset: u32,
    size: u32,
    flags: Vec<&'static str>,
    /// Decoder subtrees attached under the area directory.
    decoded: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    name: String,
    version: String,
    location: usize,
    base: u64,
    image_size: u32,
    areas: Vec<InspectArea>,
}

fn main() {
    logging::init_tracing();
    if let Err(error) = run(env::args().skip(1)) {
        eprintln!("error: {error:#}");
        std::process::exit(exit_code(&error));
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<MountError>().is_some() {
        EXIT_BAD_IMAGE
    } else {
        EXIT_USAGE
    }
}

fn run(args: impl Iterator<Item = String>) -> Result<()> {
    match parse_args(args)? {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Inspect { image, json } => inspect(&image, json),
        Command::Mount {
            image,
            mountpoint,
            options,
        } => mount_cmd(&image, &mountpoint, options),
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let Some(first) = args.next() else {
        print_usage();
        bail!("missing <image> and <mountpoint>");
    };

    match first.as_str() {
        "--help" | "-h" => return Ok(Command::Help),
        "inspect" => {
            let mut image = None;
            let mut json = false;
            for arg in args {
                match arg.as_str() {
                    "--json" => json = true,
                    _ if image.is_none() && !arg.starts_with('-') => image = Some(arg),
                    _ => bail!("unexpected inspect argument: {arg}"),
                }
            }
            let Some(image) = image else {
                bail!("inspect requires an <image> argument");
            };
            return Ok(Command::Inspect {
                image: PathBuf::from(image),
                json,
            });
        }
        _ => {}
    }

    let mut flags = MountFlags::default();
    let mut positional = Vec::new();
    let mut args = std::iter::once(first).chain(args);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(Command::Help),
            "-f" => flags.foreground = true,
            "-o" => {
                let Some(list) = args.next() else {
                    bail!("-o requires an option list");
                };
                flags.apply_o(&list)?;
            }
            _ if arg.starts_with("-o") => flags.apply_o(&arg[2..])?,
            _ if arg.starts_with('-') => bail!("unknown flag: {arg}"),
            _ => positional.push(arg),
        }
    }

    let [image, mountpoint]: [String; 2] = positional.try_into().map_err(|rest: Vec<String>| {
        anyhow::anyhow!("expected <image> <mountpoint>, got {} arguments", rest.len())
    })?;
    Ok(Command::Mount {
        image: PathBuf::from(image),
        mountpoint: PathBuf::from(mountpoint),
        options: flags,
    })
}

fn print_usage() {
    println!("fmapfs\n");
    println!("USAGE:");
    println!("  fmapfs [-f] [-o opt[,opt]]... <image> <mountpoint>");
    println!("  fmapfs inspect <image> [--json]");
    println!();
    println!("MOUNT OPTIONS:");
    println!("  -f             run in the foreground (always the case; accepted for compatibility)");
    println!("  -o ro          mount read-only");
    println!("  -o allow_other allow access by other users");
    println!("  -o auto_unmount unmount when the process exits");
    println!();
    println!("Set {}=debug for verbose logs.", logging::LOG_ENV);
}

fn open_image(path: &Path) -> Result<FmapFs> {
    FmapFs::open(path).with_context(|| format!("failed to open FMAP image {}", path.display()))
}

fn inspect_output(fs: &FmapFs) -> InspectOutput {
    let fmap: &Fmap = fs.fmap();
    let areas = fmap
        .areas
        .iter()
        .map(|area| {
            let name = area.name_str();
            let decoded = fs
                .tree()
                .lookup_path(&format!("/areas/{name}"))
                .and_then(|dir| fs.tree().get(dir))
                .and_then(|node| node.children())
                .map(|children| children.keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
                .into_iter()
                .filter(|child| child != "raw")
                .collect();
            InspectArea {
                name,
                offset: area.offset,
                size: area.size,
                flags: area.flags.names(),
                decoded,
            }
        })
        .collect();
    InspectOutput {
        name: fmap.header.name_str(),
        version: format!("{}.{}", fmap.header.ver_major, fmap.header.ver_minor),
        location: fmap.header.location,
        base: fmap.header.base,
        image_size: fmap.header.image_size,
        areas,
    }
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let fs = open_image(path)?;
    let output = inspect_output(&fs);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }

    println!("fmap: {} v{}", output.name, output.version);
    println!("location: {:#x}", output.location);
    println!("base: {:#x}", output.base);
    println!("image_size: {:#x}", output.image_size);
    println!("areas: {}", output.areas.len());
    for area in &output.areas {
        let mut notes = area.flags.join(",");
        if !area.decoded.is_empty() {
            if !notes.is_empty() {
                notes.push(' ');
            }
            notes.push_str(&format!("[{}]", area.decoded.join(",")));
        }
        println!(
            "  {:#010x} {:#010x} {:<32} {notes}",
            area.offset, area.size, area.name
        );
    }
    Ok(())
}

fn mount_cmd(image: &Path, mountpoint: &Path, flags: MountFlags) -> Result<()> {
    let fs = open_image(image)?;
    info!(
        image = %image.display(),
        mountpoint = %mountpoint.display(),
        foreground = flags.foreground,
        read_only = flags.read_only,
        "mounting FMAP image"
    );
    eprintln!(
        "Mounting {} ({} areas) at {}",
        image.display(),
        fs.fmap().areas.len(),
        mountpoint.display()
    );

    fmapfs_fuse::mount(Arc::new(fs), mountpoint, &flags.to_mount_options())
        .with_context(|| format!("FUSE mount failed at {}", mountpoint.display()))?;
    Ok(())
}
