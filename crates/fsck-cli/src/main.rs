#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use fsck_block::{ByteBlockDevice, FileByteDevice};
use fsck_core::sweep::{SweepReport, Sweeper};
use fsck_core::{ObjectMap, ObjectReader, OmapTable};
use fsck_error::{EXIT_CLEAN, EXIT_OPERATIONAL, EXIT_UNCORRECTED, FsckError};
use fsck_ondisk::{KeyFormat, ObjectHeader, OwnedKey, hash_name, name_hash_len};
use fsck_types::{BlockNumber, BlockSize, VolumeConfig, Xid};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "cowfsck",
    about = "Offline consistency checker for copy-on-write volumes",
    after_help = "Numbers may be decimal or 0x-prefixed hex. RUST_LOG sets the log filter."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read one object and validate its header and checksum.
    Object {
        /// Path to the volume image.
        image: PathBuf,
        /// Object id; a block number unless `--omap` entries are given.
        #[arg(value_parser = parse_u64)]
        oid: u64,
        /// Object map entry `OID:XID:BLOCK` (repeatable).
        #[arg(long = "omap", value_parser = parse_omap_entry)]
        omap: Vec<OmapArg>,
        #[command(flatten)]
        volume: VolumeArgs,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Checksum every block in a range and report what looks damaged.
    Sweep {
        /// Path to the volume image.
        image: PathBuf,
        /// First block to scan.
        #[arg(long, default_value_t = 0, value_parser = parse_u64)]
        start: u64,
        /// Number of blocks to scan (default: to the end of the image).
        #[arg(long, value_parser = parse_u64)]
        count: Option<u64>,
        #[command(flatten)]
        volume: VolumeArgs,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Decode a raw B-tree key given as hex bytes.
    DecodeKey {
        /// Raw key bytes in hex.
        hex: String,
        /// Decode as an object map key instead of a catalog key.
        #[arg(long)]
        omap_key: bool,
        /// Fold case when checking the name hash.
        #[arg(long)]
        case_insensitive: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Compute the directory-record hash of a file name.
    HashName {
        name: String,
        /// Fold case before hashing.
        #[arg(long)]
        case_insensitive: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

/// Volume parameters shared by the commands that read an image.
#[derive(Debug, Clone, Args)]
struct VolumeArgs {
    /// Volume block size in bytes.
    #[arg(long, default_value = "4096", value_parser = parse_block_size)]
    block_size: BlockSize,
    /// Current transaction id (default: no limit).
    #[arg(long, default_value_t = u64::MAX, value_parser = parse_u64)]
    xid: u64,
    /// Fold case when hashing file names.
    #[arg(long)]
    case_insensitive: bool,
}

impl VolumeArgs {
    fn config(&self) -> VolumeConfig {
        VolumeConfig::new(self.block_size, Xid(self.xid), self.case_insensitive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OmapArg {
    oid: u64,
    xid: u64,
    bno: u64,
}

fn parse_u64(raw: &str) -> Result<u64> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.with_context(|| format!("invalid number: {raw:?}"))
}

fn parse_block_size(raw: &str) -> Result<BlockSize> {
    let value = u32::try_from(parse_u64(raw)?).context("block size does not fit in 32 bits")?;
    Ok(BlockSize::new(value)?)
}

fn parse_omap_entry(raw: &str) -> Result<OmapArg> {
    let parts: Vec<&str> = raw.split(':').collect();
    let [oid, xid, bno] = parts.as_slice() else {
        bail!("expected OID:XID:BLOCK, got {raw:?}");
    };
    Ok(OmapArg {
        oid: parse_u64(oid)?,
        xid: parse_u64(xid)?,
        bno: parse_u64(bno)?,
    })
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(default_env_filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .compact()
        .try_init()
        .map_err(|err| anyhow!("failed to initialize logger: {err}"))
}

// ── Entry point ─────────────────────────────────────────────────────────────

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            error
                .downcast_ref::<FsckError>()
                .map_or(EXIT_OPERATIONAL, FsckError::exit_code)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            err.print().context("failed to print usage")?;
            return Ok(if err.use_stderr() {
                EXIT_OPERATIONAL
            } else {
                EXIT_CLEAN
            });
        }
    };
    init_logging()?;

    match cli.command {
        Command::Object {
            image,
            oid,
            omap,
            volume,
            json,
        } => object_cmd(&image, oid, &omap, &volume.config(), json),
        Command::Sweep {
            image,
            start,
            count,
            volume,
            json,
        } => sweep_cmd(&image, start, count, &volume.config(), json),
        Command::DecodeKey {
            hex,
            omap_key,
            case_insensitive,
            json,
        } => decode_key_cmd(&hex, omap_key, case_insensitive, json),
        Command::HashName {
            name,
            case_insensitive,
            json,
        } => hash_name_cmd(&name, case_insensitive, json),
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn open_device(image: &Path, config: &VolumeConfig) -> Result<ByteBlockDevice<FileByteDevice>> {
    let file = FileByteDevice::open(image)
        .with_context(|| format!("failed to open image: {}", image.display()))?;
    let dev = ByteBlockDevice::new(file, config.block_size)
        .with_context(|| format!("failed to use image: {}", image.display()))?;
    Ok(dev)
}

// ── Commands ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ObjectOutput {
    block: u64,
    header: ObjectHeader,
}

fn object_cmd(
    image: &Path,
    oid: u64,
    entries: &[OmapArg],
    config: &VolumeConfig,
    json: bool,
) -> Result<i32> {
    let reader = ObjectReader::new(open_device(image, config)?, *config)?;

    let mut omap = OmapTable::new();
    for entry in entries {
        omap.insert(entry.oid, entry.xid, entry.bno);
    }
    let map: Option<&dyn ObjectMap> = if omap.is_empty() { None } else { Some(&omap) };

    let object = reader.read_object(oid, map)?;
    info!(oid, block = object.block.0, "object is valid");

    let output = ObjectOutput {
        block: object.block.0,
        header: object.header,
    };
    if json {
        print_json(&output)?;
    } else {
        let header = &output.header;
        println!("object {oid:#x}: valid");
        println!("block: {:#x}", output.block);
        println!("checksum: {:#018x}", header.checksum);
        println!("xid: {}", header.xid.0);
        println!("type: {:#06x}", header.obj_type);
        println!("flags: {:#06x}", header.flags);
        println!("subtype: {:#06x}", header.subtype);
    }
    Ok(EXIT_CLEAN)
}

fn sweep_cmd(
    image: &Path,
    start: u64,
    count: Option<u64>,
    config: &VolumeConfig,
    json: bool,
) -> Result<i32> {
    let dev = open_device(image, config)?;
    let sweeper = Sweeper::new(&dev, config);
    let report: SweepReport = sweeper.sweep_range(BlockNumber(start), count.unwrap_or(u64::MAX));

    if json {
        print_json(&report)?;
    } else {
        for finding in &report.findings {
            println!("{finding}");
        }
        println!("{report}");
    }
    Ok(if report.is_clean() {
        EXIT_CLEAN
    } else {
        EXIT_UNCORRECTED
    })
}

#[derive(Debug, Serialize)]
struct KeyOutput {
    #[serde(flatten)]
    key: OwnedKey,
    record_type_name: Option<String>,
    name_str: Option<String>,
}

fn decode_key_cmd(raw_hex: &str, omap_key: bool, case_insensitive: bool, json: bool) -> Result<i32> {
    let raw = hex::decode(raw_hex.trim()).context("key must be hex bytes")?;
    let format = if omap_key {
        KeyFormat::ObjectMap
    } else {
        KeyFormat::Catalog
    };
    let key = fsck_core::decode_key(format, &raw, case_insensitive)?;

    let output = KeyOutput {
        record_type_name: match format {
            KeyFormat::ObjectMap => None,
            KeyFormat::Catalog => key.record_type().map(|t| format!("{t:?}")),
        },
        name_str: key.name_str().map(str::to_owned),
        key: key.into_owned(),
    };
    if json {
        print_json(&output)?;
    } else {
        println!("id: {:#x}", output.key.id);
        if let Some(name) = &output.record_type_name {
            println!("type: {name} ({})", output.key.record_type);
        }
        println!("number: {:#x}", output.key.number);
        if let Some(name) = &output.name_str {
            println!("name: {name:?}");
        }
    }
    Ok(EXIT_CLEAN)
}

#[derive(Debug, Serialize)]
struct HashOutput {
    name: String,
    case_insensitive: bool,
    packed: u32,
    hash: u32,
    len: u32,
}

fn hash_name_cmd(name: &str, case_insensitive: bool, json: bool) -> Result<i32> {
    let packed = hash_name(name, case_insensitive);
    let (hash, len) = name_hash_len(packed);
    let output = HashOutput {
        name: name.to_owned(),
        case_insensitive,
        packed,
        hash,
        len,
    };
    if json {
        print_json(&output)?;
    } else {
        println!("packed: {packed:#010x}");
        println!("hash: {hash:#08x}");
        println!("len: {len}");
    }
    Ok(EXIT_CLEAN)
}
