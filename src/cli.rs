use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;
use thiserror::Error;

use marc::{ArchiveError, Naming, TrimOptions};

#[derive(Parser)]
#[command(name = "mrfkit")]
#[command(about = "Copy, trim, join and stack MRF tile archives")]
#[command(author, version, long_about = None)]
pub struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// More logging, repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Copy an archive, leaving out unused space
    Copy {
        /// Data file of the source archive
        source: PathBuf,

        /// Data file of the new archive
        dest: PathBuf,

        /// File written at the start of the new data file
        #[arg(long, value_name = "FILE")]
        seed: Option<PathBuf>,
    },

    /// Close the gaps of an archive in place, keep a backup
    Trim {
        data: PathBuf,

        /// Leading bytes of the data file to keep untouched
        #[arg(short, long, default_value = "0", value_parser = parse_int)]
        start: u64,
    },

    /// Join archives, later inputs win shared slots
    Join {
        #[arg(short, long)]
        output: PathBuf,

        /// Reuse data already at this offset instead of copying it
        #[arg(short = 'f', long, value_parser = parse_int)]
        offset: Option<u64>,

        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Append archives as slices of a 3-D archive
    Append {
        #[arg(short, long)]
        output: PathBuf,

        /// Slices in the output
        #[arg(short = 'z', long, value_parser = parse_u32)]
        zsize: u32,

        /// Slice the first input goes to
        #[arg(short, long, default_value = "0", value_parser = parse_u32)]
        slice: u32,

        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Print an index as CSV
    DumpIndex {
        index: PathBuf,

        /// Write to FILE instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// The index is little endian
        #[arg(short, long)]
        little_endian: bool,
    },

    /// Extract one tile, or a byte range, of a data file
    ReadTile {
        data: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Tile number, counting from 1
        #[arg(short, long, value_parser = parse_int, conflicts_with = "offset")]
        tile: Option<u64>,

        /// Index to locate the tile with, derived from the data name if unset
        #[arg(short, long, requires = "tile")]
        index: Option<PathBuf>,

        #[arg(long, value_parser = parse_int, requires = "size")]
        offset: Option<u64>,

        #[arg(long, value_parser = parse_int, requires = "offset")]
        size: Option<u64>,

        /// The index is little endian
        #[arg(short, long)]
        little_endian: bool,
    },

    /// Write a packed copy of an index
    PackIndex { index: PathBuf, output: PathBuf },

    /// Restore an index from its packed copy
    UnpackIndex { packed: PathBuf, output: PathBuf },

    /// Check that the tiles of an archive fit its data file without overlap
    Verify { data: PathBuf },
}

/// Decimal or `0x` prefixed hexadecimal
pub fn parse_int(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };

    u64::from_str_radix(digits, radix).map_err(|e| format!("{}: {}", s, e))
}

pub fn parse_u32(s: &str) -> Result<u32, String> {
    let v = parse_int(s)?;
    u32::try_from(v).map_err(|_| format!("{} does not fit in 32 bits", v))
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error("bad config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("{0}")]
    Usage(String),
}

const DEFAULT_CONFIG: &str = r#"
[naming]
index_extension = "idx"
metadata_extension = "mrf"

[trim]
shadow_index = true
verify = true

[compact]
verify = false
"#;

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub naming: Naming,

    #[serde(default)]
    pub trim: TrimOptions,

    #[serde(default)]
    pub compact: CompactConfig,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct CompactConfig {
    /// Check the source layout before copying
    pub verify: bool,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Config, CliError> {
        let text = match path {
            Some(p) => fs::read_to_string(p)?,
            None => DEFAULT_CONFIG.to_string(),
        };
        Ok(toml::from_str(&text)?)
    }
}
