use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{debug, error, info};
use tempfile::NamedTempFile;

use marc::archive::{copy_permissions, scratch_dir};
use marc::integrity::check_layout;
use marc::{dump, ArchivePair, TrimOptions, TrimOutcome};
use mcore::Endian;

mod cli;
use crate::cli::Cli;
use crate::cli::CliError;
use crate::cli::Commands;
use crate::cli::Config;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let pair = |path: &PathBuf| ArchivePair::with_naming(path, &config.naming);
    let pairs = |paths: &[PathBuf]| -> Result<Vec<ArchivePair>, CliError> {
        paths.iter().map(|p| Ok(pair(p)?)).collect()
    };

    match cli.command {
        Commands::Copy { source, dest, seed } => {
            let source = pair(&source)?;
            let dest = pair(&dest)?;

            if config.compact.verify {
                check_layout(&source.read_records()?, Some(source.data_len()?))?;
            }
            let seed = match seed {
                Some(path) => Some(fs::read(path)?),
                None => None,
            };
            marc::compact_copy(&source, &dest, seed.as_deref())?;
        }
        Commands::Trim { data, start } => {
            let opts = TrimOptions {
                start_offset: start,
                ..config.trim.clone()
            };

            if let TrimOutcome::Trimmed { old_len, new_len, .. } = marc::trim_in_place(&pair(&data)?, &opts)? {
                info!("freed {} bytes", old_len - new_len);
            }
        }
        Commands::Join { output, offset, inputs } => {
            marc::join(&pairs(&inputs)?, &pair(&output)?, offset)?;
        }
        Commands::Append {
            output,
            zsize,
            slice,
            inputs,
        } => {
            marc::append_slices(&pairs(&inputs)?, &pair(&output)?, zsize, slice)?;
        }
        Commands::DumpIndex {
            index,
            output,
            little_endian,
        } => {
            let input = BufReader::new(File::open(&index)?);
            let order = byte_order(little_endian);

            let rows = match output {
                Some(path) => {
                    let mut out = BufWriter::new(File::create(&path)?);
                    let rows = dump::dump_index(input, order, &mut out)?;
                    info!("Wrote {} records to {:?}", rows, path);
                    rows
                }
                None => dump::dump_index(input, order, &mut io::stdout().lock())?,
            };
            debug!("{} records in {:?}", rows, index);
        }
        Commands::ReadTile {
            data,
            output,
            tile,
            index,
            offset,
            size,
            little_endian,
        } => {
            let bytes = match (tile, offset, size) {
                (Some(tile), _, _) => {
                    let index = match index {
                        Some(index) => index,
                        None => pair(&data)?.index_path().to_path_buf(),
                    };
                    dump::read_tile(&data, &index, tile, byte_order(little_endian))?
                }
                (None, Some(offset), Some(size)) => dump::read_range(&data, offset, size)?,
                _ => {
                    return Err(CliError::Usage(
                        "either --tile or --offset with --size is needed".to_string(),
                    ))
                }
            };

            fs::write(&output, &bytes)?;
            info!("Wrote {} bytes to {:?}", bytes.len(), output);
        }
        Commands::PackIndex { index, output } => {
            let len = fs::metadata(&index)?.len();
            let mut input = BufReader::new(File::open(&index)?);

            let mut tmp = NamedTempFile::new_in(scratch_dir(&output))?;
            {
                let mut out = BufWriter::new(tmp.as_file_mut());
                marc::packed::pack(&mut input, len, &mut out)?;
                out.flush()?;
            }
            copy_permissions(&index, tmp.as_file())?;
            tmp.persist(&output).map_err(|e| e.error)?;
        }
        Commands::UnpackIndex { packed, output } => {
            let mut input = BufReader::new(File::open(&packed)?);

            let mut tmp = NamedTempFile::new_in(scratch_dir(&output))?;
            let len = {
                let mut out = BufWriter::new(tmp.as_file_mut());
                let len = marc::packed::unpack(&mut input, &mut out)?;
                out.flush()?;
                len
            };
            tmp.as_file().set_len(len)?;
            copy_permissions(&packed, tmp.as_file())?;
            tmp.persist(&output).map_err(|e| e.error)?;
            info!("Unpacked {:?} to {} bytes", packed, len);
        }
        Commands::Verify { data } => {
            let pair = pair(&data)?;
            let records = pair.read_records()?;

            check_layout(&records, Some(pair.data_len()?))?;
            info!("{:?}: {} slots, layout ok", pair.data_path(), records.len());
        }
    }
    Ok(())
}

fn byte_order(little_endian: bool) -> Endian {
    if little_endian {
        Endian::Little
    } else {
        Endian::Big
    }
}
