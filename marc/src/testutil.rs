use std::fs;
use std::path::Path;

use mcore::record::encode_block;
use mcore::{Endian, Record};

use crate::archive::ArchivePair;

pub fn write_index(path: &Path, records: &[Record]) {
    fs::write(path, encode_block(records, Endian::Big)).unwrap();
}

pub fn read_index(path: &Path) -> Vec<Record> {
    let bytes = fs::read(path).unwrap();
    mcore::record::decode_block(&bytes, Endian::Big).unwrap()
}

/// `<dir>/<name>.dat` plus its `.idx`
pub fn write_archive(dir: &Path, name: &str, data: &[u8], records: &[Record]) -> ArchivePair {
    let pair = ArchivePair::new(dir.join(format!("{}.dat", name))).unwrap();
    fs::write(pair.data_path(), data).unwrap();
    write_index(pair.index_path(), records);
    pair
}

pub fn write_meta(path: &Path, x: u64, y: u64, c: u64, page: u64, scale: Option<u64>) {
    let rsets = match scale {
        Some(s) => format!("  <Rsets model=\"uniform\" scale=\"{}\"/>\n", s),
        None => String::new(),
    };
    let xml = format!(
        "<MRF_META>\n  <Raster>\n    <Size x=\"{x}\" y=\"{y}\" c=\"{c}\"/>\n    \
         <PageSize x=\"{page}\" y=\"{page}\" c=\"{c}\"/>\n    \
         <DataFile>tile.dat</DataFile>\n  </Raster>\n{rsets}</MRF_META>\n",
    );
    fs::write(path, xml).unwrap();
}

/// Content of every non-empty slot, in slot order
pub fn tiles(pair: &ArchivePair) -> Vec<Option<Vec<u8>>> {
    let data = fs::read(pair.data_path()).unwrap();

    read_index(pair.index_path())
        .iter()
        .map(|r| {
            if r.is_empty() {
                None
            } else {
                Some(data[r.offset as usize..(r.offset + r.length) as usize].to_vec())
            }
        })
        .collect()
}
