//! Raster metadata reader.
//!
//! Only the numbers needed to size an index are read: raster size, page size
//! and the optional uniform resolution set scale. Everything else in the
//! document is carried through untouched by [`with_z`].
use std::fs;
use std::path::Path;

use log::debug;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use serde::Deserialize;

use crate::error::{ArchiveError, Result};

const DEFAULT_PAGE: u64 = 512;
const DEFAULT_SCALE: u64 = 2;

#[derive(Deserialize, Debug)]
struct MetaDoc {
    #[serde(rename = "Raster")]
    raster: RasterDoc,
    #[serde(rename = "Rsets")]
    rsets: Option<RsetsDoc>,
}

#[derive(Deserialize, Debug)]
struct RasterDoc {
    #[serde(rename = "Size")]
    size: PointDoc,
    #[serde(rename = "PageSize")]
    page_size: Option<PointDoc>,
}

#[derive(Deserialize, Debug)]
struct PointDoc {
    #[serde(rename = "@x")]
    x: Option<u64>,
    #[serde(rename = "@y")]
    y: Option<u64>,
    #[serde(rename = "@c")]
    c: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct RsetsDoc {
    #[serde(rename = "@model")]
    model: Option<String>,
    #[serde(rename = "@scale")]
    scale: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub x: u64,
    pub y: u64,
    pub c: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterInfo {
    pub size: Extent,
    pub page_size: Extent,
    /// Uniform downsample factor between levels, `None` for a single level
    pub scale: Option<u64>,
}

/// Pages per resolution level, finest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLayout {
    pages: Vec<u64>,
}

fn div_up(x: u64, y: u64) -> u64 {
    if x == 0 {
        0
    } else {
        1 + (x - 1) / y
    }
}

impl RasterInfo {
    pub fn load(path: &Path) -> Result<Self> {
        let xml = fs::read_to_string(path)?;
        Self::from_xml(&xml).map_err(|reason| ArchiveError::Metadata {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn from_xml(xml: &str) -> std::result::Result<Self, String> {
        let doc: MetaDoc = quick_xml::de::from_str(xml).map_err(|e| e.to_string())?;

        let size = Extent {
            x: doc.raster.size.x.ok_or("raster size has no x")?,
            y: doc.raster.size.y.ok_or("raster size has no y")?,
            c: doc.raster.size.c.unwrap_or(1),
        };

        let page_size = match doc.raster.page_size {
            Some(p) => Extent {
                x: p.x.unwrap_or(DEFAULT_PAGE),
                y: p.y.unwrap_or(DEFAULT_PAGE),
                c: p.c.unwrap_or(size.c),
            },
            None => Extent {
                x: DEFAULT_PAGE,
                y: DEFAULT_PAGE,
                c: size.c,
            },
        };

        if size.x == 0 || size.y == 0 || size.c == 0 {
            return Err(format!("empty raster {:?}", size));
        }
        if page_size.x == 0 || page_size.y == 0 || page_size.c == 0 {
            return Err(format!("empty page {:?}", page_size));
        }

        let scale = match doc.rsets {
            None => None,
            Some(rsets) => {
                if rsets.model.as_deref() != Some("uniform") {
                    return Err(format!(
                        "only uniform rsets are supported, got {:?}",
                        rsets.model
                    ));
                }
                let scale = rsets
                    .scale
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .unwrap_or(DEFAULT_SCALE);
                if scale < 2 {
                    return Err(format!("rset scale {} would never converge", scale));
                }
                Some(scale)
            }
        };

        Ok(RasterInfo {
            size,
            page_size,
            scale,
        })
    }

    fn page_count(&self, x: u64, y: u64) -> u64 {
        div_up(x, self.page_size.x) * div_up(y, self.page_size.y) * self.band_pages()
    }

    /// Pages needed to cover all bands at one spatial location
    pub fn band_pages(&self) -> u64 {
        div_up(self.size.c, self.page_size.c)
    }

    pub fn layout(&self) -> PageLayout {
        let (mut x, mut y) = (self.size.x, self.size.y);
        let mut pages = vec![self.page_count(x, y)];

        if let Some(scale) = self.scale {
            let band_pages = self.band_pages();
            while pages[pages.len() - 1] != band_pages {
                x = div_up(x, scale);
                y = div_up(y, scale);
                pages.push(self.page_count(x, y));
            }
        }

        debug!("page layout: {:?}", pages);
        PageLayout { pages }
    }
}

impl PageLayout {
    pub fn new(pages: Vec<u64>) -> Self {
        PageLayout { pages }
    }

    pub fn levels(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self, level: usize) -> u64 {
        self.pages[level]
    }

    pub fn total_pages(&self) -> u64 {
        self.pages.iter().sum()
    }

    /// First record slot of `level` in an index stacking `slices` of each level
    pub fn level_base(&self, level: usize, slices: u64) -> u64 {
        self.pages[..level].iter().sum::<u64>() * slices
    }

    /// First record slot of (`level`, `slice`)
    pub fn slot_of(&self, level: usize, slice: u64, slices: u64) -> u64 {
        self.level_base(level, slices) + slice * self.pages[level]
    }
}

/// Copy of `xml` with `Raster/Size@z` set to `z`
pub fn with_z(xml: &str, z: u32) -> std::result::Result<String, String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut found = false;

    loop {
        let event = reader.read_event().map_err(|e| e.to_string())?;
        let event = match event {
            Event::Eof => break,
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                let e = if is_raster_size(&path, &name) {
                    found = true;
                    set_z(&e, z)?
                } else {
                    e.into_owned()
                };
                path.push(name);
                Event::Start(e)
            }
            Event::Empty(e) => {
                if is_raster_size(&path, e.name().as_ref()) {
                    found = true;
                    Event::Empty(set_z(&e, z)?)
                } else {
                    Event::Empty(e)
                }
            }
            Event::End(e) => {
                path.pop();
                Event::End(e)
            }
            e => e,
        };
        writer.write_event(event).map_err(|e| e.to_string())?;
    }

    if !found {
        return Err("no Raster/Size element".to_string());
    }
    String::from_utf8(writer.into_inner()).map_err(|e| e.to_string())
}

fn is_raster_size(path: &[Vec<u8>], name: &[u8]) -> bool {
    name == b"Size" && path.last().map(|p| p.as_slice()) == Some(b"Raster".as_slice())
}

fn set_z(e: &BytesStart, z: u32) -> std::result::Result<BytesStart<'static>, String> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);

    for attr in e.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        if attr.key.as_ref() != b"z" {
            out.push_attribute(attr);
        }
    }
    out.push_attribute(("z", z.to_string().as_str()));
    Ok(out)
}

/// Write `src` to `dest` with the z size set
pub fn write_with_z(src: &Path, dest: &Path, z: u32) -> Result<()> {
    let xml = fs::read_to_string(src)?;
    let out = with_z(&xml, z).map_err(|reason| ArchiveError::Metadata {
        path: src.to_path_buf(),
        reason,
    })?;
    fs::write(dest, out)?;
    Ok(())
}
