//! Tiled BigTIFF writer for normalized rasters.
//!
//! Writes the full-resolution image followed by one reduced-resolution IFD per
//! overview level. Every level is cut into square tiles, Deflate-compressed,
//! with a horizontal predictor for integer data and the floating-point
//! predictor for float data. Tile pixels are pulled one at a time from a
//! [`TileSource`], so the writer never holds more than one tile in memory.
//!
//! Georeferencing goes into the usual GeoTIFF tags (pixel scale, tiepoint,
//! GeoKey directory), and GDAL's private tags carry nodata and per-band
//! statistics.

use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use flate2::write::ZlibEncoder;
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKind};
use tiff::tags::Tag;

use crate::casting::{ceil_div, usize_to_u32};
use crate::cog_reader::{
    tag, CogDataType, TAG_GDAL_METADATA, TAG_GDAL_NODATA, TAG_GEO_ASCII_PARAMS, TAG_GEO_KEY_DIRECTORY,
    TAG_MODEL_PIXEL_SCALE, TAG_MODEL_TIEPOINT, TAG_NEW_SUBFILE_TYPE,
};
use crate::error::{Error, Result};
use crate::geometry::projection::is_geographic_crs;

// GeoKey IDs
const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GT_CITATION_GEO_KEY: u16 = 1026;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

// GeoKey values
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

const COMPRESSION_DEFLATE: u16 = 8;
const PREDICTOR_HORIZONTAL: u16 = 2;
const PREDICTOR_FLOATING_POINT: u16 = 3;
const PHOTOMETRIC_MIN_IS_BLACK: u16 = 1;
const PHOTOMETRIC_RGB: u16 = 2;
const EXTRA_SAMPLE_UNASSOCIATED_ALPHA: u16 = 2;

/// Shape, georeferencing and metadata of a raster about to be written.
#[derive(Debug, Clone)]
pub struct CogLayout {
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub data_type: CogDataType,
    /// Square tile edge, a multiple of 16.
    pub block_size: usize,
    pub crs: i32,
    /// World coordinate of the top-left corner.
    pub origin: (f64, f64),
    /// Full-resolution pixel size, both positive.
    pub resolution: (f64, f64),
    pub nodata: f64,
    /// Overview downsample factors, strictly increasing.
    pub overviews: Vec<usize>,
    /// Per-band `(min, max)`; `None` for bands that held only nodata.
    pub statistics: Vec<Option<(f64, f64)>>,
}

impl CogLayout {
    /// Number of IFDs: full resolution plus overviews.
    #[must_use]
    pub fn level_count(&self) -> usize {
        1 + self.overviews.len()
    }

    #[must_use]
    pub fn level_factor(&self, level: usize) -> usize {
        match level {
            0 => 1,
            n => self.overviews.get(n - 1).copied().unwrap_or(1),
        }
    }

    #[must_use]
    pub fn level_size(&self, level: usize) -> (usize, usize) {
        let f = self.level_factor(level);
        (ceil_div(self.width, f), ceil_div(self.height, f))
    }

    /// Tiles across and down for a level.
    #[must_use]
    pub fn level_tiles(&self, level: usize) -> (usize, usize) {
        let (w, h) = self.level_size(level);
        (ceil_div(w, self.block_size), ceil_div(h, self.block_size))
    }

    /// Samples in one full tile.
    #[must_use]
    pub fn tile_samples(&self) -> usize {
        self.block_size * self.block_size * self.bands
    }
}

/// Supplier of tile pixels for the writer.
pub trait TileSource {
    /// Samples of tile `(tx, ty)` at `level`, pixel-interleaved, always a full
    /// `block_size x block_size` block padded with nodata past the edge.
    ///
    /// # Errors
    /// Implementations return an error if the tile cannot be produced.
    fn read_tile(&mut self, level: usize, tx: usize, ty: usize) -> Result<Vec<f64>>;
}

/// Writer for [`CogLayout`] rasters.
pub struct GeoTiffWriter<'a> {
    layout: &'a CogLayout,
    deflate_level: u32,
}

impl<'a> GeoTiffWriter<'a> {
    #[must_use]
    pub fn new(layout: &'a CogLayout) -> Self {
        Self {
            layout,
            deflate_level: 6,
        }
    }

    /// Set the zlib level (0-9).
    #[must_use]
    pub fn deflate_level(mut self, level: u32) -> Self {
        self.deflate_level = level.min(9);
        self
    }

    /// Write to a file path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or a tile cannot be produced.
    pub fn write<P: AsRef<Path>, S: TileSource>(self, path: P, source: &mut S) -> Result<()> {
        let file = File::create(path)?;
        self.write_to(BufWriter::new(file), source)
    }

    /// Write to any writer that implements Write + Seek.
    ///
    /// # Errors
    /// Returns an error on invalid layout, I/O failure, or a failing tile source.
    pub fn write_to<W: Write + Seek, S: TileSource>(self, writer: W, source: &mut S) -> Result<()> {
        let layout = self.layout;
        if layout.width == 0 || layout.height == 0 || layout.bands == 0 {
            return Err(Error::conversion("Raster has zero dimensions"));
        }
        if layout.block_size == 0 || layout.block_size % 16 != 0 {
            return Err(Error::conversion(format!(
                "tile size {} is not a positive multiple of 16",
                layout.block_size
            )));
        }

        let mut encoder = TiffEncoder::new_big(writer)?;
        for level in 0..layout.level_count() {
            let mut dir = encoder.new_directory()?;
            self.write_level(&mut dir, level, source)?;
            dir.finish()?;
        }
        Ok(())
    }

    fn write_level<W: Write + Seek, K: TiffKind, S: TileSource>(
        &self,
        dir: &mut DirectoryEncoder<'_, W, K>,
        level: usize,
        source: &mut S,
    ) -> Result<()> {
        let layout = self.layout;
        let (width, height) = layout.level_size(level);
        let (across, down) = layout.level_tiles(level);

        let mut offsets = Vec::with_capacity(across * down);
        let mut byte_counts = Vec::with_capacity(across * down);
        for ty in 0..down {
            for tx in 0..across {
                let samples = source.read_tile(level, tx, ty)?;
                if samples.len() != layout.tile_samples() {
                    return Err(Error::conversion(format!(
                        "tile ({tx}, {ty}) of level {level} has {} samples, expected {}",
                        samples.len(),
                        layout.tile_samples()
                    )));
                }
                let raw = encode_tile(&samples, layout.data_type, layout.block_size, layout.bands);
                let compressed = deflate(&raw, self.deflate_level)?;
                offsets.push(dir.write_data(compressed.as_slice())?);
                byte_counts.push(compressed.len() as u64);
            }
        }

        if level > 0 {
            dir.write_tag(tag(TAG_NEW_SUBFILE_TYPE), 1u32)?;
        }
        dir.write_tag(Tag::ImageWidth, usize_to_u32(width)?)?;
        dir.write_tag(Tag::ImageLength, usize_to_u32(height)?)?;

        let bands = layout.bands;
        let bits: Vec<u16> = vec![layout.data_type.bits(); bands];
        dir.write_tag(Tag::BitsPerSample, bits.as_slice())?;
        dir.write_tag(Tag::Compression, COMPRESSION_DEFLATE)?;

        let rgb = layout.data_type == CogDataType::U8 && (bands == 3 || bands == 4);
        dir.write_tag(
            Tag::PhotometricInterpretation,
            if rgb { PHOTOMETRIC_RGB } else { PHOTOMETRIC_MIN_IS_BLACK },
        )?;
        dir.write_tag(Tag::SamplesPerPixel, u16::try_from(bands).map_err(|_| Error::conversion("too many bands"))?)?;
        dir.write_tag(Tag::PlanarConfiguration, 1u16)?;

        let sample_format: Vec<u16> = vec![layout.data_type.sample_format(); bands];
        dir.write_tag(Tag::SampleFormat, sample_format.as_slice())?;
        dir.write_tag(
            Tag::Predictor,
            if layout.data_type.is_float() { PREDICTOR_FLOATING_POINT } else { PREDICTOR_HORIZONTAL },
        )?;

        let extra = if rgb { bands - 3 } else { bands - 1 };
        if extra > 0 {
            let mut extra_samples: Vec<u16> = vec![0; extra];
            if rgb {
                extra_samples[0] = EXTRA_SAMPLE_UNASSOCIATED_ALPHA;
            }
            dir.write_tag(Tag::ExtraSamples, extra_samples.as_slice())?;
        }

        let block = usize_to_u32(layout.block_size)?;
        dir.write_tag(Tag::TileWidth, block)?;
        dir.write_tag(Tag::TileLength, block)?;
        dir.write_tag(Tag::TileOffsets, offsets.as_slice())?;
        dir.write_tag(Tag::TileByteCounts, byte_counts.as_slice())?;

        if level == 0 {
            self.write_geotiff_tags(dir)?;
            let metadata = gdal_metadata_xml(layout);
            dir.write_tag(tag(TAG_GDAL_METADATA), metadata.as_str())?;
        }
        let nodata = format_nodata(layout.nodata);
        dir.write_tag(tag(TAG_GDAL_NODATA), nodata.as_str())?;

        Ok(())
    }

    fn write_geotiff_tags<W: Write + Seek, K: TiffKind>(&self, dir: &mut DirectoryEncoder<'_, W, K>) -> Result<()> {
        let layout = self.layout;

        // ModelPixelScale: [ScaleX, ScaleY, ScaleZ]
        let pixel_scale = [layout.resolution.0, layout.resolution.1, 0.0];
        dir.write_tag(tag(TAG_MODEL_PIXEL_SCALE), pixel_scale.as_slice())?;

        // ModelTiepoint ties pixel (0, 0) to the top-left corner
        let tiepoint = [0.0, 0.0, 0.0, layout.origin.0, layout.origin.1, 0.0];
        dir.write_tag(tag(TAG_MODEL_TIEPOINT), tiepoint.as_slice())?;

        let citation = crs_citation(layout.crs);
        let geokeys = build_geokey_directory(layout.crs, citation.len() + 1)?;
        dir.write_tag(tag(TAG_GEO_KEY_DIRECTORY), geokeys.as_slice())?;
        dir.write_tag(tag(TAG_GEO_ASCII_PARAMS), citation.as_str())?;
        Ok(())
    }
}

fn crs_citation(crs: i32) -> String {
    // GeoAsciiParams entries are pipe-terminated
    format!("EPSG:{crs}|")
}

/// GeoKeyDirectory for an EPSG-coded CRS.
///
/// `[KeyDirectoryVersion, KeyRevision, MinorRevision, NumberOfKeys,
///   KeyID, TIFFTagLocation, Count, Value_Offset, ...]`, keys sorted by ID.
pub(crate) fn build_geokey_directory(crs: i32, citation_len: usize) -> Result<Vec<u16>> {
    let code = u16::try_from(crs).map_err(|_| Error::conversion(format!("EPSG:{crs} cannot be encoded as a GeoKey")))?;
    let is_geographic = is_geographic_crs(crs);
    let citation_len = u16::try_from(citation_len).map_err(|_| Error::conversion("CRS citation too long"))?;

    let mut keys = vec![1, 1, 0, 4];
    keys.extend_from_slice(&[
        GT_MODEL_TYPE_GEO_KEY,
        0,
        1,
        if is_geographic { MODEL_TYPE_GEOGRAPHIC } else { MODEL_TYPE_PROJECTED },
    ]);
    keys.extend_from_slice(&[GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA]);
    keys.extend_from_slice(&[GT_CITATION_GEO_KEY, TAG_GEO_ASCII_PARAMS, citation_len, 0]);
    if is_geographic {
        keys.extend_from_slice(&[GEOGRAPHIC_TYPE_GEO_KEY, 0, 1, code]);
    } else {
        keys.extend_from_slice(&[PROJECTED_CS_TYPE_GEO_KEY, 0, 1, code]);
    }
    Ok(keys)
}

fn format_nodata(nodata: f64) -> String {
    if nodata.is_nan() {
        "nan".to_string()
    } else {
        format!("{nodata}")
    }
}

/// `<GDALMetadata>` with overview provenance and per-band statistics.
pub(crate) fn gdal_metadata_xml(layout: &CogLayout) -> String {
    let mut xml = String::from("<GDALMetadata>\n");
    xml.push_str("  <Item name=\"RESAMPLING\" domain=\"rio_overview\">average</Item>\n");
    for (band, stats) in layout.statistics.iter().enumerate() {
        if let Some((min, max)) = stats {
            xml.push_str(&format!("  <Item name=\"STATISTICS_MINIMUM\" sample=\"{band}\">{min}</Item>\n"));
            xml.push_str(&format!("  <Item name=\"STATISTICS_MAXIMUM\" sample=\"{band}\">{max}</Item>\n"));
        }
    }
    xml.push_str("</GDALMetadata>");
    xml
}

fn deflate(raw: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), flate2::Compression::new(level));
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

#[allow(clippy::cast_possible_truncation)]
fn to_integer(value: f64, data_type: CogDataType) -> i64 {
    let (lo, hi) = match data_type {
        CogDataType::U8 => (0.0, f64::from(u8::MAX)),
        CogDataType::U16 => (0.0, f64::from(u16::MAX)),
        CogDataType::U32 => (0.0, f64::from(u32::MAX)),
        CogDataType::I8 => (f64::from(i8::MIN), f64::from(i8::MAX)),
        CogDataType::I16 => (f64::from(i16::MIN), f64::from(i16::MAX)),
        CogDataType::I32 | CogDataType::F32 | CogDataType::F64 => (f64::from(i32::MIN), f64::from(i32::MAX)),
    };
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(lo, hi) as i64
}

/// Serialize one tile in native byte order with the predictor applied row by row.
pub(crate) fn encode_tile(samples: &[f64], data_type: CogDataType, block_size: usize, bands: usize) -> Vec<u8> {
    let row_len = block_size * bands;
    let mut out = Vec::with_capacity(samples.len() * data_type.bytes());
    for row in samples.chunks(row_len) {
        if data_type.is_float() {
            encode_float_row(row, data_type, bands, &mut out);
        } else {
            encode_integer_row(row, data_type, bands, &mut out);
        }
    }
    out
}

/// Horizontal differencing: each sample minus the same band of the previous pixel.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn encode_integer_row(row: &[f64], data_type: CogDataType, stride: usize, out: &mut Vec<u8>) {
    let values: Vec<i64> = row.iter().map(|&v| to_integer(v, data_type)).collect();
    for (i, &v) in values.iter().enumerate() {
        let diff = if i >= stride { v - values[i - stride] } else { v };
        match data_type.bytes() {
            1 => out.push(diff as u8),
            2 => out.extend_from_slice(&(diff as u16).to_ne_bytes()),
            _ => out.extend_from_slice(&(diff as u32).to_ne_bytes()),
        }
    }
}

/// Floating-point predictor: split values into big-endian byte planes, then
/// difference bytes with a stride of one pixel.
#[allow(clippy::cast_possible_truncation)]
fn encode_float_row(row: &[f64], data_type: CogDataType, stride: usize, out: &mut Vec<u8>) {
    let bytes = data_type.bytes();
    let count = row.len();
    let start = out.len();
    out.resize(start + count * bytes, 0);
    let planes = &mut out[start..];

    for (i, &v) in row.iter().enumerate() {
        if bytes == 4 {
            for (k, b) in (v as f32).to_bits().to_be_bytes().into_iter().enumerate() {
                planes[k * count + i] = b;
            }
        } else {
            for (k, b) in v.to_bits().to_be_bytes().into_iter().enumerate() {
                planes[k * count + i] = b;
            }
        }
    }
    for j in (stride..planes.len()).rev() {
        planes[j] = planes[j].wrapping_sub(planes[j - stride]);
    }
}
