//! GeoTIFF / COG reading on top of the `tiff` decoder.
//!
//! [`CogReader::open`] walks every IFD once to collect the full-resolution
//! layout and any reduced-resolution overviews, then reads pixel data lazily,
//! one chunk (tile or strip) at a time, through a byte-bounded
//! [`TileCache`]. Nothing here ever decodes a whole image at once, except
//! when the source file itself stores the image as a single strip.
//!
//! Band-sequential (planar) files store each band in its own run of chunks;
//! the bands of one spatial chunk are decoded together and interleaved, so
//! callers always see pixel-interleaved [`Chunk`]s.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tracing::{debug, warn};

use crate::casting::{ceil_div, u32_to_usize, usize_to_u32};
use crate::error::{Error, Result};
use crate::geometry::BoundingBox;
use crate::tile_cache::{Chunk, ChunkKey, TileCache};

// TIFF / GeoTIFF / GDAL private tag codes
pub(crate) const TAG_NEW_SUBFILE_TYPE: u16 = 254;
pub(crate) const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
pub(crate) const TAG_MODEL_TIEPOINT: u16 = 33922;
pub(crate) const TAG_MODEL_TRANSFORMATION: u16 = 34264;
pub(crate) const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
pub(crate) const TAG_GEO_ASCII_PARAMS: u16 = 34737;
pub(crate) const TAG_GDAL_METADATA: u16 = 42112;
pub(crate) const TAG_GDAL_NODATA: u16 = 42113;

const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_CS_TYPE: u16 = 3072;
const USER_DEFINED: u16 = 32767;

/// Tag lookup that matches whatever variant the decoder stored the code under.
pub(crate) fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Sample type of a raster band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CogDataType {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl CogDataType {
    /// Map `BitsPerSample` + `SampleFormat` to a data type.
    ///
    /// # Errors
    /// Returns a conversion error for combinations the pipeline cannot carry.
    pub fn from_tags(bits: u16, sample_format: u16) -> Result<Self> {
        match (sample_format, bits) {
            (1, 8) => Ok(Self::U8),
            (1, 16) => Ok(Self::U16),
            (1, 32) => Ok(Self::U32),
            (2, 8) => Ok(Self::I8),
            (2, 16) => Ok(Self::I16),
            (2, 32) => Ok(Self::I32),
            (3, 32) => Ok(Self::F32),
            (3, 64) => Ok(Self::F64),
            _ => Err(Error::conversion(format!(
                "unsupported sample layout: {bits} bits, SampleFormat {sample_format}"
            ))),
        }
    }

    #[must_use]
    pub fn bits(self) -> u16 {
        match self {
            Self::U8 | Self::I8 => 8,
            Self::U16 | Self::I16 => 16,
            Self::U32 | Self::I32 | Self::F32 => 32,
            Self::F64 => 64,
        }
    }

    #[must_use]
    pub fn bytes(self) -> usize {
        usize::from(self.bits() / 8)
    }

    /// TIFF `SampleFormat` value: 1 unsigned, 2 signed, 3 IEEE float.
    #[must_use]
    pub fn sample_format(self) -> u16 {
        match self {
            Self::U8 | Self::U16 | Self::U32 => 1,
            Self::I8 | Self::I16 | Self::I32 => 2,
            Self::F32 | Self::F64 => 3,
        }
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::U32 => "uint32",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }
}

/// Pixel-to-world mapping as stored in GeoTIFF tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoTransform {
    /// ModelPixelScale `[sx, sy, sz]`
    pub pixel_scale: Option<[f64; 3]>,
    /// ModelTiepoint `[i, j, k, x, y, z]`
    pub tiepoint: Option<[f64; 6]>,
}

impl GeoTransform {
    #[must_use]
    pub fn new(origin_x: f64, origin_y: f64, res_x: f64, res_y: f64) -> Self {
        Self {
            pixel_scale: Some([res_x, res_y, 0.0]),
            tiepoint: Some([0.0, 0.0, 0.0, origin_x, origin_y, 0.0]),
        }
    }

    /// World coordinate of the top-left corner of pixel (0, 0).
    #[must_use]
    pub fn origin(&self) -> Option<(f64, f64)> {
        let (scale, tie) = (self.pixel_scale?, self.tiepoint?);
        Some((tie[3] - tie[0] * scale[0], tie[4] + tie[1] * scale[1]))
    }

    /// Pixel size `(x, y)`, both positive for north-up rasters.
    #[must_use]
    pub fn resolution(&self) -> Option<(f64, f64)> {
        self.pixel_scale.map(|s| (s[0], s[1]))
    }

    #[must_use]
    pub fn bounds(&self, width: usize, height: usize) -> Option<BoundingBox> {
        let (ox, oy) = self.origin()?;
        let (rx, ry) = self.resolution()?;
        #[allow(clippy::cast_precision_loss)]
        let (w, h) = (width as f64, height as f64);
        Some(BoundingBox::new(ox, oy - ry * h, ox + rx * w, oy))
    }
}

/// One `<Item>` of a GDAL_METADATA tag.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataItem {
    pub name: String,
    pub sample: Option<usize>,
    pub domain: Option<String>,
    pub value: String,
}

/// Full-resolution image description.
#[derive(Debug, Clone)]
pub struct CogMetadata {
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub data_type: CogDataType,
    /// Chunk size; for stripped files this is `(width, rows_per_strip)`.
    pub tile_width: usize,
    pub tile_height: usize,
    pub tiles_across: usize,
    pub tiles_down: usize,
    pub is_tiled: bool,
    /// Bands stored in separate chunks (PlanarConfiguration 2).
    pub planar: bool,
    pub geo_transform: GeoTransform,
    pub crs_code: Option<i32>,
    pub nodata: Option<f64>,
    pub metadata_items: Vec<MetadataItem>,
}

impl CogMetadata {
    /// `(min, max)` statistics for a 0-based band, when recorded in GDAL metadata.
    #[must_use]
    pub fn band_statistics(&self, band: usize) -> Option<(f64, f64)> {
        let find = |name: &str| {
            self.metadata_items
                .iter()
                .find(|i| i.name == name && i.sample == Some(band))
                .and_then(|i| i.value.trim().parse::<f64>().ok())
        };
        Some((find("STATISTICS_MINIMUM")?, find("STATISTICS_MAXIMUM")?))
    }
}

/// Reduced-resolution level.
#[derive(Debug, Clone)]
pub struct OverviewMetadata {
    pub width: usize,
    pub height: usize,
    pub tile_width: usize,
    pub tile_height: usize,
    pub tiles_across: usize,
    pub tiles_down: usize,
    /// Downsample factor relative to full resolution.
    pub scale: usize,
    planar: bool,
    ifd_index: usize,
}

#[derive(Debug, Clone, Copy)]
struct LevelLayout {
    width: usize,
    height: usize,
    chunk_width: usize,
    chunk_height: usize,
    chunks_across: usize,
    chunks_down: usize,
    planar: bool,
    ifd_index: usize,
}

type TiffDecoder = Decoder<BufReader<File>>;

fn open_decoder(path: &Path) -> Result<TiffDecoder> {
    let file = File::open(path)?;
    Ok(Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited()))
}

fn find_u16_vec(decoder: &mut TiffDecoder, t: Tag) -> Result<Option<Vec<u16>>> {
    Ok(decoder.find_tag(t)?.map(|v| v.into_u16_vec()).transpose()?)
}

fn find_f64_vec(decoder: &mut TiffDecoder, t: Tag) -> Result<Option<Vec<f64>>> {
    Ok(decoder.find_tag(t)?.map(|v| v.into_f64_vec()).transpose()?)
}

fn find_string(decoder: &mut TiffDecoder, t: Tag) -> Result<Option<String>> {
    Ok(decoder.find_tag(t)?.map(|v| v.into_string()).transpose()?)
}

fn find_u32(decoder: &mut TiffDecoder, t: Tag) -> Result<Option<u32>> {
    Ok(decoder.find_tag(t)?.map(|v| v.into_u32()).transpose()?)
}

fn read_layout(decoder: &mut TiffDecoder, ifd_index: usize) -> Result<LevelLayout> {
    let (width, height) = decoder.dimensions()?;
    let (chunk_width, chunk_height) = decoder.chunk_dimensions();
    let (width, height) = (u32_to_usize(width), u32_to_usize(height));
    let (chunk_width, chunk_height) = (u32_to_usize(chunk_width).max(1), u32_to_usize(chunk_height).max(1));
    let planar = find_u16_vec(decoder, Tag::PlanarConfiguration)?
        .and_then(|v| v.first().copied())
        == Some(2);
    Ok(LevelLayout {
        width,
        height,
        chunk_width,
        chunk_height,
        chunks_across: ceil_div(width, chunk_width),
        chunks_down: ceil_div(height, chunk_height),
        planar,
        ifd_index,
    })
}

fn parse_crs(geokeys: &[u16]) -> Option<i32> {
    if geokeys.len() < 4 {
        return None;
    }
    let count = usize::from(geokeys[3]);
    let mut projected = None;
    let mut geographic = None;
    for entry in geokeys[4..].chunks_exact(4).take(count) {
        let (key, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 || value == 0 || value == USER_DEFINED {
            continue;
        }
        match key {
            KEY_PROJECTED_CS_TYPE => projected = Some(i32::from(value)),
            KEY_GEOGRAPHIC_TYPE => geographic = Some(i32::from(value)),
            _ => {}
        }
    }
    projected.or(geographic)
}

fn parse_geo_transform(
    scale: Option<Vec<f64>>,
    tiepoint: Option<Vec<f64>>,
    matrix: Option<Vec<f64>>,
) -> Result<GeoTransform> {
    if let (Some(s), Some(t)) = (&scale, &tiepoint) {
        if s.len() >= 2 && t.len() >= 6 {
            return Ok(GeoTransform {
                pixel_scale: Some([s[0], s[1], s.get(2).copied().unwrap_or(0.0)]),
                tiepoint: Some([t[0], t[1], t[2], t[3], t[4], t[5]]),
            });
        }
    }
    if let Some(m) = matrix {
        if m.len() >= 8 {
            if m[1] != 0.0 || m[4] != 0.0 {
                return Err(Error::conversion("rotated rasters are not supported"));
            }
            return Ok(GeoTransform::new(m[3], m[7], m[0], -m[5]));
        }
    }
    Ok(GeoTransform::default())
}

static ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Item\s+([^>]*)>([^<]*)</Item>").expect("static regex"));
static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("static regex"));

/// Parse the `<GDALMetadata>` XML blob.
pub(crate) fn parse_gdal_metadata(xml: &str) -> Vec<MetadataItem> {
    ITEM_RE
        .captures_iter(xml)
        .filter_map(|cap| {
            let mut item = MetadataItem {
                name: String::new(),
                sample: None,
                domain: None,
                value: cap[2].to_string(),
            };
            for attr in ATTR_RE.captures_iter(&cap[1]) {
                match &attr[1] {
                    "name" => item.name = attr[2].to_string(),
                    "sample" => item.sample = attr[2].parse().ok(),
                    "domain" => item.domain = Some(attr[2].to_string()),
                    _ => {}
                }
            }
            (!item.name.is_empty()).then_some(item)
        })
        .collect()
}

fn parse_nodata(text: &str) -> Option<f64> {
    let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if trimmed.eq_ignore_ascii_case("nan") {
        return Some(f64::NAN);
    }
    trimmed.parse().ok()
}

fn decoding_result_to_f64(result: DecodingResult) -> Result<Vec<f64>> {
    #[allow(clippy::cast_precision_loss)]
    let values = match result {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        #[allow(unreachable_patterns)]
        _ => return Err(Error::conversion("unsupported sample type in raster chunk")),
    };
    Ok(values)
}

/// Lazily-decoding GeoTIFF reader.
pub struct CogReader {
    path: PathBuf,
    decoder: TiffDecoder,
    current_ifd: usize,
    pub metadata: CogMetadata,
    pub overviews: Vec<OverviewMetadata>,
    cache: TileCache,
    chunks_decoded: usize,
}

impl CogReader {
    /// Open a GeoTIFF and read the metadata of every IFD.
    ///
    /// # Errors
    /// Returns an error if the file is not a readable TIFF or uses a sample
    /// layout the pipeline cannot carry (odd bit depths, mixed formats).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut decoder = open_decoder(&path)?;

        let base = read_layout(&mut decoder, 0)?;
        let bands = decoder
            .find_tag(Tag::SamplesPerPixel)?
            .map(|v| v.into_u16())
            .transpose()?
            .map_or(1, usize::from);
        let bits = find_u16_vec(&mut decoder, Tag::BitsPerSample)?
            .and_then(|v| v.first().copied())
            .unwrap_or(8);
        let sample_format = find_u16_vec(&mut decoder, Tag::SampleFormat)?
            .and_then(|v| v.first().copied())
            .unwrap_or(1);
        let data_type = CogDataType::from_tags(bits, sample_format)?;

        let is_tiled = decoder.find_tag(Tag::TileWidth)?.is_some();
        let geo_transform = parse_geo_transform(
            find_f64_vec(&mut decoder, tag(TAG_MODEL_PIXEL_SCALE))?,
            find_f64_vec(&mut decoder, tag(TAG_MODEL_TIEPOINT))?,
            find_f64_vec(&mut decoder, tag(TAG_MODEL_TRANSFORMATION))?,
        )?;
        let crs_code = find_u16_vec(&mut decoder, tag(TAG_GEO_KEY_DIRECTORY))?
            .as_deref()
            .and_then(parse_crs);
        let nodata = find_string(&mut decoder, tag(TAG_GDAL_NODATA))?
            .as_deref()
            .and_then(parse_nodata);
        let metadata_items = find_string(&mut decoder, tag(TAG_GDAL_METADATA))?
            .as_deref()
            .map(parse_gdal_metadata)
            .unwrap_or_default();

        let metadata = CogMetadata {
            width: base.width,
            height: base.height,
            bands,
            data_type,
            tile_width: base.chunk_width,
            tile_height: base.chunk_height,
            tiles_across: base.chunks_across,
            tiles_down: base.chunks_down,
            is_tiled,
            planar: base.planar && bands > 1,
            geo_transform,
            crs_code,
            nodata,
            metadata_items,
        };

        let mut overviews = Vec::new();
        let mut ifd_index = 0;
        while decoder.more_images() {
            if let Err(e) = decoder.next_image() {
                warn!(path = %path.display(), error = %e, "Stopped scanning IFDs");
                break;
            }
            ifd_index += 1;
            let subfile = find_u32(&mut decoder, tag(TAG_NEW_SUBFILE_TYPE))?.unwrap_or(0);
            // bit 0: reduced resolution, bit 2: transparency mask
            if subfile & 1 == 0 || subfile & 4 != 0 {
                continue;
            }
            let layout = read_layout(&mut decoder, ifd_index)?;
            let scale = ((metadata.width as f64 / layout.width.max(1) as f64).round() as usize).max(1);
            overviews.push(OverviewMetadata {
                width: layout.width,
                height: layout.height,
                tile_width: layout.chunk_width,
                tile_height: layout.chunk_height,
                tiles_across: layout.chunks_across,
                tiles_down: layout.chunks_down,
                scale,
                planar: layout.planar && bands > 1,
                ifd_index,
            });
        }
        overviews.sort_by(|a, b| b.width.cmp(&a.width));

        debug!(
            path = %path.display(),
            width = metadata.width,
            height = metadata.height,
            bands = metadata.bands,
            overviews = overviews.len(),
            "Opened raster"
        );

        // the scan left the decoder on the last IFD
        let decoder = open_decoder(&path)?;

        Ok(Self {
            path,
            decoder,
            current_ifd: 0,
            metadata,
            overviews,
            cache: TileCache::default(),
            chunks_decoded: 0,
        })
    }

    /// Replace the chunk cache with one of a different budget.
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity_bytes: usize) -> Self {
        self.cache = TileCache::new(capacity_bytes);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Chunks decoded from disk so far; cache hits are not counted.
    #[must_use]
    pub fn chunks_decoded(&self) -> usize {
        self.chunks_decoded
    }

    /// Number of pyramid levels including full resolution.
    #[must_use]
    pub fn level_count(&self) -> usize {
        1 + self.overviews.len()
    }

    /// Dimensions of a level (0 = full resolution).
    #[must_use]
    pub fn level_size(&self, level: usize) -> (usize, usize) {
        let layout = self.layout(level);
        (layout.width, layout.height)
    }

    /// Downsample factor of a level.
    #[must_use]
    pub fn level_scale(&self, level: usize) -> usize {
        match level {
            0 => 1,
            n => self.overviews.get(n - 1).map_or(1, |o| o.scale),
        }
    }

    /// Native-CRS bounds, if georeferenced.
    #[must_use]
    pub fn bounds(&self) -> Option<BoundingBox> {
        self.metadata.geo_transform.bounds(self.metadata.width, self.metadata.height)
    }

    /// Coarsest level whose downsample factor does not exceed `factor`
    /// (source pixels per output pixel).
    #[must_use]
    pub fn best_level_for_factor(&self, factor: f64) -> usize {
        let mut best = 0;
        for (i, ovr) in self.overviews.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            if ovr.scale as f64 <= factor {
                best = i + 1;
            }
        }
        best
    }

    fn layout(&self, level: usize) -> LevelLayout {
        match level.checked_sub(1).and_then(|i| self.overviews.get(i)) {
            Some(o) => LevelLayout {
                width: o.width,
                height: o.height,
                chunk_width: o.tile_width,
                chunk_height: o.tile_height,
                chunks_across: o.tiles_across,
                chunks_down: o.tiles_down,
                planar: o.planar,
                ifd_index: o.ifd_index,
            },
            None => LevelLayout {
                width: self.metadata.width,
                height: self.metadata.height,
                chunk_width: self.metadata.tile_width,
                chunk_height: self.metadata.tile_height,
                chunks_across: self.metadata.tiles_across,
                chunks_down: self.metadata.tiles_down,
                planar: self.metadata.planar,
                ifd_index: 0,
            },
        }
    }

    fn seek_ifd(&mut self, ifd_index: usize) -> Result<()> {
        if ifd_index < self.current_ifd {
            self.decoder = open_decoder(&self.path)?;
            self.current_ifd = 0;
        }
        while self.current_ifd < ifd_index {
            self.decoder.next_image()?;
            self.current_ifd += 1;
        }
        Ok(())
    }

    /// Decoded chunk `index` of `level`, served from the cache when possible.
    ///
    /// `index` is the spatial chunk index (row-major); planar files are
    /// gathered across their per-band chunks.
    ///
    /// # Errors
    /// Returns an error if the chunk cannot be decoded.
    pub fn chunk(&mut self, level: usize, index: usize) -> Result<Arc<Chunk>> {
        let key = ChunkKey { level, index };
        if let Some(chunk) = self.cache.get(&key) {
            return Ok(chunk);
        }

        let layout = self.layout(level);
        let per_band = layout.chunks_across * layout.chunks_down;
        if index >= per_band {
            return Err(Error::conversion(format!(
                "chunk {index} out of range for level {level} ({per_band} chunks)"
            )));
        }
        self.seek_ifd(layout.ifd_index)?;

        let bands = self.metadata.bands;
        let (values, cw, ch) = if layout.planar {
            let mut planes = Vec::with_capacity(bands);
            let mut dims = (0, 0);
            for band in 0..bands {
                let (plane, cw, ch) = self.decode(band * per_band + index)?;
                // later bands can come back uncropped at the bottom edge
                if band == 0 {
                    dims = (cw, ch);
                }
                planes.push(plane);
            }
            let pixels = planes.iter().map(Vec::len).min().unwrap_or(0);
            let mut values = Vec::with_capacity(pixels * bands);
            for i in 0..pixels {
                values.extend(planes.iter().map(|plane| plane[i]));
            }
            (values, dims.0, dims.1)
        } else {
            self.decode(index)?
        };

        // the decoder may hand back edge tiles cropped or padded
        let rows = if values.len() == cw * ch * bands { ch } else { layout.chunk_height };
        let width = values.len() / (rows * bands).max(1);
        if width == 0 || rows == 0 {
            return Err(Error::conversion(format!("chunk {index} of level {level} is empty")));
        }

        let chunk = Arc::new(Chunk {
            width,
            height: rows,
            bands,
            values,
        });
        self.cache.insert(key, Arc::clone(&chunk));
        Ok(chunk)
    }

    /// Decode one stored chunk of the current IFD, with its data dimensions.
    fn decode(&mut self, stored_index: usize) -> Result<(Vec<f64>, usize, usize)> {
        let chunk_index = usize_to_u32(stored_index)?;
        let (cw, ch) = self.decoder.chunk_data_dimensions(chunk_index);
        let values = decoding_result_to_f64(self.decoder.read_chunk(chunk_index)?)?;
        self.chunks_decoded += 1;
        Ok((values, u32_to_usize(cw), u32_to_usize(ch)))
    }

    /// Copy the samples of pixel `(col, row)` at `level` into `out`.
    ///
    /// Returns `false` (leaving `out` untouched) if the pixel lies outside the level.
    ///
    /// # Errors
    /// Returns an error if the containing chunk cannot be decoded.
    pub fn read_pixel(&mut self, level: usize, col: usize, row: usize, out: &mut [f64]) -> Result<bool> {
        let layout = self.layout(level);
        if col >= layout.width || row >= layout.height {
            return Ok(false);
        }
        let index = (row / layout.chunk_height) * layout.chunks_across + col / layout.chunk_width;
        let chunk = self.chunk(level, index)?;
        match chunk.pixel(col % layout.chunk_width, row % layout.chunk_height) {
            Some(samples) => {
                let n = out.len().min(samples.len());
                out[..n].copy_from_slice(&samples[..n]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// True if `value` equals the declared nodata (NaN-aware).
    #[inline]
    #[must_use]
    pub fn is_nodata(&self, value: f64) -> bool {
        match self.metadata.nodata {
            Some(nd) if nd.is_nan() => value.is_nan(),
            Some(nd) => value == nd,
            None => value.is_nan(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_test_geotiff, TestRaster};

    #[test]
    fn test_data_type_mapping() {
        assert_eq!(CogDataType::from_tags(8, 1).unwrap(), CogDataType::U8);
        assert_eq!(CogDataType::from_tags(16, 2).unwrap(), CogDataType::I16);
        assert_eq!(CogDataType::from_tags(32, 3).unwrap(), CogDataType::F32);
        assert!(CogDataType::from_tags(12, 1).is_err());
        assert!(CogDataType::F64.is_float());
        assert_eq!(CogDataType::U16.bytes(), 2);
    }

    #[test]
    fn test_parse_crs_prefers_projected() {
        let keys = [1, 1, 0, 3, 1024, 0, 1, 1, 1025, 0, 1, 1, 3072, 0, 1, 32633];
        assert_eq!(parse_crs(&keys), Some(32633));

        let geographic = [1, 1, 0, 2, 1024, 0, 1, 2, 2048, 0, 1, 4326];
        assert_eq!(parse_crs(&geographic), Some(4326));

        let user_defined = [1, 1, 0, 1, 3072, 0, 1, USER_DEFINED];
        assert_eq!(parse_crs(&user_defined), None);
    }

    #[test]
    fn test_geo_transform_from_matrix() {
        let m = vec![10.0, 0.0, 0.0, 500.0, 0.0, -10.0, 0.0, 900.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let gt = parse_geo_transform(None, None, Some(m)).unwrap();
        assert_eq!(gt.origin(), Some((500.0, 900.0)));
        assert_eq!(gt.resolution(), Some((10.0, 10.0)));

        let rotated = vec![10.0, 1.0, 0.0, 500.0, 1.0, -10.0, 0.0, 900.0];
        assert!(parse_geo_transform(None, None, Some(rotated)).is_err());
    }

    #[test]
    fn test_geo_transform_bounds() {
        let gt = GeoTransform::new(100.0, 200.0, 2.0, 4.0);
        let b = gt.bounds(10, 5).unwrap();
        assert_eq!(b, BoundingBox::new(100.0, 180.0, 120.0, 200.0));
    }

    #[test]
    fn test_parse_gdal_metadata() {
        let xml = r#"<GDALMetadata>
  <Item name="RESAMPLING" domain="rio_overview">AVERAGE</Item>
  <Item name="STATISTICS_MINIMUM" sample="0">1.5</Item>
  <Item name="STATISTICS_MAXIMUM" sample="0">99</Item>
</GDALMetadata>"#;
        let items = parse_gdal_metadata(xml);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].domain.as_deref(), Some("rio_overview"));
        assert_eq!(items[1].sample, Some(0));
        assert_eq!(items[2].value, "99");
    }

    #[test]
    fn test_parse_nodata() {
        assert_eq!(parse_nodata("0\0"), Some(0.0));
        assert_eq!(parse_nodata(" -9999 "), Some(-9999.0));
        assert!(parse_nodata("nan").unwrap().is_nan());
        assert_eq!(parse_nodata("abc"), None);
    }

    #[test]
    fn test_open_stripped_geotiff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.tif");
        let raster = TestRaster::gradient(40, 30).with_epsg(32633).with_origin(500_000.0, 5_800_000.0, 10.0);
        write_test_geotiff(&path, &raster).unwrap();

        let mut reader = CogReader::open(&path).unwrap();
        assert_eq!(reader.metadata.width, 40);
        assert_eq!(reader.metadata.height, 30);
        assert_eq!(reader.metadata.bands, 1);
        assert_eq!(reader.metadata.data_type, CogDataType::U8);
        assert_eq!(reader.metadata.crs_code, Some(32633));
        assert!(!reader.metadata.is_tiled);
        assert!(reader.overviews.is_empty());

        let bounds = reader.bounds().unwrap();
        assert!((bounds.maxx - 500_400.0).abs() < 1e-9);
        assert!((bounds.miny - 5_799_700.0).abs() < 1e-9);

        let mut px = [0.0];
        assert!(reader.read_pixel(0, 7, 3, &mut px).unwrap());
        assert!((px[0] - raster.value_at(7, 3, 0)).abs() < 1e-9);
        assert!(!reader.read_pixel(0, 40, 0, &mut px).unwrap());
    }

    #[test]
    fn test_single_strip_larger_than_cache_is_decoded_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strip.tif");
        let raster = TestRaster::gradient(64, 48).with_rows_per_strip(48);
        write_test_geotiff(&path, &raster).unwrap();

        // one 64x48 strip is 24 KiB as f64
        let mut reader = CogReader::open(&path).unwrap().with_cache_capacity(4 * 1024);
        assert_eq!(reader.metadata.tiles_down, 1);

        let mut px = [0.0];
        for row in 0..48 {
            for col in (0..64).step_by(7) {
                assert!(reader.read_pixel(0, col, row, &mut px).unwrap());
                assert!((px[0] - raster.value_at(col, row, 0)).abs() < 1e-9);
            }
        }
        assert_eq!(reader.chunks_decoded(), 1);
    }

    #[test]
    fn test_band_sequential_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planar.tif");
        let raster = TestRaster::rgb(30, 20).band_sequential();
        write_test_geotiff(&path, &raster).unwrap();

        let mut reader = CogReader::open(&path).unwrap();
        assert!(reader.metadata.planar);
        assert_eq!(reader.metadata.bands, 3);

        let mut px = [0.0; 3];
        for (col, row) in [(0, 0), (29, 0), (11, 7), (29, 19)] {
            assert!(reader.read_pixel(0, col, row, &mut px).unwrap());
            for band in 0..3 {
                assert!(
                    (px[band] - raster.value_at(col, row, band)).abs() < 1e-9,
                    "band {band} at ({col}, {row})"
                );
            }
        }
        // three stored strips, one spatial chunk
        assert_eq!(reader.chunks_decoded(), 3);
    }

    #[test]
    fn test_chunk_index_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.tif");
        write_test_geotiff(&path, &TestRaster::gradient(8, 8)).unwrap();
        let mut reader = CogReader::open(&path).unwrap();
        assert!(matches!(reader.chunk(0, 99), Err(Error::Conversion(_))));
    }

    #[test]
    fn test_best_level_without_overviews() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.tif");
        write_test_geotiff(&path, &TestRaster::gradient(8, 8)).unwrap();
        let reader = CogReader::open(&path).unwrap();
        assert_eq!(reader.best_level_for_factor(16.0), 0);
        assert_eq!(reader.level_count(), 1);
    }
}
