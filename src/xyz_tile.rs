//! XYZ tile rendering from processed rasters.
//!
//! Tiles are sampled nearest-neighbour from the coarsest pyramid level that
//! still resolves the tile, then encoded as RGBA PNG. A tile that misses the
//! raster entirely is answered with [`TRANSPARENT_PNG`] instead of an error so
//! panning map clients never see failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use geoswipe::xyz_tile::{render_tile, DEFAULT_TILE_SIZE};
//!
//! let tile = render_tile(Path::new("processed/dem_1.tif"), 8, 135, 87, DEFAULT_TILE_SIZE)?;
//! std::fs::write("tile.png", tile.as_bytes())?;
//! ```

use std::io::Cursor;
use std::path::Path;

use image::{ImageFormat, Rgba, RgbaImage};
use serde::Serialize;
use tracing::debug;

use crate::casting::{f64_to_pixel_index, usize_to_u32};
use crate::cog_reader::{CogDataType, CogReader};
use crate::error::{Error, Result};
use crate::geometry::projection::{is_geographic_crs, MERCATOR_HALF_EXTENT, MERCATOR_MAX_LAT};
use crate::geometry::{BoundingBox, CoordTransformer, WEB_MERCATOR, WGS84};

pub const DEFAULT_TILE_SIZE: usize = 256;

/// Deepest zoom accepted in a tile address.
pub const MAX_ZOOM: u32 = 30;

/// Deepest zoom advertised by [`raster_info`].
const MAX_ADVERTISED_ZOOM: u32 = 24;

/// A 1×1 fully transparent RGBA PNG.
pub const TRANSPARENT_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48,
    0x44, 0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00,
    0x00, 0x1f, 0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0b, 0x49, 0x44, 0x41, 0x54, 0x78,
    0x9c, 0x63, 0x60, 0x00, 0x02, 0x00, 0x00, 0x05, 0x00, 0x01, 0x7a, 0x5e, 0xab, 0x3f,
    0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// A rendered tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileImage {
    /// The tile lies outside the raster.
    Empty,
    Png(Vec<u8>),
}

impl TileImage {
    /// PNG bytes to send.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Empty => TRANSPARENT_PNG,
            Self::Png(bytes) => bytes,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Check that `(z, x, y)` addresses a real tile.
///
/// # Errors
/// Returns [`Error::Validation`] for zooms above [`MAX_ZOOM`] or columns/rows
/// outside the zoom's grid.
pub fn validate_address(z: u32, x: u32, y: u32) -> Result<()> {
    if z > MAX_ZOOM {
        return Err(Error::validation(format!("Zoom {z} exceeds maximum of {MAX_ZOOM}")));
    }
    let n = 1u64 << z;
    if u64::from(x) >= n || u64::from(y) >= n {
        return Err(Error::validation(format!("Tile {z}/{x}/{y} is outside the tile grid")));
    }
    Ok(())
}

/// Pixel values sampled for one tile, before colouring.
struct TileData {
    /// Pixel-interleaved band values.
    pixels: Vec<f64>,
    valid: Vec<bool>,
    bands: usize,
    size: usize,
}

/// Render tile `z/x/y` of the raster at `path` as a `size`×`size` PNG.
///
/// # Errors
/// Validation error for a bad address; any read or encode failure otherwise.
pub fn render_tile(path: &Path, z: u32, x: u32, y: u32, size: usize) -> Result<TileImage> {
    validate_address(z, x, y)?;
    let size = size.clamp(1, 4096);
    let mut reader = CogReader::open(path)?;
    let crs = reader
        .metadata
        .crs_code
        .ok_or_else(|| Error::conversion("Raster has no coordinate reference system"))?;

    let extent = BoundingBox::from_xyz(z, x, y);
    let Some(raster_extent) = mercator_bounds(&reader, crs)? else {
        return Ok(TileImage::Empty);
    };
    if !raster_extent.intersects(&extent) {
        debug!(z, x, y, "Tile outside raster");
        return Ok(TileImage::Empty);
    }

    let tile = extract_tile(&mut reader, crs, &extent, size)?;
    let image = colorize(&reader, &tile);
    Ok(TileImage::Png(encode_png(&image)?))
}

/// Raster footprint in Web Mercator, or `None` if it lies entirely beyond
/// the Mercator latitude limit.
fn mercator_bounds(reader: &CogReader, crs: i32) -> Result<Option<BoundingBox>> {
    let bounds = reader
        .bounds()
        .ok_or_else(|| Error::conversion("Raster has no geotransform"))?;
    if is_geographic_crs(crs) && (bounds.miny >= MERCATOR_MAX_LAT || bounds.maxy <= -MERCATOR_MAX_LAT) {
        return Ok(None);
    }
    let to_mercator = CoordTransformer::new(crs, WEB_MERCATOR).map_err(Error::conversion)?;
    let projected = to_mercator.transform_bounds(&bounds, 21).map_err(Error::conversion)?;
    Ok(Some(projected))
}

fn extract_tile(reader: &mut CogReader, crs: i32, extent: &BoundingBox, size: usize) -> Result<TileData> {
    let transformer = CoordTransformer::new(WEB_MERCATOR, crs).map_err(Error::conversion)?;
    let gt = reader.metadata.geo_transform;
    let ((origin_x, origin_y), (res_x, res_y)) = gt
        .origin()
        .zip(gt.resolution())
        .ok_or_else(|| Error::conversion("Raster has no geotransform"))?;

    // source pixels per output pixel at full resolution
    #[allow(clippy::cast_precision_loss)]
    let factor = transformer
        .transform_bounds(extent, 8)
        .map(|src| (src.width() / res_x).abs().max((src.height() / res_y).abs()) / size as f64)
        .unwrap_or(1.0);
    let level = reader.best_level_for_factor(factor);
    #[allow(clippy::cast_precision_loss)]
    let scale = reader.level_scale(level) as f64;
    let (level_width, level_height) = reader.level_size(level);
    let (level_res_x, level_res_y) = (res_x * scale, res_y * scale);

    let bands = reader.metadata.bands;
    let mut tile = TileData {
        pixels: vec![0.0; size * size * bands],
        valid: vec![false; size * size],
        bands,
        size,
    };
    let mut samples = vec![0.0; bands];

    #[allow(clippy::cast_precision_loss)]
    let out_res = extent.width() / size as f64;
    for out_y in 0..size {
        #[allow(clippy::cast_precision_loss)]
        let merc_y = extent.maxy - (out_y as f64 + 0.5) * out_res;
        for out_x in 0..size {
            #[allow(clippy::cast_precision_loss)]
            let merc_x = extent.minx + (out_x as f64 + 0.5) * out_res;
            let Ok((world_x, world_y)) = transformer.transform(merc_x, merc_y) else {
                continue;
            };

            let src_col = (world_x - origin_x) / level_res_x;
            let src_row = (origin_y - world_y) / level_res_y;
            let (Some(col), Some(row)) = (
                f64_to_pixel_index(src_col, level_width),
                f64_to_pixel_index(src_row, level_height),
            ) else {
                continue;
            };

            if !reader.read_pixel(level, col, row, &mut samples)? {
                continue;
            }
            if samples.iter().all(|&v| reader.is_nodata(v)) {
                continue;
            }
            let idx = out_y * size + out_x;
            tile.valid[idx] = true;
            tile.pixels[idx * bands..(idx + 1) * bands].copy_from_slice(&samples);
        }
    }
    debug!(level, factor, bands, "Sampled tile");
    Ok(tile)
}

/// Per-band `(min, max)` used to map values onto 0..=255.
fn stretch_ranges(reader: &CogReader, tile: &TileData) -> Vec<(f64, f64)> {
    (0..tile.bands)
        .map(|band| {
            if reader.metadata.data_type == CogDataType::U8 {
                return (0.0, 255.0);
            }
            reader.metadata.band_statistics(band).unwrap_or_else(|| {
                tile.valid
                    .iter()
                    .enumerate()
                    .filter(|(_, &ok)| ok)
                    .map(|(i, _)| tile.pixels[i * tile.bands + band])
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
            })
        })
        .collect()
}

fn to_byte(value: f64, (min, max): (f64, f64)) -> u8 {
    if max.is_nan() || min.is_nan() || max <= min {
        return if value.is_finite() { 255 } else { 0 };
    }
    // clamped to 0..=255 first
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let byte = ((value - min) / (max - min) * 255.0).round().clamp(0.0, 255.0) as u8;
    byte
}

fn colorize(reader: &CogReader, tile: &TileData) -> RgbaImage {
    let ranges = stretch_ranges(reader, tile);
    let size = u32::try_from(tile.size).unwrap_or(u32::MAX);
    let mut image = RgbaImage::new(size, size);

    for (idx, &valid) in tile.valid.iter().enumerate() {
        if !valid {
            continue;
        }
        let px = &tile.pixels[idx * tile.bands..(idx + 1) * tile.bands];
        let byte = |band: usize| to_byte(px[band], ranges[band]);
        let rgba = match tile.bands {
            1 | 2 => {
                let v = byte(0);
                Rgba([v, v, v, 255])
            }
            3 => Rgba([byte(0), byte(1), byte(2), 255]),
            _ => Rgba([byte(0), byte(1), byte(2), byte(3)]),
        };
        let (Ok(x), Ok(y)) = (usize_to_u32(idx % tile.size), usize_to_u32(idx / tile.size)) else {
            continue;
        };
        image.put_pixel(x, y, rgba);
    }
    image
}

fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| Error::conversion(format!("PNG encoding failed: {e}")))?;
    Ok(out.into_inner())
}

/// Per-band description in [`RasterInfo`].
#[derive(Debug, Clone, Serialize)]
pub struct BandInfo {
    /// 1-based, as map clients expect.
    pub index: usize,
    pub data_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Viewport metadata for a processed raster.
#[derive(Debug, Clone, Serialize)]
pub struct RasterInfo {
    /// `[west, south, east, north]` in degrees.
    pub bounds: [f64; 4],
    /// `[lon, lat]`.
    pub center: [f64; 2],
    pub minzoom: u32,
    pub maxzoom: u32,
    pub width: usize,
    pub height: usize,
    pub crs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodata: Option<f64>,
    pub band_metadata: Vec<BandInfo>,
}

/// Geographic bounds, usable zoom range and bands of the raster at `path`.
///
/// # Errors
/// Returns an error if the raster cannot be read or is not georeferenced.
pub fn raster_info(path: &Path) -> Result<RasterInfo> {
    let reader = CogReader::open(path)?;
    let meta = &reader.metadata;
    let crs = meta
        .crs_code
        .ok_or_else(|| Error::conversion("Raster has no coordinate reference system"))?;
    let native = reader
        .bounds()
        .ok_or_else(|| Error::conversion("Raster has no geotransform"))?;

    let geographic = CoordTransformer::new(crs, WGS84)
        .and_then(|t| t.transform_bounds(&native, 21))
        .map_err(Error::conversion)?;
    let (minzoom, maxzoom) = match mercator_bounds(&reader, crs)? {
        Some(merc) => zoom_range(&merc, meta.width, meta.height),
        None => (0, 0),
    };

    let band_metadata = (0..meta.bands)
        .map(|band| {
            let stats = meta.band_statistics(band);
            BandInfo {
                index: band + 1,
                data_type: meta.data_type.name(),
                min: stats.map(|s| s.0),
                max: stats.map(|s| s.1),
            }
        })
        .collect();

    Ok(RasterInfo {
        bounds: [geographic.minx, geographic.miny, geographic.maxx, geographic.maxy],
        center: [
            (geographic.minx + geographic.maxx) / 2.0,
            (geographic.miny + geographic.maxy) / 2.0,
        ],
        minzoom,
        maxzoom,
        width: meta.width,
        height: meta.height,
        crs: format!("EPSG:{crs}"),
        nodata: meta.nodata,
        band_metadata,
    })
}

/// Zooms at which the whole raster fits in one tile, and at which a tile
/// pixel matches a raster pixel.
fn zoom_range(merc: &BoundingBox, width: usize, height: usize) -> (u32, u32) {
    let world = 2.0 * MERCATOR_HALF_EXTENT;
    #[allow(clippy::cast_precision_loss)]
    let resolution = (merc.width() / width.max(1) as f64).min(merc.height() / height.max(1) as f64);
    #[allow(clippy::cast_precision_loss)]
    let tile_span = DEFAULT_TILE_SIZE as f64;

    let zoom = |value: f64| -> u32 {
        if !value.is_finite() || value <= 0.0 {
            return 0;
        }
        // bounded to 0..=MAX_ADVERTISED_ZOOM before the cast
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let z = value.clamp(0.0, f64::from(MAX_ADVERTISED_ZOOM)) as u32;
        z
    };
    let maxzoom = zoom((world / (tile_span * resolution)).log2().ceil());
    let minzoom = zoom((world / merc.width().max(merc.height())).log2().floor()).min(maxzoom);
    (minzoom, maxzoom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_test_geotiff, TestRaster};

    fn decode(tile: &TileImage) -> RgbaImage {
        image::load_from_memory(tile.as_bytes()).unwrap().to_rgba8()
    }

    #[test]
    fn test_transparent_png() {
        let img = image::load_from_memory(TRANSPARENT_PNG).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (1, 1));
        assert_eq!(img.get_pixel(0, 0)[3], 0);
        assert_eq!(image::guess_format(TRANSPARENT_PNG).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(validate_address(0, 0, 0).is_ok());
        assert!(validate_address(2, 3, 3).is_ok());
        assert!(matches!(validate_address(2, 4, 0), Err(Error::Validation(_))));
        assert!(matches!(validate_address(31, 0, 0), Err(Error::Validation(_))));
    }

    #[test]
    fn test_zoom_zero_miss_is_transparent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("polar.tif");
        // 88.5N..89.5N lies above the Mercator limit
        write_test_geotiff(&path, &TestRaster::gradient(100, 100).with_origin(10.0, 89.5, 0.01)).unwrap();

        let tile = render_tile(&path, 0, 0, 0, DEFAULT_TILE_SIZE).unwrap();
        assert!(tile.is_empty());
        assert_eq!(tile.as_bytes(), TRANSPARENT_PNG);
    }

    #[test]
    fn test_distant_tile_is_transparent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        write_test_geotiff(&path, &TestRaster::gradient(300, 200)).unwrap();
        // south-west quadrant; the raster sits near 10E 49N
        assert!(render_tile(&path, 1, 0, 1, DEFAULT_TILE_SIZE).unwrap().is_empty());
    }

    #[test]
    fn test_partial_tile_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        write_test_geotiff(&path, &TestRaster::gradient(300, 200)).unwrap();

        // 8/135/87 spans roughly 9.84E..11.25E, 49.0N..49.8N
        let tile = render_tile(&path, 8, 135, 87, 64).unwrap();
        let img = decode(&tile);
        assert_eq!(img.dimensions(), (64, 64));
        // west of 10E is outside the raster
        assert_eq!(img.get_pixel(0, 32)[3], 0);
        let inside = img.get_pixel(48, 32);
        assert_eq!(inside[3], 255);
        assert_eq!(inside[0], inside[1]);
        assert!(inside[0] > 0);
    }

    #[test]
    fn test_nodata_is_transparent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holes.tif");
        let raster = TestRaster::gradient(300, 200).with_nodata_block(0.0, 0..300, 0..200);
        write_test_geotiff(&path, &raster).unwrap();

        let img = decode(&render_tile(&path, 8, 135, 87, 32).unwrap());
        assert!(img.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn test_float_raster_is_stretched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.tif");
        write_test_geotiff(&path, &TestRaster::float(300, 200)).unwrap();

        let img = decode(&render_tile(&path, 8, 135, 87, 64).unwrap());
        let opaque: Vec<u8> = img.pixels().filter(|p| p[3] == 255).map(|p| p[0]).collect();
        assert!(!opaque.is_empty());
        // the tile's own range maps onto the full byte range
        assert_eq!(opaque.iter().min(), Some(&0));
        assert_eq!(opaque.iter().max(), Some(&255));
    }

    #[test]
    fn test_raster_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        write_test_geotiff(&path, &TestRaster::gradient(300, 200)).unwrap();

        let info = raster_info(&path).unwrap();
        assert!((info.bounds[0] - 10.0).abs() < 1e-9);
        assert!((info.bounds[1] - 48.0).abs() < 1e-9);
        assert!((info.bounds[2] - 13.0).abs() < 1e-9);
        assert!((info.bounds[3] - 50.0).abs() < 1e-9);
        assert!((info.center[0] - 11.5).abs() < 1e-9);
        assert!((7..=9).contains(&info.maxzoom), "maxzoom {}", info.maxzoom);
        assert!(info.minzoom <= info.maxzoom);
        assert_eq!(info.crs, "EPSG:4326");
        assert_eq!(info.band_metadata.len(), 1);
        assert_eq!(info.band_metadata[0].data_type, "uint8");
    }
}
