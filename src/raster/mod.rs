//! Raster normalization: any georeferenced GeoTIFF in, a tiled, compressed
//! Web Mercator COG with an internal overview pyramid out.
//!
//! The pipeline runs in three passes over an on-disk [`scratch::ScratchStore`]:
//! [`warp::warp_into`] fills full resolution, [`pyramid::build_overviews`]
//! derives each overview from the level below, and the
//! [`GeoTiffWriter`] streams every level into the final file.

pub mod pyramid;
pub mod scratch;
pub mod warp;

use std::io::{BufWriter, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::info;

use crate::cog_reader::CogReader;
use crate::error::{Error, Result};
use crate::geometry::{BoundingBox, WEB_MERCATOR};
use crate::geotiff_writer::{CogLayout, GeoTiffWriter};
use crate::tile_cache::DEFAULT_CAPACITY_BYTES;

/// Candidate overview factors, finest first.
pub const OVERVIEW_CANDIDATES: [usize; 6] = [2, 4, 8, 16, 32, 64];

/// An overview is kept only while its shorter side stays at least this long.
pub const MIN_OVERVIEW_DIMENSION: usize = 64;

/// Default output tile edge.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Output tiles must be a positive multiple of this edge.
pub const BLOCK_ALIGNMENT: usize = 16;

/// Reject tile edges the writer cannot produce.
///
/// # Errors
/// [`Error::Validation`] unless `block_size` is a positive multiple of
/// [`BLOCK_ALIGNMENT`].
pub fn check_block_size(block_size: usize) -> Result<usize> {
    if block_size == 0 || block_size % BLOCK_ALIGNMENT != 0 {
        return Err(Error::validation(format!(
            "block size {block_size} is not a positive multiple of {BLOCK_ALIGNMENT}"
        )));
    }
    Ok(block_size)
}

/// Overview factors worth building for a `width x height` image.
///
/// ```
/// assert_eq!(geoswipe::raster::overview_levels(1000, 300), vec![2, 4]);
/// assert!(geoswipe::raster::overview_levels(100, 100).is_empty());
/// ```
#[must_use]
pub fn overview_levels(width: usize, height: usize) -> Vec<usize> {
    let shortest = width.min(height);
    OVERVIEW_CANDIDATES
        .iter()
        .copied()
        .take_while(|&f| shortest / f >= MIN_OVERVIEW_DIMENSION)
        .collect()
}

#[derive(Debug, Clone)]
pub struct RasterOptions {
    pub block_size: usize,
    /// Budget of the source chunk cache.
    pub cache_bytes: usize,
    pub deflate_level: u32,
}

impl Default for RasterOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            cache_bytes: DEFAULT_CAPACITY_BYTES,
            deflate_level: 6,
        }
    }
}

/// What [`normalize_raster`] produced.
#[derive(Debug, Clone)]
pub struct RasterSummary {
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub overviews: Vec<usize>,
    /// EPSG:3857 bounds.
    pub bounds: BoundingBox,
}

/// Reproject `input` to EPSG:3857 and write it to `output` as a tiled COG.
///
/// The output is staged in a temporary file next to `output` and only moved
/// into place once fully written, so a failure leaves nothing behind.
///
/// # Errors
/// Returns [`Error::Conversion`] if the source cannot be read, carries no
/// CRS, or anything fails while writing.
pub fn normalize_raster(input: &Path, output: &Path, options: &RasterOptions) -> Result<RasterSummary> {
    normalize(input, output, options).map_err(Error::into_conversion)
}

fn normalize(input: &Path, output: &Path, options: &RasterOptions) -> Result<RasterSummary> {
    check_block_size(options.block_size)?;
    let mut reader = CogReader::open(input)?.with_cache_capacity(options.cache_bytes);
    let src_crs = reader
        .metadata
        .crs_code
        .ok_or_else(|| Error::conversion("Raster has no coordinate reference system"))?;

    let grid = warp::suggested_grid(&reader, src_crs)?;
    let nodata = reader.metadata.nodata.unwrap_or(0.0);
    let mut layout = CogLayout {
        width: grid.width,
        height: grid.height,
        bands: reader.metadata.bands,
        data_type: reader.metadata.data_type,
        block_size: options.block_size,
        crs: WEB_MERCATOR,
        origin: grid.origin,
        resolution: grid.resolution,
        nodata,
        overviews: overview_levels(grid.width, grid.height),
        statistics: Vec::new(),
    };

    let mut store = scratch::ScratchStore::new(&layout)?;
    let stats = warp::warp_into(&mut reader, src_crs, &grid, &layout, &mut store)?;
    pyramid::build_overviews(&mut store, &layout, nodata)?;
    layout.statistics = stats.into_ranges();

    let dir = output.parent().unwrap_or_else(|| Path::new("."));
    let staged = NamedTempFile::new_in(dir)?;
    let mut writer = BufWriter::new(staged.as_file());
    GeoTiffWriter::new(&layout)
        .deflate_level(options.deflate_level)
        .write_to(&mut writer, &mut store)?;
    writer.flush()?;
    drop(writer);
    staged.persist(output).map_err(|e| Error::Io(e.error))?;

    info!(
        input = %input.display(),
        output = %output.display(),
        width = layout.width,
        height = layout.height,
        overviews = ?layout.overviews,
        "Raster normalized"
    );

    Ok(RasterSummary {
        width: layout.width,
        height: layout.height,
        bands: layout.bands,
        overviews: layout.overviews.clone(),
        bounds: grid.bounds(),
    })
}
