#![doc = include_str!("../README.md")]
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`format`]: Filename classification into raster / vector kinds
//! - [`ingest`]: Chunked upload streaming into incoming storage
//! - [`raster`]: Reprojection to Web Mercator, pyramid building, COG output
//! - [`vector`]: GeoJSON / shapefile normalization to EPSG:4326 and PMTiles packaging
//! - [`dispatcher`]: Bounded worker pool running one normalizer per job
//! - [`range`]: HTTP Range planning and chunked file streaming
//! - [`xyz_tile`]: XYZ tile rendering with [`TileImage`] output
//! - [`catalog`]: Layer discovery and deletion by directory scan
//! - [`cog_reader`]: GeoTIFF metadata parsing and chunk reads
//! - [`geotiff_writer`]: Tiled BigTIFF writer with overviews and GeoKeys
//! - [`geometry`]: Coordinate types ([`BoundingBox`]) and projections
//! - [`tile_cache`]: Per-reader LRU cache for decoded chunks
//! - [`server`]: axum routes over all of the above

// ============================================================================
// Public modules
// ============================================================================

pub mod casting;
pub mod catalog;
pub mod cog_reader;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod format;
pub mod geometry;
pub mod geotiff_writer;
pub mod ingest;
pub mod range;
pub mod raster;
pub mod server;
pub mod tile_cache;
pub mod vector;
pub mod xyz_tile;

#[doc(hidden)]
pub mod testing;

// ============================================================================
// Errors
// ============================================================================

pub use error::{Error, Result};

// ============================================================================
// Pipeline
// ============================================================================
// Primary API: Dispatcher::start(Pipeline::new(options), workers, depth)?.submit(job).await

pub use dispatcher::{ConversionJob, ConversionResult, Dispatcher, Pipeline, PipelineOptions};
pub use format::{classify, FileKind, LayerKind};
pub use ingest::UploadedAsset;
pub use raster::{normalize_raster, RasterOptions, RasterSummary};
pub use vector::{normalize_vector, VectorOptions, VectorOutcome};

// ============================================================================
// Serving
// ============================================================================

pub use catalog::{LayerEntry, UploadEntry};
pub use range::{ByteRange, RangeSpec, ServePlan};
pub use xyz_tile::{render_tile, raster_info, RasterInfo, TileImage};

// ============================================================================
// Raster I/O
// ============================================================================

pub use cog_reader::{CogDataType, CogMetadata, CogReader, GeoTransform, OverviewMetadata};
pub use geotiff_writer::{CogLayout, GeoTiffWriter, TileSource};
pub use tile_cache::TileCache;

// ============================================================================
// Geometry & Projections
// ============================================================================

pub use geometry::projection::{get_proj_string, is_geographic_crs, project_point};
pub use geometry::{BoundingBox, CoordTransformer};
