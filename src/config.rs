//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::dispatcher::PipelineOptions;
use crate::raster::{check_block_size, RasterOptions, DEFAULT_BLOCK_SIZE};
use crate::vector::ellipse::DEFAULT_ELLIPSE_POINTS;
use crate::vector::tiling::DEFAULT_TILING_TOOL;
use crate::vector::VectorOptions;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "geoswipe",
    about = "Normalize geospatial uploads into web-map layers and serve them",
    version
)]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "GEOSWIPE_BIND", default_value = "0.0.0.0:8000")]
    pub bind: SocketAddr,

    /// Directory receiving uploads
    #[arg(long, env = "GEOSWIPE_UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: PathBuf,

    /// Directory holding processed layers
    #[arg(long, env = "GEOSWIPE_PROCESSED_DIR", default_value = "processed")]
    pub processed_dir: PathBuf,

    /// Conversion worker threads
    #[arg(long, env = "GEOSWIPE_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Conversions that may wait for a worker before submitters block
    #[arg(long, env = "GEOSWIPE_QUEUE_DEPTH", default_value_t = 16)]
    pub queue_depth: usize,

    /// Internal tile size of processed rasters (multiple of 16)
    #[arg(long, env = "GEOSWIPE_BLOCK_SIZE", default_value_t = DEFAULT_BLOCK_SIZE, value_parser = parse_block_size)]
    pub block_size: usize,

    /// Vector tile packager; empty disables packaging
    #[arg(long, env = "GEOSWIPE_TILING_TOOL", default_value = DEFAULT_TILING_TOOL)]
    pub tiling_tool: String,

    /// Points sampled around each change-layer ellipse
    #[arg(long, env = "GEOSWIPE_ELLIPSE_POINTS", default_value_t = DEFAULT_ELLIPSE_POINTS)]
    pub ellipse_points: usize,
}

fn parse_block_size(value: &str) -> std::result::Result<usize, String> {
    let size: usize = value.parse().map_err(|e| format!("{e}"))?;
    check_block_size(size).map_err(|e| e.to_string())
}

impl ServerConfig {
    /// Library-level settings for the conversion pipeline.
    #[must_use]
    pub fn pipeline_options(&self) -> PipelineOptions {
        let tiling_tool = Some(self.tiling_tool.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        PipelineOptions {
            upload_dir: self.upload_dir.clone(),
            processed_dir: self.processed_dir.clone(),
            raster: RasterOptions {
                block_size: self.block_size,
                ..RasterOptions::default()
            },
            vector: VectorOptions {
                ellipse_points: self.ellipse_points,
                tiling_tool,
            },
        }
    }
}
